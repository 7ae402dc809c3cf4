//! The live media build.
//!
//! One run turns a finished build (`builds/<id>/<arch>/meta.json` plus its
//! ostree commit) into live media:
//!
//! 1. skip if the ledger already records the disc image (unless forced)
//! 2. check inputs and host tools
//! 3. check out the commit, find kernel and initramfs
//! 4. squash the root filesystem (live only)
//! 5. pack osmet metadata for the metal image (if enabled)
//! 6. compose the disc and PXE initramfs
//! 7. assemble the disc image, embed the Ignition offset header
//! 8. move outputs into the build directory and record them in the ledger

use anyhow::{Context, Result};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::info;

use crate::artifact::filesystem::{atomic_move, recreate_dir};
use crate::artifact::initramfs::{compose, ComposeRequest};
use crate::artifact::iso::embed::embed_ignition_offset;
use crate::artifact::iso::kargs::{volume_id, KernelArguments};
use crate::artifact::iso::{assemble, IsoInputs};
use crate::artifact::squashfs::{build_squashfs, SquashfsOptions};
use crate::commit::{baked_kernel_args, find_kernel, CommitStore, EFI_SUBPATH};
use crate::config::OsmetMode;
use crate::context::{BuildContext, OutputNames};
use crate::error::BuildError;
use crate::ledger::{ArtifactRole, BuildArtifact, Ledger, BUILD_TIMESTAMP_KEY};
use crate::osmet::{generate_osmet, OsmetRequest};
use crate::preflight::{check_required_tools, required_tools};

/// Disc path of the live root filesystem.
pub const ISO_ROOTFS_IMG: &str = "images/rootfs.img";

/// Result of a run.
#[derive(Debug)]
pub enum Outcome {
    /// The ledger already had `key`; nothing was done.
    Skipped { key: &'static str },
    /// Outputs were produced and the ledger persisted.
    Built {
        ledger: Ledger,
        artifacts: Vec<BuildArtifact>,
    },
}

fn product_name(ctx: &BuildContext, ledger: &Ledger) -> Result<String> {
    ctx.config
        .product_name
        .clone()
        .or_else(|| ledger.meta().name.clone())
        .ok_or_else(|| {
            BuildError::Precondition(
                "product name is neither configured nor recorded in the build".into(),
            )
            .into()
        })
}

/// Build live (or legacy installer) media for the build in `ledger`.
pub fn run(ctx: &BuildContext, ledger: Ledger) -> Result<Outcome> {
    let live = ctx.is_live();
    let iso_key = ArtifactRole::Iso.key(live);
    if ledger.has_image(iso_key) && !ctx.force {
        info!(key = iso_key, build = %ctx.build_id, "already built, use --force to rebuild");
        return Ok(Outcome::Skipped { key: iso_key });
    }

    let config = &ctx.config;
    let tools = &config.tools;
    let product = product_name(ctx, &ledger)?;
    let build_id = ledger.meta().build_id.clone();
    let commit = ledger.meta().ostree_commit.clone();
    let names = OutputNames::new(&product, &build_id, ctx.variant, ctx.arch);

    let metal = match config.osmet.mode {
        OsmetMode::Disabled => None,
        _ => {
            let path = ledger.require_image_path("metal")?;
            let sha256 = ledger
                .image("metal")
                .map(|e| e.sha256.clone())
                .unwrap_or_default();
            Some((path, sha256))
        }
    };

    check_required_tools(&required_tools(
        ctx.arch,
        ctx.variant,
        config.osmet.mode,
        tools,
    ))?;

    let work = ctx.work_dir();
    recreate_dir(&work)?;
    info!(build = %build_id, arch = %ctx.arch, variant = ctx.variant.label(), "building live media");

    let rootfs = work.join("rootfs");
    CommitStore::new(&tools.ostree, &config.ostree_repo).checkout(&commit, &rootfs)?;
    let boot = find_kernel(&rootfs)?;
    let efi_dir = rootfs.join(EFI_SUBPATH);
    let efi_dir = efi_dir.is_dir().then_some(efi_dir);

    let volid = volume_id(&product, &build_id);
    let kargs = KernelArguments::for_live(baked_kernel_args(&rootfs)?, &volid);
    info!(volume_id = %volid, kargs = %kargs, "kernel command line");

    let squashfs = if live {
        let out = work.join("root.squashfs");
        build_squashfs(
            &tools.mksquashfs,
            &rootfs,
            &out,
            &SquashfsOptions {
                compression: &config.squashfs_compression,
                ..Default::default()
            },
        )?;
        Some(out)
    } else {
        None
    };

    let osmet = match &metal {
        Some((image, sha256)) => {
            let description = format!("{product} {build_id} {}", ctx.arch);
            let output = work.join(&names.osmet);
            let req = OsmetRequest {
                metal_image: image,
                description: &description,
                checksum: sha256,
                output: &output,
            };
            generate_osmet(&config.osmet, tools, &req)?
        }
        None => None,
    };

    let disc_initramfs = work.join("initramfs.img");
    let pxe_initramfs = work.join("pxe-initramfs.img");
    let composition = compose(
        &ComposeRequest {
            base: &boot.initramfs,
            variant: ctx.variant,
            osmet: osmet.as_deref(),
            for_pxe: live,
            rootfs: squashfs.as_deref(),
            work_dir: &work.join("segments"),
            output: &disc_initramfs,
            pxe_output: live.then_some(pxe_initramfs.as_path()),
        },
        tools,
    )?;

    let iso_path = work.join(&names.iso);
    let mut extra_files = Vec::new();
    if let Some(squashfs) = &squashfs {
        extra_files.push((ISO_ROOTFS_IMG.to_string(), squashfs.as_path()));
    }
    let assembled = assemble(
        &IsoInputs {
            arch: ctx.arch,
            volume_id: &volid,
            kargs: &kargs,
            kernel: &boot.kernel,
            initramfs: &composition.disc.path,
            config_dir: &config.live_config_dir,
            efi_dir: efi_dir.as_deref(),
            syslinux_dir: &config.syslinux_dir,
            ignition_padding: live.then_some(config.initrd_ignition_padding),
            extra_files,
            work_dir: &work.join("disc"),
            output: &iso_path,
        },
        tools,
    )?;

    if let Some(padding) = assembled.ignition_padding {
        embed_ignition_offset(
            &tools.isoinfo,
            &assembled.path,
            &assembled.ramdisk_name,
            assembled.ramdisk_size,
            padding,
        )?;
    }

    // Published initramfs: the PXE one for live media, the disc one otherwise.
    let initramfs_src = composition
        .pxe
        .as_ref()
        .map(|pxe| pxe.path.clone())
        .unwrap_or(composition.disc.path);

    let build_dir = ledger.build_dir().to_path_buf();
    let mut outputs: Vec<(ArtifactRole, PathBuf, PathBuf)> = vec![
        (ArtifactRole::Iso, assembled.path, build_dir.join(&names.iso)),
        (ArtifactRole::Kernel, boot.kernel, build_dir.join(&names.kernel)),
        (ArtifactRole::Initramfs, initramfs_src, build_dir.join(&names.initramfs)),
    ];
    if let Some(squashfs) = squashfs {
        outputs.push((ArtifactRole::Rootfs, squashfs, build_dir.join(&names.rootfs)));
    }

    let mut artifacts = Vec::with_capacity(outputs.len());
    for (role, src, dest) in outputs {
        publish(&src, &dest)?;
        artifacts.push(BuildArtifact::from_file(role, &dest)?);
    }

    let mut ledger = ledger;
    for artifact in &artifacts {
        ledger = ledger.with_artifact(artifact, live)?;
    }
    let now = OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .context("formatting build timestamp")?;
    let ledger = ledger.with_field(BUILD_TIMESTAMP_KEY, Value::from(now));
    ledger.persist()?;

    for artifact in &artifacts {
        info!(path = %artifact.path.display(), sha256 = %artifact.sha256, "recorded");
    }
    Ok(Outcome::Built { ledger, artifacts })
}

fn publish(src: &Path, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    atomic_move(src, dest)
        .with_context(|| format!("publishing '{}'", dest.display()))
}
