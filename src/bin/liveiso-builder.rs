use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use liveiso_builder::arch::Arch;
use liveiso_builder::artifact::initramfs::{read_segments, InitramfsVariant};
use liveiso_builder::artifact::iso::embed::read_header;
use liveiso_builder::config::load_build_config;
use liveiso_builder::context::{resolve_build_id, BuildContext};
use liveiso_builder::ledger::Ledger;
use liveiso_builder::live::{self, Outcome};

/// Build live ISO and PXE media from a finished build
#[derive(Debug, Parser)]
#[clap(name = "liveiso-builder", version)]
struct App {
    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Produce the live (or legacy installer) media for a build
    Build {
        /// Build id; defaults to the newest build in builds.json
        #[clap(long)]
        build: Option<String>,
        /// Target architecture; defaults to the host's
        #[clap(long)]
        arch: Option<Arch>,
        /// Build installer-only media instead of the live system
        #[clap(long)]
        legacy_installer: bool,
        /// Rebuild even if the ledger already records the image
        #[clap(long)]
        force: bool,
        /// Builder configuration
        #[clap(long, default_value = "liveiso.toml")]
        config: PathBuf,
    },
    /// Print the Ignition offset header of an ISO
    ShowHeader { iso: PathBuf },
    /// List the segments of a composed initramfs
    InspectInitramfs { file: PathBuf },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("liveiso_builder=info,warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    match App::parse().cmd {
        Command::Build {
            build,
            arch,
            legacy_installer,
            force,
            config,
        } => {
            let config = load_build_config(&config)?;
            let arch = match arch {
                Some(arch) => arch,
                None => Arch::host()?,
            };
            let variant = if legacy_installer {
                InitramfsVariant::LegacyInstaller
            } else {
                InitramfsVariant::Live
            };
            let build_id = resolve_build_id(&config.builds_dir, build.as_deref())?;
            let ctx = BuildContext::new(config, &build_id, arch, variant, force);
            let ledger = Ledger::load(&ctx.build_dir())?;

            match live::run(&ctx, ledger)? {
                Outcome::Skipped { key } => {
                    println!("{key} already present in build {build_id}, nothing to do");
                }
                Outcome::Built { artifacts, .. } => {
                    for artifact in artifacts {
                        println!("{}  {}", artifact.sha256, artifact.path.display());
                    }
                }
            }
        }
        Command::ShowHeader { iso } => match read_header(&iso)? {
            Some(header) => {
                println!("offset: {}", header.offset);
                println!("length: {}", header.length);
            }
            None => println!("{}: no ignition offset header", iso.display()),
        },
        Command::InspectInitramfs { file } => {
            let bytes =
                std::fs::read(&file).with_context(|| format!("reading '{}'", file.display()))?;
            for (idx, segment) in read_segments(&bytes)?.iter().enumerate() {
                println!("segment {idx} ({:?})", segment.compression);
                for entry in &segment.entries {
                    println!("  {:06o} {:>10} {}", entry.mode, entry.data.len(), entry.name);
                }
            }
        }
    }
    Ok(())
}
