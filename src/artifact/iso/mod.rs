//! Bootable disc image assembly.
//!
//! [`assemble`] stages a disc tree from the live config templates, the
//! kernel and the composed initramfs, hands the tree to the handler for the
//! target architecture and runs the resulting generator command:
//!
//! | arch    | BIOS     | UEFI          | generator        |
//! |---------|----------|---------------|------------------|
//! | x86_64  | isolinux | efiboot.img   | genisoimage      |
//! | aarch64 |          | efiboot.img   | genisoimage      |
//! | ppc64le |          |               | grub2-mkrescue   |
//! | s390x   |          |               | xorrisofs        |

pub mod bios;
pub mod efi;
pub mod embed;
pub mod kargs;
pub mod ppc64le;
pub mod s390x;

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::arch::Arch;
use crate::artifact::filesystem::{copy_dir_recursive, recreate_dir, render_template_tree};
use crate::artifact::initramfs::append_padding;
use crate::config::Tools;
use crate::error::BuildError;
use crate::process::Cmd;
use kargs::KernelArguments;

/// Placeholder replaced with the live kernel command line in templates.
pub const KERNEL_ARGS_PLACEHOLDER: &str = "@@KERNEL-ARGS@@";
/// Template files that never end up on the disc.
pub const TEMPLATE_EXCLUDES: &[&str] = &["README.md"];

pub const KERNEL_IMG: &str = "images/vmlinuz";
pub const INITRAMFS_IMG: &str = "images/initramfs.img";

/// Directory being shaped into the disc layout. Exists for one build.
#[derive(Debug, Clone)]
pub struct IsoTree {
    root: PathBuf,
}

impl IsoTree {
    pub fn create(root: &Path) -> Result<Self> {
        recreate_dir(root)?;
        fs::create_dir_all(root.join("images"))?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }
}

/// Delete boot trees under `tree` that the target can't use.
fn remove_boot_dirs(tree: &Path, dirs: &[&str]) -> Result<()> {
    for dir in dirs {
        let path = tree.join(dir);
        if path.exists() {
            fs::remove_dir_all(&path)
                .with_context(|| format!("removing '{}'", path.display()))?;
        }
    }
    Ok(())
}

/// Delete the isolinux and UEFI trees for architectures that can't use them.
fn remove_foreign_boot_dirs(tree: &Path) -> Result<()> {
    remove_boot_dirs(tree, &["EFI", "isolinux"])
}

/// Everything needed to produce one disc image.
#[derive(Debug, Clone)]
pub struct IsoInputs<'a> {
    pub arch: Arch,
    pub volume_id: &'a str,
    pub kargs: &'a KernelArguments,
    pub kernel: &'a Path,
    pub initramfs: &'a Path,
    /// Template tree rendered into the disc root.
    pub config_dir: &'a Path,
    /// `EFI/` from the commit, merged into the disc tree.
    pub efi_dir: Option<&'a Path>,
    pub syslinux_dir: &'a Path,
    /// Zero bytes to append to the on-disc initramfs.
    pub ignition_padding: Option<u64>,
    /// Additional `(disc path, source)` files.
    pub extra_files: Vec<(String, &'a Path)>,
    pub work_dir: &'a Path,
    pub output: &'a Path,
}

/// The finished image and where the initramfs ended up in it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledIso {
    pub path: PathBuf,
    /// Base name of the initramfs as listed on the disc.
    pub ramdisk_name: String,
    pub ramdisk_size: u64,
    /// Length of the zero tail, when the image can carry the offset header.
    pub ignition_padding: Option<u64>,
}

/// Generator command plus fix-ups that run on the finished image.
#[derive(Debug, Clone)]
pub struct GeneratorInvocation {
    pub generator: Cmd,
    pub post: Vec<Cmd>,
}

/// Per-architecture disc layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootAssembler {
    X86_64,
    Aarch64,
    Ppc64le,
    S390x,
}

impl From<Arch> for BootAssembler {
    fn from(arch: Arch) -> Self {
        match arch {
            Arch::X86_64 => BootAssembler::X86_64,
            Arch::Aarch64 => BootAssembler::Aarch64,
            Arch::Ppc64le => BootAssembler::Ppc64le,
            Arch::S390x => BootAssembler::S390x,
        }
    }
}

impl BootAssembler {
    /// Whether the offset header can be embedded into this architecture's
    /// images.
    pub fn supports_ignition_header(&self) -> bool {
        !matches!(self, BootAssembler::S390x)
    }

    fn needs_efi(&self) -> bool {
        matches!(self, BootAssembler::X86_64 | BootAssembler::Aarch64)
    }

    /// Prepare `tree` for this architecture and return the generator call.
    fn prepare(
        &self,
        tree: &IsoTree,
        inputs: &IsoInputs<'_>,
        tools: &Tools,
    ) -> Result<GeneratorInvocation> {
        let root = tree.root();
        match self {
            BootAssembler::X86_64 => {
                bios::install_isolinux(root, inputs.syslinux_dir)?;
                efi::build_efiboot(root, inputs.work_dir, &tools.virt_make_fs)?;
                let mut args: Vec<String> = bios::ELTORITO_ARGS.iter().map(|s| s.to_string()).collect();
                args.extend(efi::alt_boot_args());
                Ok(GeneratorInvocation {
                    generator: genisoimage(&tools.genisoimage, inputs.volume_id, &args, root, inputs.output),
                    post: vec![Cmd::new(&tools.isohybrid)
                        .arg("--uefi")
                        .arg_path(inputs.output)
                        .error_msg("isohybrid failed. Install syslinux.")],
                })
            }
            BootAssembler::Aarch64 => {
                remove_boot_dirs(root, &["isolinux"])?;
                efi::build_efiboot(root, inputs.work_dir, &tools.virt_make_fs)?;
                Ok(GeneratorInvocation {
                    generator: genisoimage(
                        &tools.genisoimage,
                        inputs.volume_id,
                        &efi::alt_boot_args(),
                        root,
                        inputs.output,
                    ),
                    post: Vec::new(),
                })
            }
            BootAssembler::Ppc64le => {
                ppc64le::prepare_tree(root)?;
                Ok(GeneratorInvocation {
                    generator: ppc64le::generator(&tools.grub2_mkrescue, inputs.volume_id, root, inputs.output),
                    post: Vec::new(),
                })
            }
            BootAssembler::S390x => {
                let (kernel, initrd) = s390x::prepare_tree(
                    root,
                    &tree.path(KERNEL_IMG),
                    &tree.path(INITRAMFS_IMG),
                )?;
                s390x::cdboot_cmd(&tools.mk_s390_cdboot, root, &kernel, &initrd).run()?;
                s390x::write_addrsize(root, &initrd)?;
                Ok(GeneratorInvocation {
                    generator: s390x::generator(&tools.xorrisofs, inputs.volume_id, root, inputs.output),
                    post: Vec::new(),
                })
            }
        }
    }

    /// Where the initramfs lives in the finished tree.
    fn ramdisk_path(&self) -> &'static str {
        match self {
            BootAssembler::S390x => s390x::INITRD_IMG,
            _ => INITRAMFS_IMG,
        }
    }
}

/// `genisoimage` with the common Rock Ridge / Joliet options.
pub fn genisoimage(tool: &str, volume_id: &str, arch_args: &[String], tree: &Path, output: &Path) -> Cmd {
    Cmd::new(tool)
        .args(["-verbose", "-V", volume_id, "-volset", volume_id])
        .args(["-rational-rock", "-J", "-joliet-long"])
        .args(arch_args)
        .arg("-o")
        .arg_path(output)
        .arg_path(tree)
        .error_msg("genisoimage failed. Install genisoimage.")
}

fn copy_into(src: &Path, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(src, dest)
        .with_context(|| format!("copying '{}' to '{}'", src.display(), dest.display()))?;
    Ok(())
}

/// Stage the disc tree and run the generator for `inputs.arch`.
pub fn assemble(inputs: &IsoInputs<'_>, tools: &Tools) -> Result<AssembledIso> {
    let assembler = BootAssembler::from(inputs.arch);
    if !inputs.config_dir.is_dir() {
        return Err(BuildError::Precondition(format!(
            "live config directory '{}' not found",
            inputs.config_dir.display()
        ))
        .into());
    }
    if assembler.needs_efi() && inputs.efi_dir.is_none() {
        return Err(BuildError::Precondition(format!(
            "{} media needs an EFI directory",
            inputs.arch
        ))
        .into());
    }

    recreate_dir(inputs.work_dir)?;
    let tree = IsoTree::create(&inputs.work_dir.join("iso"))?;
    info!(arch = %inputs.arch, volume_id = inputs.volume_id, "assembling disc tree");

    // Templates are rendered over the commit's EFI tree.
    if let Some(efi_dir) = inputs.efi_dir.filter(|_| assembler.needs_efi()) {
        copy_dir_recursive(efi_dir, &tree.path("EFI"))?;
    }
    let cmdline = inputs.kargs.to_cmdline();
    render_template_tree(
        inputs.config_dir,
        tree.root(),
        &[(KERNEL_ARGS_PLACEHOLDER, &cmdline)],
        TEMPLATE_EXCLUDES,
    )?;

    copy_into(inputs.kernel, &tree.path(KERNEL_IMG))?;
    let initramfs = tree.path(INITRAMFS_IMG);
    copy_into(inputs.initramfs, &initramfs)?;
    let ignition_padding = match inputs.ignition_padding {
        Some(len) if assembler.supports_ignition_header() => {
            append_padding(&initramfs, len)?;
            Some(len)
        }
        _ => None,
    };
    for (rel, src) in &inputs.extra_files {
        copy_into(src, &tree.path(rel))?;
    }
    let invocation = assembler.prepare(&tree, inputs, tools)?;

    let ramdisk = tree.path(assembler.ramdisk_path());
    let ramdisk_size = fs::metadata(&ramdisk)
        .with_context(|| format!("reading size of '{}'", ramdisk.display()))?
        .len();
    let ramdisk_name = ramdisk
        .file_name()
        .context("ramdisk path has no file name")?
        .to_string_lossy()
        .into_owned();

    if let Some(parent) = inputs.output.parent() {
        fs::create_dir_all(parent)?;
    }
    if inputs.output.exists() {
        fs::remove_file(inputs.output)?;
    }
    invocation.generator.run()?;
    for cmd in &invocation.post {
        cmd.run()?;
    }

    let size = fs::metadata(inputs.output).map(|m| m.len()).unwrap_or(0);
    if size == 0 {
        return Err(BuildError::Integrity(format!(
            "generator produced no image at '{}'",
            inputs.output.display()
        ))
        .into());
    }
    info!(path = %inputs.output.display(), size, "disc image written");

    Ok(AssembledIso {
        path: inputs.output.to_path_buf(),
        ramdisk_name,
        ramdisk_size,
        ignition_padding,
    })
}
