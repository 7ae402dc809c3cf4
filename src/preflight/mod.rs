//! Preflight checks for build validation.
//!
//! Validates that the host has every tool a build will run before any work
//! starts, so a missing package is reported up front instead of halfway
//! through disc assembly.
//!
//! # Example
//!
//! ```rust,ignore
//! use liveiso_builder::preflight::{check_required_tools, required_tools};
//!
//! let tools = required_tools(Arch::X86_64, InitramfsVariant::Live, OsmetMode::Direct, &config.tools);
//! check_required_tools(&tools)?;
//! ```

use anyhow::Result;
use std::path::Path;

use crate::arch::Arch;
use crate::artifact::initramfs::InitramfsVariant;
use crate::config::{OsmetMode, Tools};
use crate::error::BuildError;

/// Check if a command exists on the host system.
///
/// Paths are checked directly; bare names are looked up in `PATH`.
pub fn command_exists(cmd: &str) -> bool {
    if cmd.contains('/') {
        return Path::new(cmd).is_file();
    }
    which::which(cmd).is_ok()
}

/// Host tools a build for `arch` and `variant` will invoke.
///
/// Each tuple is (command, package).
pub fn required_tools(
    arch: Arch,
    variant: InitramfsVariant,
    osmet: OsmetMode,
    tools: &Tools,
) -> Vec<(String, &'static str)> {
    let mut required = vec![
        (tools.ostree.clone(), "ostree"),
        (tools.find.clone(), "findutils"),
        (tools.sort.clone(), "coreutils"),
        (tools.cpio.clone(), "cpio"),
        (tools.gzip.clone(), "gzip"),
    ];
    if variant.is_live() {
        required.push((tools.mksquashfs.clone(), "squashfs-tools"));
    }

    match arch {
        Arch::X86_64 => {
            required.push((tools.genisoimage.clone(), "genisoimage"));
            required.push((tools.isohybrid.clone(), "syslinux"));
            required.push((tools.virt_make_fs.clone(), "guestfs-tools"));
        }
        Arch::Aarch64 => {
            required.push((tools.genisoimage.clone(), "genisoimage"));
            required.push((tools.virt_make_fs.clone(), "guestfs-tools"));
        }
        Arch::Ppc64le => required.push((tools.grub2_mkrescue.clone(), "grub2-tools-extra")),
        Arch::S390x => {
            required.push((tools.mk_s390_cdboot.clone(), "s390utils-base"));
            required.push((tools.xorrisofs.clone(), "xorriso"));
        }
    }
    if arch != Arch::S390x {
        required.push((tools.isoinfo.clone(), "genisoimage"));
    }

    match osmet {
        OsmetMode::Direct => required.push((tools.coreos_installer.clone(), "coreos-installer")),
        OsmetMode::Vm => required.push((tools.vm_runner.clone(), "coreos-assembler")),
        OsmetMode::Disabled => {}
    }

    required
}

/// Check that specific tools are available.
///
/// # Returns
///
/// * `Ok(())` if all tools are found
/// * `Err` listing every missing tool and its package
pub fn check_required_tools(tools: &[(String, &str)]) -> Result<()> {
    let missing: Vec<_> = tools
        .iter()
        .filter(|(tool, _)| !command_exists(tool))
        .collect();

    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(t, p)| format!("  {} (install: {})", t, p))
            .collect::<Vec<_>>()
            .join("\n");
        return Err(BuildError::Precondition(format!("missing required host tools:\n{msg}")).into());
    }

    Ok(())
}
