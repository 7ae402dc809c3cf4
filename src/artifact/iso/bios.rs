//! BIOS boot via isolinux.

use anyhow::{Context, Result};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use crate::error::BuildError;

/// Loader binaries copied from the host syslinux installation.
pub const SYSLINUX_FILES: &[&str] = &[
    "isolinux.bin",
    "ldlinux.c32",
    "libcom32.c32",
    "libutil.c32",
    "vesamenu.c32",
];

/// El Torito arguments for the isolinux boot catalog.
pub const ELTORITO_ARGS: &[&str] = &[
    "-b",
    "isolinux/isolinux.bin",
    "-c",
    "isolinux/boot.cat",
    "-no-emul-boot",
    "-boot-load-size",
    "4",
    "-boot-info-table",
];

/// Copy the syslinux binaries into `tree/isolinux` with mode 0755.
pub fn install_isolinux(tree: &Path, syslinux_dir: &Path) -> Result<()> {
    let dest = tree.join("isolinux");
    fs::create_dir_all(&dest)?;
    for name in SYSLINUX_FILES {
        let src = syslinux_dir.join(name);
        if !src.is_file() {
            return Err(BuildError::Precondition(format!(
                "syslinux file '{}' not found",
                src.display()
            ))
            .into());
        }
        let target = dest.join(name);
        fs::copy(&src, &target)
            .with_context(|| format!("copying '{}'", src.display()))?;
        fs::set_permissions(&target, fs::Permissions::from_mode(0o755))?;
    }
    Ok(())
}
