//! PowerPC discs boot through GRUB; `grub2-mkrescue` builds the image.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

use crate::error::BuildError;
use crate::process::Cmd;

/// Move the GRUB config to where the rescue image expects it and drop the
/// x86/UEFI boot trees.
pub fn prepare_tree(tree: &Path) -> Result<()> {
    let src = tree.join("config/grub.cfg");
    if !src.is_file() {
        return Err(BuildError::Precondition(format!(
            "GRUB config '{}' not found in live config",
            src.display()
        ))
        .into());
    }
    let dest_dir = tree.join("boot/grub");
    fs::create_dir_all(&dest_dir)?;
    fs::rename(&src, dest_dir.join("grub.cfg"))
        .with_context(|| format!("moving '{}'", src.display()))?;
    super::remove_foreign_boot_dirs(tree)
}

pub fn generator(tool: &str, volume_id: &str, tree: &Path, output: &Path) -> Cmd {
    Cmd::new(tool)
        .args(["-volid", volume_id, "-o"])
        .arg_path(output)
        .arg_path(tree)
        .error_msg("grub2-mkrescue failed. Install grub2-tools-extra.")
}
