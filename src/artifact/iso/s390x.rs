//! IBM Z: the disc boots a combined kernel+initrd image built by
//! `mk-s390-cdboot`, and LPAR loading needs the initrd address and size in
//! `images/initrd.addrsize`.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::artifact::filesystem::substitute_in_file;
use crate::error::BuildError;
use crate::process::Cmd;

/// Memory reserved for the kernel; the initrd is loaded right after it.
pub const INITRD_LOAD_ADDRESS: u32 = 0x0200_0000;
pub const INITRD_ADDRESS_PLACEHOLDER: &str = "@INITRD_LOAD_ADDRESS@";

pub const KERNEL_IMG: &str = "images/kernel.img";
pub const INITRD_IMG: &str = "images/initrd.img";
pub const CDBOOT_IMG: &str = "images/cdboot.img";
const PARAMETER_FILE: &str = "zipl.prm";
/// CMS file names are limited to 8 characters, hence the fixed set.
const PRM_COPIES: &[&str] = &["cdboot.prm", "genericdvd.prm", "generic.prm"];

/// `>IIII` (0, load address, 0, size), big endian.
pub fn encode_addrsize(initrd_size: u32) -> [u8; 16] {
    let mut buf = [0u8; 16];
    buf[4..8].copy_from_slice(&INITRD_LOAD_ADDRESS.to_be_bytes());
    buf[12..].copy_from_slice(&initrd_size.to_be_bytes());
    buf
}

fn render_address(dir: &Path) -> Result<()> {
    let address = format!("{INITRD_LOAD_ADDRESS:#010x}");
    if !dir.is_dir() {
        return Ok(());
    }
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let is_template = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("ins") | Some("prm")
        );
        if is_template && path.is_file() {
            substitute_in_file(&path, &[(INITRD_ADDRESS_PLACEHOLDER, &address)])?;
        }
    }
    Ok(())
}

/// Lay out the tree for a zipl boot and return the generator-ready
/// `(kernel, initrd)` paths.
pub fn prepare_tree(tree: &Path, kernel: &Path, initrd: &Path) -> Result<(PathBuf, PathBuf)> {
    let prm = tree.join(PARAMETER_FILE);
    if !prm.is_file() {
        return Err(BuildError::Precondition(format!(
            "parameter file '{}' not found in live config",
            prm.display()
        ))
        .into());
    }

    render_address(tree)?;
    let params = fs::read_to_string(&prm)?;
    let images = tree.join("images");
    fs::create_dir_all(&images)?;
    for name in PRM_COPIES {
        fs::write(images.join(name), params.trim())?;
    }

    let kernel_dest = tree.join(KERNEL_IMG);
    let initrd_dest = tree.join(INITRD_IMG);
    fs::rename(kernel, &kernel_dest)
        .with_context(|| format!("moving '{}'", kernel.display()))?;
    fs::rename(initrd, &initrd_dest)
        .with_context(|| format!("moving '{}'", initrd.display()))?;

    super::remove_foreign_boot_dirs(tree)?;
    Ok((kernel_dest, initrd_dest))
}

pub fn cdboot_cmd(tool: &str, tree: &Path, kernel: &Path, initrd: &Path) -> Cmd {
    Cmd::new(tool)
        .arg("-i")
        .arg_path(kernel)
        .arg("-r")
        .arg_path(initrd)
        .arg("-p")
        .arg_path(&tree.join(PARAMETER_FILE))
        .arg("-o")
        .arg_path(&tree.join(CDBOOT_IMG))
        .error_msg("mk-s390-cdboot failed. Install s390utils-base.")
}

/// Write `images/initrd.addrsize` for the initrd as it will land on disc.
pub fn write_addrsize(tree: &Path, initrd: &Path) -> Result<()> {
    let size = fs::metadata(initrd)?.len();
    let size = u32::try_from(size).map_err(|_| {
        BuildError::Integrity(format!(
            "initrd '{}' is {size} bytes, too large for the 32-bit address table",
            initrd.display()
        ))
    })?;
    fs::write(tree.join("images/initrd.addrsize"), encode_addrsize(size))?;
    Ok(())
}

pub fn generator(tool: &str, volume_id: &str, tree: &Path, output: &Path) -> Cmd {
    Cmd::new(tool)
        .args([
            "-verbose",
            "-volid",
            volume_id,
            "-eltorito-boot",
            CDBOOT_IMG,
            "-no-emul-boot",
            "-o",
        ])
        .arg_path(output)
        .arg_path(tree)
        .error_msg("xorrisofs failed. Install xorriso.")
}
