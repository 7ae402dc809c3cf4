//! UEFI El Torito boot image.
//!
//! The `EFI/` directory of the disc tree is packed into a normalized tar
//! and turned into a FAT filesystem image with `virt-make-fs`. Ownership,
//! permissions and timestamps are fixed so the image content only depends
//! on the input files.

use anyhow::{Context, Result};
use std::fs::{self, File};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tar::Builder as TarBuilder;
use walkdir::WalkDir;

use crate::process::Cmd;

/// El Torito image path relative to the disc root.
pub const EFIBOOT_IMG: &str = "images/efiboot.img";

/// Generator arguments adding the UEFI image as an alternate boot entry.
pub fn alt_boot_args() -> Vec<String> {
    ["-eltorito-alt-boot", "-efi-boot", EFIBOOT_IMG, "-no-emul-boot"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Normalized permission bits: 0755 for directories and executables,
/// 0644 otherwise. Setuid, setgid and sticky bits are dropped.
fn normalized_mode(is_dir: bool, mode: u32) -> u32 {
    if is_dir || mode & 0o111 != 0 {
        0o755
    } else {
        0o644
    }
}

fn base_header(entry_type: tar::EntryType, mode: u32, size: u64) -> Result<tar::Header> {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(entry_type);
    header.set_size(size);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header.set_username("root")?;
    header.set_groupname("root")?;
    header.set_mode(mode);
    Ok(header)
}

/// Pack `efi_dir` as `EFI/...` into an uncompressed tar at `out_path`.
///
/// Symlinks are followed; FAT has no way to store them.
pub fn create_efi_tar(efi_dir: &Path, out_path: &Path) -> Result<()> {
    let out = File::create(out_path)
        .with_context(|| format!("Failed to create {}", out_path.display()))?;
    let mut builder = TarBuilder::new(out);

    for ent in WalkDir::new(efi_dir).follow_links(true).sort_by_file_name() {
        let ent = ent.with_context(|| format!("walking '{}'", efi_dir.display()))?;
        let rel = ent.path().strip_prefix(efi_dir)?;
        let name = Path::new("EFI").join(rel);
        let md = fs::metadata(ent.path())?;
        let mode = normalized_mode(md.is_dir(), md.permissions().mode());

        if md.is_dir() {
            let mut header = base_header(tar::EntryType::Directory, mode, 0)?;
            builder.append_data(&mut header, &name, std::io::empty())?;
        } else if md.is_file() {
            let mut f = File::open(ent.path())?;
            let mut header = base_header(tar::EntryType::Regular, mode, md.len())?;
            builder.append_data(&mut header, &name, &mut f)?;
        }
    }

    builder
        .into_inner()
        .context("Failed to finalize tar builder")?
        .sync_all()?;
    Ok(())
}

/// Build `images/efiboot.img` inside `tree` from `tree/EFI`.
pub fn build_efiboot(tree: &Path, work_dir: &Path, virt_make_fs: &str) -> Result<PathBuf> {
    let efi_dir = tree.join("EFI");
    let tar_path = work_dir.join("efidir.tar");
    let image = tree.join(EFIBOOT_IMG);
    if let Some(parent) = image.parent() {
        fs::create_dir_all(parent)?;
    }

    create_efi_tar(&efi_dir, &tar_path)?;
    Cmd::new(virt_make_fs)
        .arg("--type=vfat")
        .arg_path(&tar_path)
        .arg_path(&image)
        .error_msg("virt-make-fs failed. Install guestfs-tools.")
        .run()?;
    Ok(image)
}
