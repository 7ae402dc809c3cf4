//! Filesystem utilities for artifact building.
//!
//! Directory copies, template rendering into the ISO tree, and the
//! normalization passes applied before a tree is archived.

use anyhow::{Context, Result};
use std::fs::{self, File};
use std::path::Path;
use std::time::SystemTime;
use walkdir::WalkDir;

/// Remove `path` if present and create it empty.
pub fn recreate_dir(path: &Path) -> Result<()> {
    if path.exists() {
        fs::remove_dir_all(path)
            .with_context(|| format!("removing stale directory '{}'", path.display()))?;
    }
    fs::create_dir_all(path).with_context(|| format!("creating directory '{}'", path.display()))
}

/// Recursively copy a directory, preserving symlinks.
///
/// Existing files in `dst` are overwritten; other entries are left alone,
/// so this also merges `src` into a populated tree.
pub fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    if !dst.exists() {
        fs::create_dir_all(dst)
            .with_context(|| format!("Failed to create directory: {}", dst.display()))?;
    }

    for entry in fs::read_dir(src)
        .with_context(|| format!("Failed to read directory: {}", src.display()))?
    {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());

        let file_type = entry.file_type()?;

        if file_type.is_symlink() {
            let target = fs::read_link(&src_path)?;
            if dst_path.exists() || dst_path.is_symlink() {
                fs::remove_file(&dst_path)?;
            }
            std::os::unix::fs::symlink(&target, &dst_path)
                .with_context(|| format!("Failed to create symlink: {}", dst_path.display()))?;
        } else if file_type.is_dir() {
            copy_dir_recursive(&src_path, &dst_path)?;
        } else {
            fs::copy(&src_path, &dst_path)
                .with_context(|| format!("Failed to copy file: {}", src_path.display()))?;
        }
    }

    Ok(())
}

/// Copy a template tree, replacing placeholder tokens in text files.
///
/// Files that are not valid UTF-8 are copied byte-for-byte. Entries whose
/// file name is listed in `exclude` are skipped at any depth.
pub fn render_template_tree(
    src: &Path,
    dst: &Path,
    substitutions: &[(&str, &str)],
    exclude: &[&str],
) -> Result<()> {
    for entry in WalkDir::new(src).min_depth(1).sort_by_file_name() {
        let entry = entry.with_context(|| format!("walking template tree '{}'", src.display()))?;
        let name = entry.file_name().to_string_lossy();
        if exclude.iter().any(|ex| *ex == name) {
            continue;
        }
        let rel = entry.path().strip_prefix(src)?;
        let target = dst.join(rel);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)
                .with_context(|| format!("creating '{}'", target.display()))?;
            continue;
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let bytes = fs::read(entry.path())
            .with_context(|| format!("reading template '{}'", entry.path().display()))?;
        match String::from_utf8(bytes) {
            Ok(text) => {
                let rendered = substitute(&text, substitutions);
                fs::write(&target, rendered)
                    .with_context(|| format!("writing '{}'", target.display()))?;
            }
            Err(raw) => {
                fs::write(&target, raw.into_bytes())
                    .with_context(|| format!("writing '{}'", target.display()))?;
            }
        }
    }
    Ok(())
}

/// Replace every placeholder occurrence in `text`.
pub fn substitute(text: &str, substitutions: &[(&str, &str)]) -> String {
    substitutions
        .iter()
        .fold(text.to_string(), |acc, (from, to)| acc.replace(from, to))
}

/// Rewrite a text file in place with [`substitute`].
pub fn substitute_in_file(path: &Path, substitutions: &[(&str, &str)]) -> Result<()> {
    let text =
        fs::read_to_string(path).with_context(|| format!("reading '{}'", path.display()))?;
    fs::write(path, substitute(&text, substitutions))
        .with_context(|| format!("writing '{}'", path.display()))
}

/// Set every file and directory mtime under `root` (inclusive) to the epoch.
///
/// Symlinks are left alone.
pub fn normalize_mtimes(root: &Path) -> Result<()> {
    // Children before parents, so writing a child doesn't bump the parent again.
    for entry in WalkDir::new(root).contents_first(true) {
        let entry = entry.with_context(|| format!("walking '{}'", root.display()))?;
        if entry.file_type().is_symlink() {
            continue;
        }
        let f = File::open(entry.path())
            .with_context(|| format!("opening '{}'", entry.path().display()))?;
        f.set_modified(SystemTime::UNIX_EPOCH)
            .with_context(|| format!("resetting mtime of '{}'", entry.path().display()))?;
    }
    Ok(())
}

/// Atomically move a file by renaming, with fallback to copy+delete.
pub fn atomic_move(src: &Path, dst: &Path) -> Result<()> {
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(_) => {
            // Different filesystem: copy next to the destination, then rename.
            let dir = dst.parent().unwrap_or_else(|| Path::new("."));
            let tmp = tempfile::Builder::new()
                .prefix(".tmp-move-")
                .tempfile_in(dir)
                .with_context(|| format!("creating temporary file in '{}'", dir.display()))?;
            fs::copy(src, tmp.path())
                .with_context(|| format!("Failed to copy {} to {}", src.display(), dst.display()))?;
            tmp.persist(dst)
                .with_context(|| format!("Failed to rename into {}", dst.display()))?;
            fs::remove_file(src)
                .with_context(|| format!("Failed to remove {}", src.display()))?;
            Ok(())
        }
    }
}
