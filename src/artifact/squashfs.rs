//! Squashfs image builder.
//!
//! Wraps `mksquashfs` for the live root filesystem. The image is first
//! written to `<output>.work` and renamed over `output` only on success,
//! so an interrupted build never leaves a truncated image behind.

use anyhow::{Context, Result};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::process::Cmd;

/// Options for building a squashfs image.
#[derive(Debug, Clone)]
pub struct SquashfsOptions<'a> {
    /// Compression algorithm (gzip, zstd, xz, lzo, lz4).
    pub compression: &'a str,

    /// Block size (e.g. "128K", "1M"). `None` keeps the mksquashfs default.
    pub block_size: Option<&'a str>,

    /// Whether to include extended attributes.
    ///
    /// Default: true (SELinux labels live in xattrs)
    pub xattrs: bool,
}

impl Default for SquashfsOptions<'_> {
    fn default() -> Self {
        Self {
            compression: "zstd",
            block_size: None,
            xattrs: true,
        }
    }
}

fn work_path(output: &Path) -> PathBuf {
    let mut name = output
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| OsString::from("squashfs"));
    name.push(".work");
    output.with_file_name(name)
}

/// Build a squashfs image from a directory.
///
/// # Example
///
/// ```rust,ignore
/// use liveiso_builder::artifact::squashfs::{build_squashfs, SquashfsOptions};
///
/// build_squashfs(
///     "mksquashfs",
///     Path::new("tmp/rootfs"),
///     Path::new("tmp/root.squashfs"),
///     &SquashfsOptions::default(),
/// )?;
/// ```
pub fn build_squashfs(
    mksquashfs: &str,
    source_dir: &Path,
    output: &Path,
    options: &SquashfsOptions,
) -> Result<()> {
    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent)?;
    }
    let work = work_path(output);
    let _ = fs::remove_file(&work);

    let mut cmd = Cmd::new(mksquashfs)
        .arg_path(source_dir)
        .arg_path(&work)
        .args(["-comp", options.compression]);
    if let Some(block_size) = options.block_size {
        cmd = cmd.args(["-b", block_size]);
    }
    if !options.xattrs {
        cmd = cmd.arg("-no-xattrs");
    }
    let result = cmd
        .args(["-noappend", "-no-progress"])
        .error_msg("mksquashfs failed. Install squashfs-tools.")
        .run();

    if let Err(e) = result {
        let _ = fs::remove_file(&work);
        return Err(e);
    }

    fs::rename(&work, output)
        .with_context(|| format!("Failed to move {} into place", work.display()))?;

    let size = fs::metadata(output)?.len();
    info!(path = %output.display(), size_mb = size / 1024 / 1024, "squashfs created");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::write_stub;
    use tempfile::TempDir;

    #[test]
    fn test_build_squashfs_passes_options() {
        let temp = TempDir::new().unwrap();
        let log = temp.path().join("args.log");
        let stub = write_stub(
            temp.path(),
            "mksquashfs",
            &format!("echo \"$@\" > {}\nprintf hsqs > \"$2\"\n", log.display()),
        );
        let src = temp.path().join("rootfs");
        fs::create_dir_all(&src).unwrap();
        let out = temp.path().join("out/root.squashfs");

        let options = SquashfsOptions {
            compression: "xz",
            block_size: Some("1M"),
            xattrs: false,
        };
        build_squashfs(stub.to_str().unwrap(), &src, &out, &options).unwrap();

        assert_eq!(fs::read(&out).unwrap(), b"hsqs");
        assert!(!work_path(&out).exists());
        let args = fs::read_to_string(&log).unwrap();
        assert!(args.contains("-comp xz -b 1M -no-xattrs -noappend"));
    }

    #[test]
    fn test_failure_keeps_existing_output() {
        let temp = TempDir::new().unwrap();
        let stub = write_stub(temp.path(), "mksquashfs", "printf partial > \"$2\"\nexit 1\n");
        let out = temp.path().join("root.squashfs");
        fs::write(&out, b"previous").unwrap();

        let err = build_squashfs(
            stub.to_str().unwrap(),
            temp.path(),
            &out,
            &SquashfsOptions::default(),
        );
        assert!(err.is_err());
        assert_eq!(fs::read(&out).unwrap(), b"previous");
        assert!(!work_path(&out).exists());
    }
}
