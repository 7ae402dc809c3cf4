//! CPIO segment archiver.
//!
//! Turns a directory into one newc archive segment, optionally gzip
//! compressed, either as a fresh file or appended to an open ramdisk. The
//! Linux kernel unpacks concatenated segments in order, which is what makes
//! layering a ramdisk by appending work.
//!
//! Segments are reproducible: entries are byte-sorted, owned by
//! `root:root`, carry epoch mtimes and deterministic inode numbers.

use anyhow::{Context, Result};
use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::path::Path;
use tracing::debug;

use crate::artifact::filesystem::normalize_mtimes;
use crate::config::Tools;
use crate::process::{Cmd, Pipeline};

/// Per-segment compression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    /// Plain newc stream.
    Raw,
    /// newc stream piped through `gzip -9`.
    Gzip,
}

/// The `find | sort | cpio [| gzip]` pipeline for `root`.
pub fn archive_pipeline(root: &Path, compression: Compression, tools: &Tools) -> Pipeline {
    let pipeline = Pipeline::new()
        .stage(
            Cmd::new(&tools.find)
                .args([".", "-mindepth", "1", "-printf", "%P\\0"])
                .dir(root),
        )
        .stage(Cmd::new(&tools.sort).arg("-z").env("LC_ALL", "C"))
        .stage(
            Cmd::new(&tools.cpio)
                .args([
                    "-o",
                    "-H",
                    "newc",
                    "-R",
                    "root:root",
                    "--quiet",
                    "--reproducible",
                    "--null",
                ])
                .dir(root)
                .error_msg("cpio failed. Install cpio."),
        );

    match compression {
        Compression::Raw => pipeline,
        // -n keeps the name and timestamp out of the gzip header.
        Compression::Gzip => pipeline.stage(Cmd::new(&tools.gzip).args(["-9", "-n"])),
    }
}

/// Build a cpio archive from a directory into a new file.
///
/// The archive is written to a temporary file next to `output` and renamed
/// into place only after every stage succeeded.
///
/// # Example
///
/// ```rust,ignore
/// use liveiso_builder::artifact::cpio::{build_cpio, Compression};
///
/// build_cpio(
///     Path::new("/tmp/stamp-root"),
///     Path::new("/tmp/stamp.cpio.gz"),
///     Compression::Gzip,
///     &config.tools,
/// )?;
/// ```
pub fn build_cpio(root: &Path, output: &Path, compression: Compression, tools: &Tools) -> Result<()> {
    let dir = output.parent().unwrap_or_else(|| Path::new("."));
    let tmp = tempfile::Builder::new()
        .prefix(".tmp-cpio-")
        .tempfile_in(dir)
        .with_context(|| format!("creating temporary archive in '{}'", dir.display()))?;

    normalize_mtimes(root)?;
    archive_pipeline(root, compression, tools)
        .run_into(tmp.as_file())
        .with_context(|| format!("archiving '{}'", root.display()))?;

    tmp.persist(output)
        .with_context(|| format!("renaming archive into '{}'", output.display()))?;
    Ok(())
}

/// Append a cpio segment built from `root` to the end of `out`.
pub fn append_cpio(root: &Path, out: &mut File, compression: Compression, tools: &Tools) -> Result<()> {
    let start = out.seek(SeekFrom::End(0)).context("seeking to end of ramdisk")?;
    normalize_mtimes(root)?;
    archive_pipeline(root, compression, tools)
        .run_into(out)
        .with_context(|| format!("appending archive of '{}'", root.display()))?;

    let end = out.seek(SeekFrom::End(0))?;
    debug!(
        root = %root.display(),
        ?compression,
        bytes = end - start,
        "appended segment"
    );
    Ok(())
}
