//! Layered initramfs composition.
//!
//! The distro ramdisk extracted from the commit is treated as opaque and
//! extended by appending segments:
//!
//! ```text
//! disc ramdisk: [base][stamp.gz][osmet.gz]
//! PXE ramdisk:  [base][stamp.gz][rootfs (raw)]
//! ```
//!
//! The stamp tells the initramfs which flavor of media it booted from. The
//! root filesystem is already a compressed squashfs, so that segment is
//! stored raw; it still needs a valid newc frame around it.

use anyhow::{bail, Context, Result};
use flate2::bufread::GzDecoder;
use std::fs::{self, File};
use std::io::{self, BufRead, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::info;

use crate::artifact::cpio::{append_cpio, Compression};
use crate::artifact::filesystem::recreate_dir;
use crate::config::Tools;
use crate::error::BuildError;

/// Directory inside the ramdisk holding packed metadata blobs.
pub const OSMET_DIR: &str = "usr/share/coreos-installer";

/// File name of the root filesystem inside the PXE rootfs segment.
pub const ROOTFS_NAME: &str = "root.squashfs";

/// Which media flavor a ramdisk is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitramfsVariant {
    /// Interactive live system (ISO and PXE).
    Live,
    /// Installer-only legacy media.
    LegacyInstaller,
}

impl InitramfsVariant {
    /// Path of the empty marker file written into the stamp segment.
    pub fn stamp_path(&self) -> &'static str {
        match self {
            InitramfsVariant::Live => "etc/coreos-live-initramfs",
            InitramfsVariant::LegacyInstaller => "etc/coreos-legacy-installer-initramfs",
        }
    }

    /// Label used in output file names.
    pub fn label(&self) -> &'static str {
        match self {
            InitramfsVariant::Live => "live",
            InitramfsVariant::LegacyInstaller => "installer",
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, InitramfsVariant::Live)
    }
}

/// What a segment of a composed ramdisk contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    Base,
    Stamp,
    PackedMetadata,
    RootFs,
}

/// One appended layer, in write order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub kind: SegmentKind,
    /// `None` for the opaque base ramdisk.
    pub compression: Option<Compression>,
}

/// A finished ramdisk file and the layers it was built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposedRamdisk {
    pub path: PathBuf,
    pub segments: Vec<Segment>,
}

/// Inputs for [`compose`].
#[derive(Debug, Clone)]
pub struct ComposeRequest<'a> {
    /// Distro initramfs, copied unchanged.
    pub base: &'a Path,
    pub variant: InitramfsVariant,
    /// Packed metadata blob; `None` when generation is disabled.
    pub osmet: Option<&'a Path>,
    /// Produce a PXE ramdisk in addition to the disc one.
    pub for_pxe: bool,
    /// Root filesystem image for the PXE ramdisk.
    pub rootfs: Option<&'a Path>,
    /// Scratch directory for staging segment trees.
    pub work_dir: &'a Path,
    pub output: &'a Path,
    pub pxe_output: Option<&'a Path>,
}

/// Result of [`compose`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Composition {
    pub disc: ComposedRamdisk,
    pub pxe: Option<ComposedRamdisk>,
}

/// Build the disc ramdisk (and optionally the PXE one).
///
/// Every output goes through a temporary file in its target directory and
/// is renamed into place only once complete.
pub fn compose(req: &ComposeRequest<'_>, tools: &Tools) -> Result<Composition> {
    let (pxe_output, rootfs) = match (req.for_pxe, req.pxe_output, req.rootfs) {
        (false, _, _) => (None, None),
        (true, Some(out), Some(rootfs)) => (Some(out), Some(rootfs)),
        (true, None, _) => {
            return Err(BuildError::Precondition(
                "PXE ramdisk requested without an output path".into(),
            )
            .into())
        }
        (true, _, None) => {
            return Err(BuildError::Precondition(
                "PXE ramdisk requested but no root filesystem image was built".into(),
            )
            .into())
        }
    };
    if !req.base.is_file() {
        return Err(BuildError::Precondition(format!(
            "base initramfs '{}' not found",
            req.base.display()
        ))
        .into());
    }

    recreate_dir(req.work_dir)?;
    let stamp_tree = stage_stamp(req.work_dir, req.variant)?;

    let mut disc = temp_beside(req.output)?;
    {
        let mut base = File::open(req.base)
            .with_context(|| format!("opening base initramfs '{}'", req.base.display()))?;
        io::copy(&mut base, disc.as_file_mut()).context("copying base initramfs")?;
    }
    let mut disc_segments = vec![Segment {
        kind: SegmentKind::Base,
        compression: None,
    }];

    append_cpio(&stamp_tree, disc.as_file_mut(), Compression::Gzip, tools)
        .context("appending variant stamp")?;
    disc_segments.push(Segment {
        kind: SegmentKind::Stamp,
        compression: Some(Compression::Gzip),
    });

    let pxe = match (pxe_output, rootfs) {
        (Some(out), Some(rootfs)) => {
            let rootfs_tree = stage_file(req.work_dir, "rootfs", ROOTFS_NAME, rootfs)?;
            let mut pxe = temp_beside(out)?;
            let disc_file = disc.as_file_mut();
            disc_file.seek(SeekFrom::Start(0))?;
            io::copy(disc_file, pxe.as_file_mut()).context("duplicating ramdisk for PXE")?;

            append_cpio(&rootfs_tree, pxe.as_file_mut(), Compression::Raw, tools)
                .context("appending root filesystem")?;
            pxe.as_file().sync_all()?;
            pxe.persist(out)
                .with_context(|| format!("renaming PXE ramdisk into '{}'", out.display()))?;

            let mut segments = disc_segments.clone();
            segments.push(Segment {
                kind: SegmentKind::RootFs,
                compression: Some(Compression::Raw),
            });
            info!(path = %out.display(), "composed PXE initramfs");
            Some(ComposedRamdisk {
                path: out.to_path_buf(),
                segments,
            })
        }
        _ => None,
    };

    if let Some(osmet) = req.osmet {
        let name = osmet
            .file_name()
            .context("packed metadata path has no file name")?
            .to_string_lossy()
            .into_owned();
        let rel = format!("{OSMET_DIR}/{name}");
        let osmet_tree = stage_file(req.work_dir, "osmet", &rel, osmet)?;
        append_cpio(&osmet_tree, disc.as_file_mut(), Compression::Gzip, tools)
            .context("appending packed metadata")?;
        disc_segments.push(Segment {
            kind: SegmentKind::PackedMetadata,
            compression: Some(Compression::Gzip),
        });
    }

    disc.as_file().sync_all()?;
    disc.persist(req.output)
        .with_context(|| format!("renaming initramfs into '{}'", req.output.display()))?;
    info!(path = %req.output.display(), layers = disc_segments.len(), "composed initramfs");

    Ok(Composition {
        disc: ComposedRamdisk {
            path: req.output.to_path_buf(),
            segments: disc_segments,
        },
        pxe,
    })
}

/// Append `len` zero bytes; returns the new file size.
pub fn append_padding(path: &Path, len: u64) -> Result<u64> {
    let mut f = fs::OpenOptions::new()
        .append(true)
        .open(path)
        .with_context(|| format!("opening '{}' for padding", path.display()))?;
    io::copy(&mut io::repeat(0).take(len), &mut f)
        .with_context(|| format!("padding '{}'", path.display()))?;
    f.flush()?;
    Ok(f.metadata()?.len())
}

fn temp_beside(path: &Path) -> Result<NamedTempFile> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;
    tempfile::Builder::new()
        .prefix(".tmp-initramfs-")
        .tempfile_in(dir)
        .with_context(|| format!("creating temporary ramdisk in '{}'", dir.display()))
}

fn stage_stamp(work_dir: &Path, variant: InitramfsVariant) -> Result<PathBuf> {
    let tree = work_dir.join("stamp");
    let marker = tree.join(variant.stamp_path());
    if let Some(parent) = marker.parent() {
        fs::create_dir_all(parent)?;
    }
    File::create(&marker).with_context(|| format!("creating '{}'", marker.display()))?;
    Ok(tree)
}

/// Stage a single-file tree `<work_dir>/<name>/<rel>` for archiving.
fn stage_file(work_dir: &Path, name: &str, rel: &str, src: &Path) -> Result<PathBuf> {
    let tree = work_dir.join(name);
    recreate_dir(&tree)?;
    let dest = tree.join(rel);
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    if fs::hard_link(src, &dest).is_err() {
        fs::copy(src, &dest)
            .with_context(|| format!("copying '{}' into segment tree", src.display()))?;
    }
    Ok(tree)
}

/// A decoded archive member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub name: String,
    pub mode: u32,
    pub data: Vec<u8>,
}

/// One decoded segment of a ramdisk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentContents {
    pub compression: Compression,
    pub entries: Vec<ArchiveEntry>,
}

const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const NEWC_MAGIC: &[u8] = b"070701";

/// Decode a concatenated ramdisk into its segments, in write order.
///
/// Understands raw and gzip-compressed newc segments, with the zero padding
/// the kernel tolerates between them.
pub fn read_segments(bytes: &[u8]) -> Result<Vec<SegmentContents>> {
    let mut cursor = Cursor::new(bytes);
    let mut segments = Vec::new();

    loop {
        skip_zeros(&mut cursor)?;
        let offset = cursor.position();
        let rest = &bytes[offset as usize..];
        if rest.is_empty() {
            break;
        }
        if rest.starts_with(GZIP_MAGIC) {
            let mut decoder = GzDecoder::new(&mut cursor);
            let entries = read_archive(&mut decoder)
                .with_context(|| format!("reading gzip segment at offset {offset}"))?;
            // Drain cpio block padding and the gzip trailer.
            io::copy(&mut decoder, &mut io::sink())?;
            segments.push(SegmentContents {
                compression: Compression::Gzip,
                entries,
            });
        } else if rest.starts_with(NEWC_MAGIC) {
            let entries = read_archive(&mut cursor)
                .with_context(|| format!("reading raw segment at offset {offset}"))?;
            segments.push(SegmentContents {
                compression: Compression::Raw,
                entries,
            });
        } else {
            bail!("unrecognized ramdisk segment at offset {offset}");
        }
    }

    Ok(segments)
}

fn read_archive<R: Read>(mut reader: R) -> Result<Vec<ArchiveEntry>> {
    let mut entries = Vec::new();
    loop {
        let mut entry = ::cpio::NewcReader::new(reader).context("reading cpio header")?;
        if entry.entry().is_trailer() {
            entry.finish().context("finishing cpio trailer")?;
            return Ok(entries);
        }
        let name = entry.entry().name().to_string();
        let mode = entry.entry().mode();
        let size = u64::from(entry.entry().file_size());
        let mut data = Vec::new();
        entry
            .read_to_end(&mut data)
            .with_context(|| format!("reading cpio entry '{name}'"))?;
        if data.len() as u64 != size {
            bail!(
                "cpio entry '{name}' is truncated: header says {size} bytes, found {}",
                data.len()
            );
        }
        entries.push(ArchiveEntry { name, mode, data });
        reader = entry.finish().context("finishing cpio entry")?;
    }
}

fn skip_zeros(cursor: &mut Cursor<&[u8]>) -> Result<()> {
    loop {
        let buf = cursor.fill_buf()?;
        let zeros = buf.iter().take_while(|b| **b == 0).count();
        if zeros == 0 {
            return Ok(());
        }
        cursor.consume(zeros);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::cpio::build_cpio;
    use tempfile::TempDir;

    struct Fixture {
        temp: TempDir,
        base: PathBuf,
        base_entries: Vec<ArchiveEntry>,
        osmet: PathBuf,
        rootfs: PathBuf,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let base_root = temp.path().join("base-root");
        fs::create_dir_all(base_root.join("usr/bin")).unwrap();
        fs::write(base_root.join("init"), "#!/bin/sh\n").unwrap();
        fs::write(base_root.join("usr/bin/ignition"), "ELF").unwrap();
        let base = temp.path().join("base.img");
        build_cpio(&base_root, &base, Compression::Gzip, &Tools::default()).unwrap();
        let base_entries = read_segments(&fs::read(&base).unwrap())
            .unwrap()
            .remove(0)
            .entries;

        let osmet = temp.path().join("fcos-metal.x86_64.osmet");
        fs::write(&osmet, b"OSMET\x00\x01packed").unwrap();
        let rootfs = temp.path().join("root.squashfs");
        fs::write(&rootfs, b"hsqs squashfs payload").unwrap();

        Fixture {
            temp,
            base,
            base_entries,
            osmet,
            rootfs,
        }
    }

    fn entry<'a>(segment: &'a SegmentContents, name: &str) -> &'a ArchiveEntry {
        segment
            .entries
            .iter()
            .find(|e| e.name == name)
            .unwrap_or_else(|| panic!("missing entry {name}"))
    }

    #[test]
    fn test_compose_live_with_osmet_and_pxe() {
        let fx = fixture();
        let output = fx.temp.path().join("out/initramfs.img");
        let pxe_output = fx.temp.path().join("out/pxe-initramfs.img");
        let req = ComposeRequest {
            base: &fx.base,
            variant: InitramfsVariant::Live,
            osmet: Some(&fx.osmet),
            for_pxe: true,
            rootfs: Some(&fx.rootfs),
            work_dir: &fx.temp.path().join("work"),
            output: &output,
            pxe_output: Some(&pxe_output),
        };

        let composition = compose(&req, &Tools::default()).unwrap();

        // Disc ramdisk: base, stamp, osmet.
        let disc = fs::read(&output).unwrap();
        let base_bytes = fs::read(&fx.base).unwrap();
        assert!(disc.starts_with(&base_bytes));
        let segments = read_segments(&disc).unwrap();
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0].entries, fx.base_entries);

        let stamp_files: Vec<_> = segments[1]
            .entries
            .iter()
            .filter(|e| e.mode & 0o170000 == 0o100000)
            .collect();
        assert_eq!(stamp_files.len(), 1);
        assert_eq!(stamp_files[0].name, "etc/coreos-live-initramfs");
        assert!(stamp_files[0].data.is_empty());
        assert_eq!(segments[1].compression, Compression::Gzip);

        let blob = entry(
            &segments[2],
            "usr/share/coreos-installer/fcos-metal.x86_64.osmet",
        );
        assert_eq!(blob.data, b"OSMET\x00\x01packed");
        assert_eq!(segments[2].compression, Compression::Gzip);

        // PXE ramdisk: base, stamp, rootfs (raw); no osmet.
        let pxe = read_segments(&fs::read(&pxe_output).unwrap()).unwrap();
        assert_eq!(pxe.len(), 3);
        assert_eq!(pxe[1], segments[1]);
        assert_eq!(pxe[2].compression, Compression::Raw);
        assert_eq!(entry(&pxe[2], ROOTFS_NAME).data, b"hsqs squashfs payload");

        let kinds: Vec<_> = composition.disc.segments.iter().map(|s| s.kind).collect();
        assert_eq!(
            kinds,
            [SegmentKind::Base, SegmentKind::Stamp, SegmentKind::PackedMetadata]
        );
        let pxe_kinds: Vec<_> = composition
            .pxe
            .unwrap()
            .segments
            .iter()
            .map(|s| s.kind)
            .collect();
        assert_eq!(
            pxe_kinds,
            [SegmentKind::Base, SegmentKind::Stamp, SegmentKind::RootFs]
        );
    }

    #[test]
    fn test_compose_installer_without_osmet() {
        let fx = fixture();
        let output = fx.temp.path().join("initramfs.img");
        let req = ComposeRequest {
            base: &fx.base,
            variant: InitramfsVariant::LegacyInstaller,
            osmet: None,
            for_pxe: false,
            rootfs: None,
            work_dir: &fx.temp.path().join("work"),
            output: &output,
            pxe_output: None,
        };

        let composition = compose(&req, &Tools::default()).unwrap();
        assert!(composition.pxe.is_none());

        let segments = read_segments(&fs::read(&output).unwrap()).unwrap();
        assert_eq!(segments.len(), 2);
        entry(&segments[1], "etc/coreos-legacy-installer-initramfs");
        assert!(segments[1]
            .entries
            .iter()
            .all(|e| e.name != "etc/coreos-live-initramfs"));
    }

    #[test]
    fn test_compose_pxe_requires_rootfs() {
        let fx = fixture();
        let output = fx.temp.path().join("initramfs.img");
        let pxe_output = fx.temp.path().join("pxe.img");
        let req = ComposeRequest {
            base: &fx.base,
            variant: InitramfsVariant::Live,
            osmet: None,
            for_pxe: true,
            rootfs: None,
            work_dir: &fx.temp.path().join("work"),
            output: &output,
            pxe_output: Some(&pxe_output),
        };
        let err = compose(&req, &Tools::default()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BuildError>(),
            Some(BuildError::Precondition(_))
        ));
        assert!(!output.exists());
    }

    #[test]
    fn test_failed_append_leaves_no_output() {
        let fx = fixture();
        let output = fx.temp.path().join("initramfs.img");
        let req = ComposeRequest {
            base: &fx.base,
            variant: InitramfsVariant::Live,
            osmet: None,
            for_pxe: false,
            rootfs: None,
            work_dir: &fx.temp.path().join("work"),
            output: &output,
            pxe_output: None,
        };
        let tools = Tools {
            gzip: "false".into(),
            ..Tools::default()
        };
        assert!(compose(&req, &tools).is_err());
        assert!(!output.exists());
    }

    #[test]
    fn test_append_padding() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("initramfs.img");
        fs::write(&path, b"data").unwrap();
        let size = append_padding(&path, 4096).unwrap();
        assert_eq!(size, 4100);
        let bytes = fs::read(&path).unwrap();
        assert!(bytes[4..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_compose_pxe_requires_output_path() {
        let fx = fixture();
        let output = fx.temp.path().join("initramfs.img");
        let req = ComposeRequest {
            base: &fx.base,
            variant: InitramfsVariant::Live,
            osmet: None,
            for_pxe: true,
            rootfs: Some(&fx.rootfs),
            work_dir: &fx.temp.path().join("work"),
            output: &output,
            pxe_output: None,
        };
        let err = compose(&req, &Tools::default()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BuildError>(),
            Some(BuildError::Precondition(_))
        ));
    }

    #[test]
    fn test_read_segments_rejects_oversized_entry() {
        // newc header claiming a ~4 GiB file followed by three bytes of data.
        let mut bytes = b"070701".to_vec();
        for field in [0, 0o100644, 0, 0, 1, 0, 0xffff_fffc, 0, 0, 0, 0, 4, 0u32] {
            bytes.extend(format!("{field:08x}").as_bytes());
        }
        bytes.extend(b"big\0\0\0abc");

        let err = read_segments(&bytes).unwrap_err();
        assert!(format!("{err:#}").contains("truncated"), "{err:#}");
    }

    #[test]
    fn test_read_segments_rejects_garbage() {
        assert!(read_segments(b"\x00\x00not an archive").is_err());
        assert!(read_segments(b"").unwrap().is_empty());
    }
}
