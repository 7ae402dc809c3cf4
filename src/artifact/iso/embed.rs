//! Ignition offset header.
//!
//! The live initramfs on the disc ends in a run of zero bytes. Recording
//! where that run sits inside the ISO lets a later tool drop an Ignition
//! config into it without re-mastering the image. The location is written
//! into the unused tail of the ISO9660 system area:
//!
//! ```text
//! [32744, 32752)  magic "coreiso+"
//! [32752, 32760)  offset of the zero run, u64 LE
//! [32760, 32768)  length of the zero run, u64 LE
//! ```

use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use tracing::info;

use crate::error::BuildError;
use crate::process::Cmd;

pub const ISO_SECTOR_SIZE: u64 = 2048;
/// Size of the ISO9660 system area (sectors 0-15).
pub const SYSTEM_AREA_SIZE: u64 = 32768;
pub const IGNITION_HEADER_MAGIC: &[u8; 8] = b"coreiso+";
pub const IGNITION_HEADER_SIZE: u64 = 24;
/// Zero bytes reserved at the end of the live initramfs.
pub const DEFAULT_IGNITION_PADDING: u64 = 256 * 1024;

const HEADER_OFFSET: u64 = SYSTEM_AREA_SIZE - IGNITION_HEADER_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IgnitionOffsetHeader {
    pub offset: u64,
    pub length: u64,
}

impl IgnitionOffsetHeader {
    pub fn to_bytes(&self) -> [u8; IGNITION_HEADER_SIZE as usize] {
        let mut buf = [0u8; IGNITION_HEADER_SIZE as usize];
        buf[..8].copy_from_slice(IGNITION_HEADER_MAGIC);
        buf[8..16].copy_from_slice(&self.offset.to_le_bytes());
        buf[16..].copy_from_slice(&self.length.to_le_bytes());
        buf
    }

    /// `None` if the magic doesn't match.
    pub fn from_bytes(buf: &[u8; IGNITION_HEADER_SIZE as usize]) -> Option<Self> {
        if &buf[..8] != IGNITION_HEADER_MAGIC {
            return None;
        }
        let mut word = [0u8; 8];
        word.copy_from_slice(&buf[8..16]);
        let offset = u64::from_le_bytes(word);
        word.copy_from_slice(&buf[16..]);
        let length = u64::from_le_bytes(word);
        Some(Self { offset, length })
    }
}

/// Find the starting sector of `name` in an `isoinfo -lR` listing.
///
/// Entries look like
/// `-r--r--r--   1    0    0   1234 Jan  1 2025 [   1234 00]  initramfs.img`.
/// Exactly one regular-file entry (flags `00`) with that name must exist.
pub fn find_extent(listing: &str, name: &str) -> Result<u64> {
    let mut found = Vec::new();
    for line in listing.lines() {
        let Some(close) = line.rfind(']') else {
            continue;
        };
        if line[close + 1..].trim() != name {
            continue;
        }
        let Some(open) = line[..close].rfind('[') else {
            continue;
        };
        let mut fields = line[open + 1..close].split_whitespace();
        if let (Some(extent), Some("00"), None) = (fields.next(), fields.next(), fields.next()) {
            if let Ok(extent) = extent.parse::<u64>() {
                found.push(extent);
            }
        }
    }
    match found.as_slice() {
        [extent] => Ok(*extent),
        [] => Err(BuildError::Integrity(format!("'{name}' not found in ISO listing")).into()),
        _ => Err(BuildError::Integrity(format!(
            "'{name}' appears {} times in ISO listing",
            found.len()
        ))
        .into()),
    }
}

/// Verify the zero run and write the header into `iso`.
///
/// `extent` is the ramdisk's starting sector, `ramdisk_size` its size on
/// the disc and `padding` the length of its zero tail.
pub fn embed_at(
    iso: &Path,
    extent: u64,
    ramdisk_size: u64,
    padding: u64,
) -> Result<IgnitionOffsetHeader> {
    let offset = extent
        .checked_mul(ISO_SECTOR_SIZE)
        .and_then(|start| start.checked_add(ramdisk_size))
        .and_then(|end| end.checked_sub(padding))
        .ok_or_else(|| {
            BuildError::Integrity(format!(
                "padding of {padding} bytes does not fit a {ramdisk_size} byte ramdisk at sector {extent}"
            ))
        })?;

    let mut f = OpenOptions::new()
        .read(true)
        .write(true)
        .open(iso)
        .with_context(|| format!("opening '{}'", iso.display()))?;
    let iso_size = f.metadata()?.len();
    let end = offset.checked_add(padding).unwrap_or(u64::MAX);
    if offset < SYSTEM_AREA_SIZE || end > iso_size {
        return Err(BuildError::Integrity(format!(
            "padding range {offset}..{end} lies outside the data area of a {iso_size} byte image"
        ))
        .into());
    }

    f.seek(SeekFrom::Start(offset))?;
    let mut region = (&mut f).take(padding);
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = region.read(&mut buf)?;
        if n == 0 {
            break;
        }
        if buf[..n].iter().any(|b| *b != 0) {
            return Err(BuildError::Integrity(format!(
                "ramdisk padding at offset {offset} of '{}' is not zero",
                iso.display()
            ))
            .into());
        }
    }

    let header = IgnitionOffsetHeader {
        offset,
        length: padding,
    };
    f.seek(SeekFrom::Start(HEADER_OFFSET))?;
    f.write_all(&header.to_bytes())
        .with_context(|| format!("writing header into '{}'", iso.display()))?;
    f.sync_all()?;
    Ok(header)
}

/// Locate the live ramdisk inside `iso` with `isoinfo` and embed the header.
pub fn embed_ignition_offset(
    isoinfo: &str,
    iso: &Path,
    ramdisk_name: &str,
    ramdisk_size: u64,
    padding: u64,
) -> Result<IgnitionOffsetHeader> {
    let listing = Cmd::new(isoinfo)
        .args(["-lR", "-i"])
        .arg_path(iso)
        .error_msg("isoinfo failed. Install genisoimage.")
        .run()?;
    let extent = find_extent(&listing.stdout, ramdisk_name)?;
    let header = embed_at(iso, extent, ramdisk_size, padding)?;
    info!(
        offset = header.offset,
        length = header.length,
        "embedded ignition offset header"
    );
    Ok(header)
}

/// Decode the header of an existing image.
///
/// `Ok(None)` when the image carries no header. A header pointing past the
/// end of the image is an integrity error.
pub fn read_header(iso: &Path) -> Result<Option<IgnitionOffsetHeader>> {
    let mut f = File::open(iso).with_context(|| format!("opening '{}'", iso.display()))?;
    let iso_size = f.metadata()?.len();
    if iso_size < SYSTEM_AREA_SIZE {
        return Err(BuildError::Integrity(format!(
            "'{}' is smaller than the ISO9660 system area",
            iso.display()
        ))
        .into());
    }
    let mut buf = [0u8; IGNITION_HEADER_SIZE as usize];
    f.seek(SeekFrom::Start(HEADER_OFFSET))?;
    f.read_exact(&mut buf)?;

    let Some(header) = IgnitionOffsetHeader::from_bytes(&buf) else {
        return Ok(None);
    };
    let in_bounds = header
        .offset
        .checked_add(header.length)
        .is_some_and(|end| end <= iso_size);
    if header.offset < SYSTEM_AREA_SIZE || !in_bounds {
        return Err(BuildError::Integrity(format!(
            "header in '{}' points outside the image ({}+{} > {})",
            iso.display(),
            header.offset,
            header.length,
            iso_size
        ))
        .into());
    }
    Ok(Some(header))
}
