//! Artifact builders for live media.
//!
//! - [`cpio`] - newc archive segments
//! - [`filesystem`] - directory copies, template rendering, mtime clamping
//! - [`initramfs`] - layered ramdisk composition and decoding
//! - [`iso`] - per-architecture disc assembly and the Ignition offset header
//! - [`squashfs`] - root filesystem images (mksquashfs)

pub mod cpio;
pub mod filesystem;
pub mod initramfs;
pub mod iso;
pub mod squashfs;
