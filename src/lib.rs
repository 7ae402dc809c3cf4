//! Live ISO and PXE media builder.
//!
//! Turns a finished OS build (an ostree commit plus its `meta.json`) into
//! bootable live media:
//!
//! - **Segment archiver** - directory trees to reproducible newc segments
//! - **Initramfs composer** - base ramdisk + stamp + osmet (+ rootfs for PXE)
//! - **Disc assembly** - per-architecture ISO layout and generator
//! - **Ignition offset header** - records the ramdisk's zero tail in the ISO
//! - **Ledger** - checksums outputs into `meta.json`
//!
//! # Architecture
//!
//! ```text
//! live::run
//!     │
//!     ├── commit      ostree checkout, kernel + initramfs lookup
//!     ├── squashfs    live root filesystem
//!     ├── osmet       packed metadata for offline installs
//!     ├── initramfs   layered ramdisk (cpio segments)
//!     ├── iso         BootAssembler per Arch, embed header
//!     └── ledger      checksums, atomic meta.json update
//! ```

pub mod arch;
pub mod artifact;
pub mod commit;
pub mod config;
pub mod context;
pub mod error;
pub mod ledger;
pub mod live;
pub mod osmet;
pub mod preflight;
pub mod process;

#[cfg(test)]
mod test_utils;

pub use context::BuildContext;
pub use error::BuildError;
