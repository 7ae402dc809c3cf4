//! Per-run build context and output naming.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::arch::Arch;
use crate::artifact::initramfs::InitramfsVariant;
use crate::config::BuildConfig;
use crate::error::BuildError;

/// Index of all builds, newest first.
pub const BUILDS_INDEX: &str = "builds.json";

#[derive(Debug, Deserialize)]
struct BuildsIndex {
    #[serde(default)]
    builds: Vec<BuildsIndexEntry>,
}

#[derive(Debug, Deserialize)]
struct BuildsIndexEntry {
    id: String,
}

/// The requested build id, or the newest one listed in `builds.json`.
pub fn resolve_build_id(builds_dir: &Path, requested: Option<&str>) -> Result<String> {
    if let Some(id) = requested {
        return Ok(id.to_string());
    }
    let path = builds_dir.join(BUILDS_INDEX);
    if !path.is_file() {
        return Err(BuildError::Precondition(format!(
            "no build given and '{}' does not exist",
            path.display()
        ))
        .into());
    }
    let text = fs::read_to_string(&path).with_context(|| format!("reading '{}'", path.display()))?;
    let index: BuildsIndex =
        serde_json::from_str(&text).with_context(|| format!("parsing '{}'", path.display()))?;
    index
        .builds
        .into_iter()
        .next()
        .map(|b| b.id)
        .ok_or_else(|| BuildError::Precondition(format!("'{}' lists no builds", path.display())).into())
}

/// Everything fixed for one run of the extension.
#[derive(Debug, Clone)]
pub struct BuildContext {
    pub config: BuildConfig,
    pub build_id: String,
    pub arch: Arch,
    pub variant: InitramfsVariant,
    pub force: bool,
}

impl BuildContext {
    pub fn new(
        config: BuildConfig,
        build_id: &str,
        arch: Arch,
        variant: InitramfsVariant,
        force: bool,
    ) -> Self {
        Self {
            config,
            build_id: build_id.to_string(),
            arch,
            variant,
            force,
        }
    }

    /// `builds/<id>/<arch>`, where the ledger and outputs live.
    pub fn build_dir(&self) -> PathBuf {
        self.config
            .builds_dir
            .join(&self.build_id)
            .join(self.arch.as_str())
    }

    /// Scratch directory for this run.
    pub fn work_dir(&self) -> PathBuf {
        self.config
            .work_dir
            .join(format!("{}-{}", self.variant.label(), self.arch))
    }

    pub fn is_live(&self) -> bool {
        self.variant.is_live()
    }
}

/// File names of everything a run publishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputNames {
    pub iso: String,
    pub kernel: String,
    pub initramfs: String,
    pub rootfs: String,
    pub osmet: String,
}

impl OutputNames {
    pub fn new(product: &str, build_id: &str, variant: InitramfsVariant, arch: Arch) -> Self {
        let base = format!("{product}-{build_id}");
        let label = variant.label();
        Self {
            iso: format!("{base}-{label}.{arch}.iso"),
            kernel: format!("{base}-{label}-kernel-{arch}"),
            initramfs: format!("{base}-{label}-initramfs.{arch}.img"),
            rootfs: format!("{base}-live-rootfs.{arch}.img"),
            osmet: format!("{base}-metal.{arch}.osmet"),
        }
    }
}
