//! Build-metadata ledger (`meta.json`) and output reconciliation.
//!
//! The ledger is loaded once, threaded through the build as a value, and
//! written back once with an atomic rename. Keys this crate does not know
//! about are carried through untouched.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};

use crate::error::BuildError;

pub const META_FILENAME: &str = "meta.json";

/// Key under which the extension run records its completion time.
pub const BUILD_TIMESTAMP_KEY: &str = "live-iso-build-timestamp";

/// `images.<role>` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageEntry {
    pub path: String,
    pub sha256: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildMeta {
    #[serde(rename = "buildid")]
    pub build_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "ostree-commit")]
    pub ostree_commit: String,
    #[serde(default)]
    pub images: BTreeMap<String, ImageEntry>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Which kind of file an artifact is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactRole {
    Iso,
    Kernel,
    Initramfs,
    Rootfs,
}

impl ArtifactRole {
    /// Ledger key for this role; live media gets a `live-` prefix.
    pub fn key(&self, live: bool) -> &'static str {
        match (self, live) {
            (ArtifactRole::Iso, true) => "live-iso",
            (ArtifactRole::Iso, false) => "iso",
            (ArtifactRole::Kernel, true) => "live-kernel",
            (ArtifactRole::Kernel, false) => "kernel",
            (ArtifactRole::Initramfs, true) => "live-initramfs",
            (ArtifactRole::Initramfs, false) => "initramfs",
            (ArtifactRole::Rootfs, _) => "live-rootfs",
        }
    }
}

/// A produced file with its checksum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildArtifact {
    pub role: ArtifactRole,
    pub path: PathBuf,
    pub sha256: String,
    pub size: u64,
}

impl BuildArtifact {
    pub fn from_file(role: ArtifactRole, path: &Path) -> Result<Self> {
        let (sha256, size) = sha256_file(path)?;
        Ok(Self {
            role,
            path: path.to_path_buf(),
            sha256,
            size,
        })
    }
}

/// `meta.json` of one `builds/<id>/<arch>/` directory.
#[derive(Debug, Clone, PartialEq)]
pub struct Ledger {
    path: PathBuf,
    meta: BuildMeta,
}

impl Ledger {
    pub fn load(build_dir: &Path) -> Result<Self> {
        let path = build_dir.join(META_FILENAME);
        if !path.is_file() {
            return Err(BuildError::Precondition(format!(
                "build metadata '{}' not found",
                path.display()
            ))
            .into());
        }
        let bytes =
            fs::read(&path).with_context(|| format!("reading ledger '{}'", path.display()))?;
        let meta: BuildMeta = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing ledger '{}'", path.display()))?;
        Ok(Self { path, meta })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory the ledger lives in; image paths are relative to it.
    pub fn build_dir(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new("."))
    }

    pub fn meta(&self) -> &BuildMeta {
        &self.meta
    }

    pub fn image(&self, key: &str) -> Option<&ImageEntry> {
        self.meta.images.get(key)
    }

    pub fn has_image(&self, key: &str) -> bool {
        self.meta.images.contains_key(key)
    }

    /// Absolute path of a recorded image, checked to exist on disk.
    pub fn require_image_path(&self, key: &str) -> Result<PathBuf> {
        let entry = self.image(key).ok_or_else(|| {
            BuildError::Precondition(format!(
                "build {} has no '{}' image",
                self.meta.build_id, key
            ))
        })?;
        let path = self.build_dir().join(&entry.path);
        if !path.is_file() {
            return Err(BuildError::Precondition(format!(
                "'{}' image '{}' is missing on disk",
                key,
                path.display()
            ))
            .into());
        }
        Ok(path)
    }

    /// Record an artifact under its role key. The stored path is relative to
    /// the build directory, so the artifact must already live there.
    pub fn with_artifact(mut self, artifact: &BuildArtifact, live: bool) -> Result<Self> {
        let rel = artifact
            .path
            .strip_prefix(self.build_dir())
            .with_context(|| {
                format!(
                    "artifact '{}' is outside build directory '{}'",
                    artifact.path.display(),
                    self.build_dir().display()
                )
            })?
            .to_string_lossy()
            .into_owned();
        if rel.is_empty() {
            bail!("artifact path '{}' names the build directory", artifact.path.display());
        }
        self.meta.images.insert(
            artifact.role.key(live).to_string(),
            ImageEntry {
                path: rel,
                sha256: artifact.sha256.clone(),
                extra: BTreeMap::from([("size".to_string(), Value::from(artifact.size))]),
            },
        );
        Ok(self)
    }

    pub fn with_field(mut self, key: &str, value: Value) -> Self {
        self.meta.extra.insert(key.to_string(), value);
        self
    }

    /// Write the ledger back via temp file + rename in the same directory.
    pub fn persist(&self) -> Result<()> {
        let dir = self.build_dir();
        let mut tmp = tempfile::Builder::new()
            .prefix(".meta.json.")
            .tempfile_in(dir)
            .with_context(|| format!("creating temporary ledger in '{}'", dir.display()))?;
        serde_json::to_writer_pretty(&mut tmp, &self.meta).context("serializing ledger")?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)
            .with_context(|| format!("replacing ledger '{}'", self.path.display()))?;
        Ok(())
    }
}

/// sha256 and size of a file.
pub fn sha256_file(path: &Path) -> Result<(String, u64)> {
    let f = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut r = BufReader::new(f);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    let mut size = 0u64;
    loop {
        let n = r.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((format!("{:x}", hasher.finalize()), size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const META: &str = r#"{
  "buildid": "41.20250101.1.0",
  "name": "fedora-coreos",
  "ostree-commit": "abc123",
  "coreos-assembler.build-timestamp": "2025-01-01T00:00:00Z",
  "images": {
    "metal": {
      "path": "fedora-coreos-41.20250101.1.0-metal.x86_64.raw",
      "sha256": "00",
      "size": 10
    }
  }
}"#;

    fn setup() -> (TempDir, Ledger) {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join(META_FILENAME), META).unwrap();
        let ledger = Ledger::load(temp.path()).unwrap();
        (temp, ledger)
    }

    #[test]
    fn test_load() {
        let (_temp, ledger) = setup();
        assert_eq!(ledger.meta().build_id, "41.20250101.1.0");
        assert_eq!(ledger.meta().ostree_commit, "abc123");
        assert!(ledger.has_image("metal"));
        assert!(!ledger.has_image("live-iso"));
    }

    #[test]
    fn test_missing_ledger_is_precondition() {
        let temp = TempDir::new().unwrap();
        let err = Ledger::load(temp.path()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BuildError>(),
            Some(BuildError::Precondition(_))
        ));
    }

    #[test]
    fn test_require_image_path_checks_disk() {
        let (temp, ledger) = setup();
        assert!(ledger.require_image_path("metal").is_err());
        fs::write(
            temp.path()
                .join("fedora-coreos-41.20250101.1.0-metal.x86_64.raw"),
            b"disk",
        )
        .unwrap();
        assert!(ledger.require_image_path("metal").is_ok());
        assert!(ledger.require_image_path("qemu").is_err());
    }

    #[test]
    fn test_record_and_persist_preserves_unknown_fields() {
        let (temp, ledger) = setup();
        let iso = temp.path().join("fcos-live.x86_64.iso");
        fs::write(&iso, b"iso bytes").unwrap();
        let artifact = BuildArtifact::from_file(ArtifactRole::Iso, &iso).unwrap();

        let ledger = ledger
            .with_artifact(&artifact, true)
            .unwrap()
            .with_field(BUILD_TIMESTAMP_KEY, Value::from("now"));
        ledger.persist().unwrap();

        let reloaded = Ledger::load(temp.path()).unwrap();
        let entry = reloaded.image("live-iso").unwrap();
        assert_eq!(entry.path, "fcos-live.x86_64.iso");
        assert_eq!(entry.sha256, artifact.sha256);
        assert_eq!(
            reloaded.meta().extra["coreos-assembler.build-timestamp"],
            Value::from("2025-01-01T00:00:00Z")
        );
        assert_eq!(reloaded.image("metal").unwrap().extra["size"], Value::from(10));
        assert_eq!(reloaded, ledger);
    }

    #[test]
    fn test_artifact_outside_build_dir_rejected() {
        let (_temp, ledger) = setup();
        let other = TempDir::new().unwrap();
        let file = other.path().join("x.iso");
        fs::write(&file, b"x").unwrap();
        let artifact = BuildArtifact::from_file(ArtifactRole::Iso, &file).unwrap();
        assert!(ledger.with_artifact(&artifact, false).is_err());
    }

    #[test]
    fn test_sha256_file() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("f");
        fs::write(&file, b"abc").unwrap();
        let (sha, size) = sha256_file(&file).unwrap();
        assert_eq!(
            sha,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(size, 3);
    }

    #[test]
    fn test_role_keys() {
        assert_eq!(ArtifactRole::Iso.key(true), "live-iso");
        assert_eq!(ArtifactRole::Iso.key(false), "iso");
        assert_eq!(ArtifactRole::Initramfs.key(false), "initramfs");
        assert_eq!(ArtifactRole::Rootfs.key(true), "live-rootfs");
    }
}
