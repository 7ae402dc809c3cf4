//! Builder configuration (`liveiso.toml`).
//!
//! Every key is optional; a missing file behaves like an empty one.
//!
//! ```toml
//! product-name = "fedora-coreos"
//! initrd-ignition-padding = 262144
//!
//! [osmet]
//! mode = "vm"
//!
//! [tools]
//! genisoimage = "/usr/bin/genisoimage"
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::artifact::iso::embed::DEFAULT_IGNITION_PADDING;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct BuildConfig {
    /// Overrides the `name` recorded in the build ledger.
    pub product_name: Option<String>,
    /// Root of the `builds/<id>/<arch>/` hierarchy.
    pub builds_dir: PathBuf,
    /// ostree repository holding the build commits.
    pub ostree_repo: PathBuf,
    /// Template tree copied into the ISO root.
    pub live_config_dir: PathBuf,
    /// Directory with the syslinux BIOS loader binaries.
    pub syslinux_dir: PathBuf,
    /// Scratch space, wiped at the start of every run.
    pub work_dir: PathBuf,
    /// Zero bytes appended to the ISO initramfs for later Ignition embedding.
    pub initrd_ignition_padding: u64,
    /// `mksquashfs -comp` value for the live root filesystem.
    pub squashfs_compression: String,
    pub osmet: OsmetConfig,
    pub tools: Tools,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            product_name: None,
            builds_dir: PathBuf::from("builds"),
            ostree_repo: PathBuf::from("tmp/repo"),
            live_config_dir: PathBuf::from("src/config/live"),
            syslinux_dir: PathBuf::from("/usr/share/syslinux"),
            work_dir: PathBuf::from("tmp/buildextend-live"),
            initrd_ignition_padding: DEFAULT_IGNITION_PADDING,
            squashfs_compression: "zstd".to_string(),
            osmet: OsmetConfig::default(),
            tools: Tools::default(),
        }
    }
}

/// How the packed-metadata blob is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsmetMode {
    /// Run the producer on the host.
    #[default]
    Direct,
    /// Run the producer inside the VM sandbox.
    Vm,
    /// Skip the packed-metadata segment entirely.
    Disabled,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct OsmetConfig {
    pub mode: OsmetMode,
    /// Helper binary embedded into the blob (`--coreinst`).
    pub helper: Option<PathBuf>,
    /// Memory for the sandbox VM, in MiB.
    pub vm_memory_mb: Option<u32>,
}

/// Program paths for every external tool the build runs.
///
/// Defaults are bare names resolved through `PATH`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct Tools {
    pub find: String,
    pub sort: String,
    pub cpio: String,
    pub gzip: String,
    pub genisoimage: String,
    pub xorrisofs: String,
    pub isohybrid: String,
    pub isoinfo: String,
    pub grub2_mkrescue: String,
    pub mk_s390_cdboot: String,
    pub virt_make_fs: String,
    pub mksquashfs: String,
    pub ostree: String,
    pub coreos_installer: String,
    pub vm_runner: String,
}

impl Default for Tools {
    fn default() -> Self {
        Self {
            find: "find".into(),
            sort: "sort".into(),
            cpio: "cpio".into(),
            gzip: "gzip".into(),
            genisoimage: "genisoimage".into(),
            xorrisofs: "xorrisofs".into(),
            isohybrid: "isohybrid".into(),
            isoinfo: "isoinfo".into(),
            grub2_mkrescue: "grub2-mkrescue".into(),
            mk_s390_cdboot: "mk-s390-cdboot".into(),
            virt_make_fs: "virt-make-fs".into(),
            mksquashfs: "mksquashfs".into(),
            ostree: "ostree".into(),
            coreos_installer: "coreos-installer".into(),
            vm_runner: "runvm".into(),
        }
    }
}

/// Load the config, falling back to defaults when `path` does not exist.
pub fn load_build_config(path: &Path) -> Result<BuildConfig> {
    if !path.exists() {
        return Ok(BuildConfig::default());
    }
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading builder config '{}'", path.display()))?;
    parse_build_config(&text)
        .with_context(|| format!("parsing builder config '{}'", path.display()))
}

pub fn parse_build_config(text: &str) -> Result<BuildConfig> {
    let config: BuildConfig = toml::from_str(text)?;
    if config.initrd_ignition_padding == 0 {
        bail!("initrd-ignition-padding must be greater than zero");
    }
    if config.squashfs_compression.trim().is_empty() {
        bail!("squashfs-compression must not be empty");
    }
    if let Some(name) = &config.product_name {
        if name.trim().is_empty() {
            bail!("product-name must not be empty when set");
        }
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = parse_build_config("").unwrap();
        assert_eq!(config.initrd_ignition_padding, 256 * 1024);
        assert_eq!(config.osmet.mode, OsmetMode::Direct);
        assert_eq!(config.tools.cpio, "cpio");
        assert_eq!(config.builds_dir, PathBuf::from("builds"));
    }

    #[test]
    fn test_overrides() {
        let config = parse_build_config(
            r#"
product-name = "fedora-coreos"
initrd-ignition-padding = 4096

[osmet]
mode = "disabled"

[tools]
genisoimage = "/opt/bin/genisoimage"
"#,
        )
        .unwrap();
        assert_eq!(config.product_name.as_deref(), Some("fedora-coreos"));
        assert_eq!(config.initrd_ignition_padding, 4096);
        assert_eq!(config.osmet.mode, OsmetMode::Disabled);
        assert_eq!(config.tools.genisoimage, "/opt/bin/genisoimage");
        assert_eq!(config.tools.isoinfo, "isoinfo");
    }

    #[test]
    fn test_unknown_key_rejected() {
        assert!(parse_build_config("bogus = 1\n").is_err());
        assert!(parse_build_config("[tools]\nmkisofs = \"x\"\n").is_err());
    }

    #[test]
    fn test_zero_padding_rejected() {
        assert!(parse_build_config("initrd-ignition-padding = 0\n").is_err());
    }

    #[test]
    fn test_missing_file_is_default() {
        let temp = TempDir::new().unwrap();
        let config = load_build_config(&temp.path().join("liveiso.toml")).unwrap();
        assert_eq!(config.squashfs_compression, "zstd");
    }
}
