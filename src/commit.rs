//! Access to the ostree commit a build was made from.
//!
//! Only a thin wrapper over `ostree checkout`; everything else reads the
//! checked-out tree directly.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::BuildError;
use crate::process::Cmd;

pub const MODULES_DIR: &str = "usr/lib/modules";
/// Where bootupd ships the UEFI payload inside the commit.
pub const EFI_SUBPATH: &str = "usr/lib/bootupd/updates/EFI";
/// Build-time image settings recorded in the commit.
pub const IMAGE_JSON: &str = "usr/share/coreos-assembler/image.json";

#[derive(Debug, Clone)]
pub struct CommitStore {
    ostree: String,
    repo: PathBuf,
}

impl CommitStore {
    pub fn new(ostree: &str, repo: &Path) -> Self {
        Self {
            ostree: ostree.to_string(),
            repo: repo.to_path_buf(),
        }
    }

    /// Check out `commit` into `dest`, which must not exist yet.
    pub fn checkout(&self, commit: &str, dest: &Path) -> Result<()> {
        if !self.repo.is_dir() {
            return Err(BuildError::Precondition(format!(
                "ostree repository '{}' not found",
                self.repo.display()
            ))
            .into());
        }
        Cmd::new(&self.ostree)
            .arg("checkout")
            .arg(format!("--repo={}", self.repo.display()))
            .arg("--user-mode")
            .arg(commit)
            .arg_path(dest)
            .error_msg("ostree checkout failed. Install ostree.")
            .run()?;
        info!(commit, dest = %dest.display(), "checked out");
        Ok(())
    }
}

/// Kernel and initramfs of a checked-out tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootFiles {
    pub kernel_version: String,
    pub kernel: PathBuf,
    pub initramfs: PathBuf,
}

/// Locate `usr/lib/modules/<kver>/{vmlinuz,initramfs.img}`.
///
/// The tree must ship exactly one kernel.
pub fn find_kernel(root: &Path) -> Result<BootFiles> {
    let modules = root.join(MODULES_DIR);
    let entries = fs::read_dir(&modules)
        .with_context(|| format!("reading '{}'", modules.display()))?;
    let mut versions = Vec::new();
    for entry in entries {
        let entry = entry?;
        if entry.path().join("vmlinuz").is_file() {
            versions.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    versions.sort();

    let kernel_version = match versions.as_slice() {
        [one] => one.clone(),
        [] => {
            return Err(BuildError::Precondition(format!(
                "no kernel found under '{}'",
                modules.display()
            ))
            .into())
        }
        many => {
            return Err(BuildError::Precondition(format!(
                "expected one kernel, found {}",
                many.join(", ")
            ))
            .into())
        }
    };

    let dir = modules.join(&kernel_version);
    let initramfs = dir.join("initramfs.img");
    if !initramfs.is_file() {
        return Err(BuildError::Precondition(format!(
            "kernel {kernel_version} has no initramfs.img"
        ))
        .into());
    }
    Ok(BootFiles {
        kernel: dir.join("vmlinuz"),
        initramfs,
        kernel_version,
    })
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct ImageJson {
    #[serde(default)]
    extra_kargs: Vec<String>,
}

/// Kernel arguments baked into the image build. Missing file means none.
pub fn baked_kernel_args(root: &Path) -> Result<Vec<String>> {
    let path = root.join(IMAGE_JSON);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let text = fs::read_to_string(&path).with_context(|| format!("reading '{}'", path.display()))?;
    let image: ImageJson =
        serde_json::from_str(&text).with_context(|| format!("parsing '{}'", path.display()))?;
    Ok(image.extra_kargs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::write_stub;
    use tempfile::TempDir;

    #[test]
    fn test_find_kernel() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("usr/lib/modules/6.11.4-301.fc41.x86_64");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("vmlinuz"), b"k").unwrap();
        fs::write(dir.join("initramfs.img"), b"i").unwrap();

        let boot = find_kernel(temp.path()).unwrap();
        assert_eq!(boot.kernel_version, "6.11.4-301.fc41.x86_64");
        assert_eq!(boot.kernel, dir.join("vmlinuz"));
    }

    #[test]
    fn test_find_kernel_rejects_multiple() {
        let temp = TempDir::new().unwrap();
        for v in ["6.10.0", "6.11.0"] {
            let dir = temp.path().join(MODULES_DIR).join(v);
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join("vmlinuz"), b"k").unwrap();
            fs::write(dir.join("initramfs.img"), b"i").unwrap();
        }
        let err = find_kernel(temp.path()).unwrap_err();
        assert!(err.to_string().contains("6.10.0, 6.11.0"));
    }

    #[test]
    fn test_baked_kernel_args() {
        let temp = TempDir::new().unwrap();
        assert!(baked_kernel_args(temp.path()).unwrap().is_empty());

        let path = temp.path().join(IMAGE_JSON);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(
            &path,
            r#"{"extra-kargs": ["mitigations=auto,nosmt"], "rootfs": "xfs"}"#,
        )
        .unwrap();
        assert_eq!(
            baked_kernel_args(temp.path()).unwrap(),
            ["mitigations=auto,nosmt"]
        );
    }

    #[test]
    fn test_checkout_arguments() {
        let temp = TempDir::new().unwrap();
        let repo = temp.path().join("repo");
        fs::create_dir_all(&repo).unwrap();
        let log = temp.path().join("args");
        let ostree = write_stub(temp.path(), "ostree", &format!("echo \"$@\" > {}\n", log.display()));

        let store = CommitStore::new(ostree.to_str().unwrap(), &repo);
        let dest = temp.path().join("rootfs");
        store.checkout("abc123", &dest).unwrap();

        let args = fs::read_to_string(&log).unwrap();
        assert_eq!(
            args.trim(),
            format!(
                "checkout --repo={} --user-mode abc123 {}",
                repo.display(),
                dest.display()
            )
        );
    }

    #[test]
    fn test_checkout_missing_repo() {
        let temp = TempDir::new().unwrap();
        let store = CommitStore::new("ostree", &temp.path().join("missing"));
        let err = store.checkout("abc", &temp.path().join("out")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BuildError>(),
            Some(BuildError::Precondition(_))
        ));
    }
}
