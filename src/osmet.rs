//! Packed-metadata ("osmet") generation.
//!
//! `coreos-installer pack osmet` records how to reconstruct the metal disk
//! image from the live root filesystem. It either runs on the host against
//! the raw image file, or inside the supermin sandbox VM where the image is
//! attached as a read-only virtio disk with serial `osmet`.

use anyhow::Result;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::config::{OsmetConfig, OsmetMode, Tools};
use crate::process::Cmd;

/// Virtio serial of the disk handed to the sandbox.
pub const OSMET_DISK_SERIAL: &str = "osmet";

/// Builder for a command wrapped in the sandbox VM runner.
#[derive(Debug, Clone, Default)]
pub struct SandboxVm {
    runner: String,
    memory_mb: Option<u32>,
    drives: Vec<(String, PathBuf)>,
}

impl SandboxVm {
    pub fn new(runner: &str) -> Self {
        Self {
            runner: runner.to_string(),
            ..Default::default()
        }
    }

    pub fn memory_mb(mut self, memory_mb: Option<u32>) -> Self {
        self.memory_mb = memory_mb;
        self
    }

    /// Attach `path` read-only as a virtio disk with serial `id`.
    pub fn readonly_disk(mut self, id: &str, path: &Path) -> Self {
        self.drives.push((id.to_string(), path.to_path_buf()));
        self
    }

    /// Device node of a disk attached with [`readonly_disk`](Self::readonly_disk).
    pub fn disk_path(id: &str) -> String {
        format!("/dev/disk/by-id/virtio-{id}")
    }

    /// The runner command executing `inner` inside the VM.
    pub fn build(self, inner: &Cmd) -> Cmd {
        let mut cmd = Cmd::new(&self.runner);
        if let Some(mb) = self.memory_mb {
            cmd = cmd.args(["-m", &mb.to_string()]);
        }
        for (id, path) in &self.drives {
            cmd = cmd.args([
                "-drive",
                &format!(
                    "if=none,id={id},format=raw,readonly=on,file={}",
                    path.display()
                ),
                "-device",
                &format!("virtio-blk,serial={id},drive={id}"),
            ]);
        }
        cmd.arg("--").arg(inner.program()).args(inner.get_args())
    }
}

/// What to pack.
#[derive(Debug, Clone)]
pub struct OsmetRequest<'a> {
    pub metal_image: &'a Path,
    pub description: &'a str,
    /// sha256 of the metal image, checked at install time.
    pub checksum: &'a str,
    pub output: &'a Path,
}

fn pack_cmd(tool: &str, disk: &str, req: &OsmetRequest<'_>, helper: Option<&Path>) -> Cmd {
    let mut cmd = Cmd::new(tool)
        .args(["pack", "osmet", disk])
        .args(["--description", req.description])
        .args(["--checksum", req.checksum])
        .arg("--output")
        .arg_path(req.output);
    if let Some(helper) = helper {
        cmd = cmd.arg("--coreinst").arg_path(helper);
    }
    cmd.error_msg("osmet packing failed")
}

/// The producer command for the configured mode; `None` when disabled.
pub fn osmet_command(config: &OsmetConfig, tools: &Tools, req: &OsmetRequest<'_>) -> Option<Cmd> {
    let helper = config.helper.as_deref();
    match config.mode {
        OsmetMode::Disabled => None,
        OsmetMode::Direct => {
            let disk = req.metal_image.display().to_string();
            Some(pack_cmd(&tools.coreos_installer, &disk, req, helper))
        }
        OsmetMode::Vm => {
            let disk = SandboxVm::disk_path(OSMET_DISK_SERIAL);
            let inner = pack_cmd(&tools.coreos_installer, &disk, req, helper);
            Some(
                SandboxVm::new(&tools.vm_runner)
                    .memory_mb(config.vm_memory_mb)
                    .readonly_disk(OSMET_DISK_SERIAL, req.metal_image)
                    .build(&inner)
                    .error_msg("osmet packing in the sandbox VM failed"),
            )
        }
    }
}

/// Produce the packed-metadata blob. Returns its path, or `None` when
/// generation is disabled.
pub fn generate_osmet(
    config: &OsmetConfig,
    tools: &Tools,
    req: &OsmetRequest<'_>,
) -> Result<Option<PathBuf>> {
    let Some(cmd) = osmet_command(config, tools, req) else {
        info!("osmet generation disabled");
        return Ok(None);
    };
    info!(mode = ?config.mode, image = %req.metal_image.display(), "packing osmet");
    cmd.run()?;
    Ok(Some(req.output.to_path_buf()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> OsmetRequest<'static> {
        OsmetRequest {
            metal_image: Path::new("/builds/x/metal.raw"),
            description: "fedora-coreos 41.1",
            checksum: "abc",
            output: Path::new("/tmp/out.osmet"),
        }
    }

    #[test]
    fn test_direct_command() {
        let config = OsmetConfig {
            helper: Some(PathBuf::from("/usr/bin/coreos-installer")),
            ..Default::default()
        };
        let req = request();
        let cmd = osmet_command(&config, &Tools::default(), &req).unwrap();
        assert_eq!(
            cmd.display(),
            "coreos-installer pack osmet /builds/x/metal.raw --description fedora-coreos 41.1 \
             --checksum abc --output /tmp/out.osmet --coreinst /usr/bin/coreos-installer"
        );
    }

    #[test]
    fn test_vm_command() {
        let config = OsmetConfig {
            mode: OsmetMode::Vm,
            vm_memory_mb: Some(4096),
            ..Default::default()
        };
        let req = request();
        let cmd = osmet_command(&config, &Tools::default(), &req).unwrap();
        assert_eq!(
            cmd.display(),
            "runvm -m 4096 \
             -drive if=none,id=osmet,format=raw,readonly=on,file=/builds/x/metal.raw \
             -device virtio-blk,serial=osmet,drive=osmet \
             -- coreos-installer pack osmet /dev/disk/by-id/virtio-osmet \
             --description fedora-coreos 41.1 --checksum abc --output /tmp/out.osmet"
        );
    }

    #[test]
    fn test_disabled_runs_nothing() {
        let config = OsmetConfig {
            mode: OsmetMode::Disabled,
            ..Default::default()
        };
        let req = request();
        assert!(osmet_command(&config, &Tools::default(), &req).is_none());
        assert_eq!(generate_osmet(&config, &Tools::default(), &req).unwrap(), None);
    }
}
