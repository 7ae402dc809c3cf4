//! External program invocation.
//!
//! [`Cmd`] wraps a single blocking tool call. [`Pipeline`] chains several
//! commands stdout → stdin, the way `find | cpio | gzip` would in a shell,
//! and fails if any stage fails.

use anyhow::{Context, Result};
use std::ffi::{OsStr, OsString};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use tracing::debug;

use crate::error::BuildError;

/// Captured result of a finished command.
#[derive(Debug)]
pub struct CmdResult {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CmdResult {
    pub fn success(&self) -> bool {
        self.status.success()
    }
}

/// Builder for one external command.
#[derive(Debug, Clone)]
pub struct Cmd {
    program: OsString,
    args: Vec<OsString>,
    dir: Option<PathBuf>,
    envs: Vec<(OsString, OsString)>,
    error_msg: Option<String>,
    allow_fail: bool,
}

impl Cmd {
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Self {
            program: program.as_ref().to_os_string(),
            args: Vec::new(),
            dir: None,
            envs: Vec::new(),
            error_msg: None,
            allow_fail: false,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn arg_path(self, path: &Path) -> Self {
        self.arg(path.as_os_str())
    }

    /// Working directory for the child.
    pub fn dir(mut self, dir: &Path) -> Self {
        self.dir = Some(dir.to_path_buf());
        self
    }

    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.envs
            .push((key.as_ref().to_os_string(), value.as_ref().to_os_string()));
        self
    }

    /// Hint appended to the failure message (e.g. which package to install).
    pub fn error_msg(mut self, msg: impl Into<String>) -> Self {
        self.error_msg = Some(msg.into());
        self
    }

    /// Return the result even when the exit status is non-zero.
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    pub fn program(&self) -> &OsStr {
        &self.program
    }

    pub fn get_args(&self) -> &[OsString] {
        &self.args
    }

    /// Shell-like rendering, used in logs and error messages.
    pub fn display(&self) -> String {
        std::iter::once(&self.program)
            .chain(self.args.iter())
            .map(|s| s.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(dir) = &self.dir {
            cmd.current_dir(dir);
        }
        for (k, v) in &self.envs {
            cmd.env(k, v);
        }
        cmd
    }

    /// Run to completion, capturing stdout and stderr.
    pub fn run(&self) -> Result<CmdResult> {
        debug!(command = %self.display(), "running");
        let output = self
            .to_command()
            .stdin(Stdio::null())
            .output()
            .map_err(|e| self.failure(format!("spawn error: {e}"), String::new()))?;

        let result = CmdResult {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if !result.success() && !self.allow_fail {
            return Err(self
                .failure(result.status.to_string(), result.stderr.trim().to_string())
                .into());
        }
        Ok(result)
    }

    fn failure(&self, status: String, stderr: String) -> BuildError {
        let detail = match (&self.error_msg, stderr.is_empty()) {
            (Some(msg), true) => msg.clone(),
            (Some(msg), false) => format!("{stderr}\n{msg}"),
            (None, _) => stderr,
        };
        BuildError::ToolFailed {
            command: self.display(),
            status,
            detail,
        }
    }
}

/// Commands connected by pipes, each stage's stdout feeding the next one's
/// stdin. All stages run concurrently; the pipeline succeeds only if every
/// stage exits zero.
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    stages: Vec<Cmd>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(mut self, cmd: Cmd) -> Self {
        self.stages.push(cmd);
        self
    }

    pub fn stages(&self) -> &[Cmd] {
        &self.stages
    }

    pub fn display(&self) -> String {
        self.stages
            .iter()
            .map(Cmd::display)
            .collect::<Vec<_>>()
            .join(" | ")
    }

    /// Run the pipeline with the last stage writing into `sink`.
    ///
    /// The sink's file offset is shared with the last child, so a handle
    /// positioned at its end receives the output appended.
    pub fn run_into(&self, sink: &File) -> Result<()> {
        anyhow::ensure!(!self.stages.is_empty(), "empty pipeline");
        debug!(pipeline = %self.display(), "running");

        let mut children: Vec<(usize, Child)> = Vec::with_capacity(self.stages.len());
        let mut upstream: Option<Stdio> = None;
        let last = self.stages.len() - 1;

        for (idx, stage) in self.stages.iter().enumerate() {
            let stdout = if idx == last {
                Stdio::from(sink.try_clone().context("duplicating pipeline sink")?)
            } else {
                Stdio::piped()
            };
            let mut command = stage.to_command();
            command
                .stdin(upstream.take().unwrap_or_else(Stdio::null))
                .stdout(stdout)
                .stderr(Stdio::inherit());

            let mut child = match command.spawn() {
                Ok(child) => child,
                Err(e) => {
                    reap(children);
                    return Err(stage.failure(format!("spawn error: {e}"), String::new()).into());
                }
            };
            if idx != last {
                let out = child
                    .stdout
                    .take()
                    .context("pipeline stage stdout was not captured")?;
                upstream = Some(Stdio::from(out));
            }
            children.push((idx, child));
        }

        let mut first_failure: Option<BuildError> = None;
        for (idx, mut child) in children {
            let status = child
                .wait()
                .with_context(|| format!("waiting for `{}`", self.stages[idx].display()))?;
            if !status.success() && first_failure.is_none() {
                first_failure = Some(self.stages[idx].failure(
                    status.to_string(),
                    format!("stage {} of `{}`", idx + 1, self.display()),
                ));
            }
        }

        match first_failure {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }
}

fn reap(children: Vec<(usize, Child)>) {
    for (_, mut child) in children {
        let _ = child.kill();
        let _ = child.wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, SeekFrom, Write};

    #[test]
    fn test_cmd_captures_stdout() {
        let result = Cmd::new("echo").arg("hello").run().unwrap();
        assert!(result.success());
        assert_eq!(result.stdout.trim(), "hello");
    }

    #[test]
    fn test_cmd_failure_is_tool_failed() {
        let err = Cmd::new("false").error_msg("expected").run().unwrap_err();
        match err.downcast_ref::<BuildError>() {
            Some(BuildError::ToolFailed { command, detail, .. }) => {
                assert_eq!(command, "false");
                assert_eq!(detail, "expected");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_cmd_allow_fail() {
        let result = Cmd::new("false").allow_fail().run().unwrap();
        assert!(!result.success());
    }

    #[test]
    fn test_cmd_missing_program() {
        let err = Cmd::new("definitely_not_a_real_command_12345")
            .run()
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BuildError>(),
            Some(BuildError::ToolFailed { .. })
        ));
    }

    #[test]
    fn test_pipeline_chains_stages() {
        let mut sink = tempfile::tempfile().unwrap();
        Pipeline::new()
            .stage(Cmd::new("printf").arg("b\\na\\n"))
            .stage(Cmd::new("sort").env("LC_ALL", "C"))
            .run_into(&sink)
            .unwrap();

        sink.seek(SeekFrom::Start(0)).unwrap();
        let mut out = String::new();
        sink.read_to_string(&mut out).unwrap();
        assert_eq!(out, "a\nb\n");
    }

    #[test]
    fn test_pipeline_appends_at_sink_offset() {
        let mut sink = tempfile::tempfile().unwrap();
        sink.write_all(b"head:").unwrap();
        Pipeline::new()
            .stage(Cmd::new("printf").arg("tail"))
            .run_into(&sink)
            .unwrap();

        sink.seek(SeekFrom::Start(0)).unwrap();
        let mut out = String::new();
        sink.read_to_string(&mut out).unwrap();
        assert_eq!(out, "head:tail");
    }

    #[test]
    fn test_pipeline_middle_stage_failure() {
        let sink = tempfile::tempfile().unwrap();
        let err = Pipeline::new()
            .stage(Cmd::new("printf").arg("data"))
            .stage(Cmd::new("sh").args(["-c", "cat >/dev/null; exit 3"]))
            .stage(Cmd::new("cat"))
            .run_into(&sink)
            .unwrap_err();
        match err.downcast_ref::<BuildError>() {
            Some(BuildError::ToolFailed { command, .. }) => assert!(command.starts_with("sh -c")),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
