//! Command execution.
//!
//! Every external tool the pipeline touches (git, make, the probe commands of
//! patches) is described as a [`Cmd`] and handed to a [`Shell`]. The pipeline
//! never spawns processes directly, which keeps the orchestration testable with
//! a scripted shell.
//!
//! A non-zero exit status is not an error at this layer: [`Shell::exec`] returns
//! it as data and the caller decides what it means. [`Shell::run`] is the
//! convenience for callers that treat any failure as fatal.

use anyhow::{bail, Context, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// Number of trailing stderr lines kept in error messages.
const STDERR_TAIL_LINES: usize = 20;

/// A command to run in an explicit working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cmd {
    program: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    error_msg: Option<String>,
    interactive: bool,
}

impl Cmd {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            error_msg: None,
            interactive: false,
        }
    }

    /// A `sh -c <script>` invocation, used for probe pipelines.
    pub fn sh(script: impl Into<String>) -> Self {
        Self::new("sh").arg("-c").arg(script)
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Message prefixed to the error when [`Shell::run`] sees a failure.
    pub fn error_msg(mut self, msg: impl Into<String>) -> Self {
        self.error_msg = Some(msg.into());
        self
    }

    /// Inherit stdio instead of capturing it (long builds the operator watches).
    pub fn interactive(mut self) -> Self {
        self.interactive = true;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    pub fn working_dir(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    pub fn is_interactive(&self) -> bool {
        self.interactive
    }

    /// True when `needle` is one of the arguments.
    pub fn has_arg(&self, needle: &str) -> bool {
        self.args.iter().any(|a| a == needle)
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            if arg.contains(char::is_whitespace) {
                write!(f, " '{}'", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

/// Exit status and captured output of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CmdOutput {
    /// Exit code, `None` when the process was killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CmdOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    fn status_display(&self) -> String {
        match self.code {
            Some(code) => format!("exit code {}", code),
            None => "a signal".to_string(),
        }
    }
}

/// Capability to run commands.
pub trait Shell {
    /// Run `cmd` to completion. Errors only when the process cannot be spawned.
    fn exec(&self, cmd: &Cmd) -> Result<CmdOutput>;

    /// Run `cmd` and turn a non-zero exit into an error.
    fn run(&self, cmd: &Cmd) -> Result<CmdOutput> {
        let output = self.exec(cmd)?;
        if output.success() {
            return Ok(output);
        }

        let prefix = cmd
            .error_msg
            .clone()
            .unwrap_or_else(|| format!("`{}` failed", cmd.program));
        let tail = stderr_tail(&output.stderr);
        if tail.is_empty() {
            bail!("{} (`{}` terminated by {})", prefix, cmd, output.status_display());
        }
        bail!(
            "{} (`{}` terminated by {}):\n{}",
            prefix,
            cmd,
            output.status_display(),
            tail
        )
    }
}

impl<S: Shell + ?Sized> Shell for &S {
    fn exec(&self, cmd: &Cmd) -> Result<CmdOutput> {
        (**self).exec(cmd)
    }
}

/// Runs commands on the host with `std::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostShell;

impl Shell for HostShell {
    fn exec(&self, cmd: &Cmd) -> Result<CmdOutput> {
        tracing::debug!(command = %cmd, cwd = ?cmd.cwd, "exec");

        let mut command = Command::new(&cmd.program);
        command.args(&cmd.args);
        if let Some(dir) = &cmd.cwd {
            command.current_dir(dir);
        }

        if cmd.interactive {
            let status = command
                .stdin(Stdio::null())
                .status()
                .with_context(|| format!("spawning `{}`", cmd))?;
            return Ok(CmdOutput {
                code: status.code(),
                ..CmdOutput::default()
            });
        }

        let output = command
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("spawning `{}`", cmd))?;
        Ok(CmdOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

fn stderr_tail(stderr: &str) -> String {
    let lines: Vec<&str> = stderr.trim().lines().collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_quotes_arguments_with_spaces() {
        let cmd = Cmd::new("git").args(["commit", "-m", "two words"]);
        assert_eq!(cmd.to_string(), "git commit -m 'two words'");
    }

    #[test]
    fn host_shell_reports_exit_status_as_data() {
        let out = HostShell.exec(&Cmd::sh("echo hi; exit 3")).unwrap();
        assert_eq!(out.code, Some(3));
        assert_eq!(out.stdout.trim(), "hi");
        assert!(!out.success());
    }

    #[test]
    fn host_shell_runs_in_working_directory() {
        let temp = tempfile::tempdir().unwrap();
        let out = HostShell
            .run(&Cmd::new("pwd").current_dir(temp.path()))
            .unwrap();
        let reported = std::fs::canonicalize(out.stdout.trim()).unwrap();
        assert_eq!(reported, std::fs::canonicalize(temp.path()).unwrap());
    }

    #[test]
    fn run_attaches_error_message_and_stderr_tail() {
        let err = HostShell
            .run(&Cmd::sh("echo broken >&2; exit 1").error_msg("probe failed"))
            .unwrap_err()
            .to_string();
        assert!(err.starts_with("probe failed"));
        assert!(err.contains("exit code 1"));
        assert!(err.contains("broken"));
    }

    #[test]
    fn spawn_failure_is_an_error() {
        let result = HostShell.exec(&Cmd::new("definitely_not_a_real_command_12345"));
        assert!(result.is_err());
    }
}
