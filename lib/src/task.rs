//! Execution of external programs, either streamed to the terminal or
//! with output captured for the caller to inspect.

use std::ffi::OsStr;
use std::process::{Command, Stdio};

use anyhow::{Context, Result};

/// Captured result of a child process. The output is not interpreted;
/// callers decide what a failure means.
#[derive(Debug)]
pub(crate) struct CommandOutput {
    pub(crate) success: bool,
    pub(crate) stdout: String,
    pub(crate) stderr: String,
}

pub(crate) struct Task {
    description: String,
    quiet: bool,
    pub(crate) cmd: Command,
}

impl Task {
    pub(crate) fn new(description: impl AsRef<str>, exe: impl AsRef<str>) -> Self {
        let mut cmd = Command::new(exe.as_ref());
        // Default to noninteractive
        cmd.stdin(Stdio::null());
        Self {
            description: description.as_ref().to_string(),
            quiet: false,
            cmd,
        }
    }

    pub(crate) fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }

    pub(crate) fn args<S: AsRef<OsStr>>(mut self, args: impl IntoIterator<Item = S>) -> Self {
        self.cmd.args(args);
        self
    }

    /// Run the command with the child streams inherited, returning an
    /// error if the command does not exit successfully.
    pub(crate) fn run(self) -> Result<()> {
        let description = self.description;
        let mut cmd = self.cmd;
        if !self.quiet {
            println!("{description}");
        }
        tracing::debug!("exec: {cmd:?}");
        let st = cmd
            .status()
            .with_context(|| format!("Spawning {description} failed"))?;
        if !st.success() {
            anyhow::bail!("Task {description} failed: {st:?}");
        }
        Ok(())
    }

    /// Run the command capturing stdout, stderr and the exit status.
    pub(crate) fn output(self) -> Result<CommandOutput> {
        let description = self.description;
        let mut cmd = self.cmd;
        if !self.quiet {
            println!("{description}");
        }
        tracing::debug!("exec: {cmd:?}");
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        let o = cmd
            .output()
            .with_context(|| format!("Spawning {description} failed"))?;
        Ok(CommandOutput {
            success: o.status.success(),
            stdout: String::from_utf8_lossy(&o.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&o.stderr).into_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_captures_streams() -> Result<()> {
        let o = Task::new("test echo", "/bin/sh")
            .args(["-c", "echo out; echo err >&2; exit 3"])
            .quiet()
            .output()?;
        assert!(!o.success);
        assert_eq!(o.stdout, "out\n");
        assert_eq!(o.stderr, "err\n");
        Ok(())
    }

    #[test]
    fn test_run_failure() {
        let r = Task::new("test false", "/bin/sh")
            .args(["-c", "exit 1"])
            .quiet()
            .run();
        assert!(r.is_err());
    }
}
