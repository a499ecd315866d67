//! Session contracts and the process runner seam.

use std::ffi::OsString;
use std::process::Command;

use crate::model::HostConnection;

use super::SessionError;

/// Result of running a local process.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }
}

/// Abstraction over process execution to support fakes in tests.
pub trait CommandRunner: Send + Sync {
    /// Runs `program` with `args` and extra environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Spawn`] if the command cannot be started.
    fn run(
        &self,
        program: &str,
        args: &[OsString],
        env: &[(String, String)],
    ) -> Result<CommandOutput, SessionError>;
}

/// Real command runner that shells out to the host operating system.
#[derive(Clone, Debug, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn run(
        &self,
        program: &str,
        args: &[OsString],
        env: &[(String, String)],
    ) -> Result<CommandOutput, SessionError> {
        let output = Command::new(program)
            .args(args)
            .envs(env.iter().map(|(key, value)| (key.as_str(), value.as_str())))
            .output()
            .map_err(|err| SessionError::Spawn {
                program: program.to_owned(),
                message: err.to_string(),
            })?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Output of a remote command. A non-zero exit is a normal result.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExecOutput {
    /// Remote exit status.
    pub exit_code: i32,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl ExecOutput {
    /// Returns `true` when the remote command exited with zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.exit_code == 0
    }

    /// Joins stdout and stderr with a newline, as recorded on failures.
    #[must_use]
    pub fn combined(&self) -> String {
        format!("{}\n{}", self.stdout, self.stderr)
    }
}

/// An authenticated channel to one host.
pub trait RemoteSession: Send {
    /// Host this session is connected to.
    fn host(&self) -> &str;

    /// Runs `command` through the remote shell.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Execution`] on transport faults and
    /// [`SessionError::Timeout`] when the command exceeds its timeout.
    fn execute(&self, command: &str) -> Result<ExecOutput, SessionError>;

    /// Writes `content` to `remote_path`, overwriting any existing file.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Transfer`] when the copy fails.
    fn upload(&self, content: &str, remote_path: &str) -> Result<(), SessionError>;

    /// Releases the connection. Calling it twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Execution`] when the connection cannot be
    /// torn down cleanly.
    fn disconnect(&mut self) -> Result<(), SessionError>;
}

/// Factory for remote sessions.
pub trait Connector: Send + Sync {
    /// Session type produced by this connector.
    type Session: RemoteSession;

    /// Opens an authenticated session to `target`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Connect`] when the host is unreachable or
    /// rejects the credential.
    fn connect(&self, target: &HostConnection) -> Result<Self::Session, SessionError>;
}
