//! Transport errors raised by remote sessions.

use camino::Utf8PathBuf;
use thiserror::Error;

/// Errors surfaced while opening, using, or closing a remote session.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SessionError {
    /// Raised when a local helper process cannot be started.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Command that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when the connection cannot be established or authenticated.
    #[error("failed to connect to {host}: {message}")]
    Connect {
        /// Target host.
        host: String,
        /// Client error output.
        message: String,
    },
    /// Raised when the transport fails while running a command.
    #[error("command execution on {host} failed: {message}")]
    Execution {
        /// Target host.
        host: String,
        /// Client error output.
        message: String,
    },
    /// Raised when a file upload fails.
    #[error("failed to upload {remote_path} to {host}: {message}")]
    Transfer {
        /// Target host.
        host: String,
        /// Destination path on the remote host.
        remote_path: String,
        /// Client error output.
        message: String,
    },
    /// Raised when a command exceeds the configured timeout.
    #[error("command on {host} timed out after {secs}s")]
    Timeout {
        /// Target host.
        host: String,
        /// Timeout that elapsed.
        secs: u64,
    },
    /// Raised when the client terminated without an exit status.
    #[error("command on {host} terminated without an exit status")]
    MissingExitCode {
        /// Target host.
        host: String,
    },
    /// Raised when a local staging file or directory cannot be written.
    #[error("failed to stage {path}: {message}")]
    Stage {
        /// Local path that failed.
        path: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
}
