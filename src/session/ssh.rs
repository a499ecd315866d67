//! Sessions backed by the system OpenSSH client.
//!
//! Each session opens one `ControlMaster` connection and multiplexes every
//! command and upload over its control socket, so authentication happens
//! once per session. Password logins go through `sshpass -e`, which reads the
//! secret from `SSHPASS` rather than argv.

use std::ffi::OsString;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use shell_escape::unix::escape;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::HoistConfig;
use crate::model::{Credential, HostConnection};

use super::{CommandOutput, CommandRunner, Connector, ExecOutput, RemoteSession, SessionError};

/// Exit status reported by `timeout(1)` when the limit elapses.
const TIMEOUT_EXIT: i32 = 124;

/// Exit status reported by `ssh` for transport failures.
const SSH_TRANSPORT_EXIT: i32 = 255;

/// SSH client settings shared by every session of a connector.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SshSettings {
    /// Path to the `ssh` executable.
    pub ssh_bin: String,
    /// Path to the `scp` executable.
    pub scp_bin: String,
    /// Path to the `sshpass` executable.
    pub sshpass_bin: String,
    /// Whether to pass `BatchMode=yes`.
    pub batch_mode: bool,
    /// Whether to enforce host key checking.
    pub strict_host_key_checking: bool,
    /// Known hosts file override.
    pub known_hosts_file: String,
    /// Seconds allowed for connection setup.
    pub connect_timeout_secs: u64,
    /// Seconds allowed per command; `0` disables the limit.
    pub command_timeout_secs: u64,
    /// Local directory for control sockets and staged uploads.
    pub staging_dir: Utf8PathBuf,
}

impl SshSettings {
    /// Extracts the SSH settings from the provisioner configuration.
    #[must_use]
    pub fn from_config(config: &HoistConfig) -> Self {
        Self {
            ssh_bin: config.ssh_bin.clone(),
            scp_bin: config.scp_bin.clone(),
            sshpass_bin: config.sshpass_bin.clone(),
            batch_mode: config.ssh_batch_mode,
            strict_host_key_checking: config.ssh_strict_host_key_checking,
            known_hosts_file: config.ssh_known_hosts_file.clone(),
            connect_timeout_secs: config.connect_timeout_secs,
            command_timeout_secs: config.command_timeout_secs,
            staging_dir: config.staging_path(),
        }
    }
}

/// Connector that drives the system `ssh` and `scp` clients.
#[derive(Clone, Debug)]
pub struct SshConnector<R: CommandRunner + Clone> {
    settings: Arc<SshSettings>,
    runner: R,
}

impl<R: CommandRunner + Clone> SshConnector<R> {
    /// Creates a connector using `runner` to spawn client processes.
    #[must_use]
    pub fn new(settings: SshSettings, runner: R) -> Self {
        Self {
            settings: Arc::new(settings),
            runner,
        }
    }

    /// Returns the client settings.
    #[must_use]
    pub fn settings(&self) -> &SshSettings {
        &self.settings
    }
}

impl<R: CommandRunner + Clone> Connector for SshConnector<R> {
    type Session = SshSession<R>;

    fn connect(&self, target: &HostConnection) -> Result<Self::Session, SessionError> {
        ensure_dir(&self.settings.staging_dir)?;
        let control_path = self
            .settings
            .staging_dir
            .join(format!("ctl-{}", Uuid::new_v4().simple()));
        let mut session = SshSession {
            settings: Arc::clone(&self.settings),
            runner: self.runner.clone(),
            target: target.clone(),
            control_path,
            open: false,
        };
        session.open_master()?;
        session.open = true;
        debug!(host = %target.host, port = target.port, "ssh control master established");
        Ok(session)
    }
}

/// A multiplexed session over one OpenSSH control socket.
#[derive(Debug)]
pub struct SshSession<R: CommandRunner> {
    settings: Arc<SshSettings>,
    runner: R,
    target: HostConnection,
    control_path: Utf8PathBuf,
    open: bool,
}

impl<R: CommandRunner> SshSession<R> {
    /// Path of the control socket backing this session.
    #[must_use]
    pub fn control_path(&self) -> &Utf8Path {
        &self.control_path
    }

    fn destination(&self) -> OsString {
        OsString::from(format!(
            "{}@{}",
            self.target.credential.username(),
            self.target.host
        ))
    }

    fn open_master(&self) -> Result<(), SessionError> {
        let mut ssh_args = vec![
            OsString::from("-M"),
            OsString::from("-S"),
            OsString::from(self.control_path.as_str()),
            OsString::from("-f"),
            OsString::from("-N"),
        ];
        ssh_args.extend(self.connection_options());
        ssh_args.push(self.destination());

        let (program, args, env) = match &self.target.credential {
            Credential::Password { password, .. } => {
                let mut wrapped =
                    vec![OsString::from("-e"), OsString::from(&self.settings.ssh_bin)];
                wrapped.extend(ssh_args);
                (
                    self.settings.sshpass_bin.as_str(),
                    wrapped,
                    vec![(String::from("SSHPASS"), password.clone())],
                )
            }
            Credential::PrivateKey { identity_file, .. } => {
                let mut keyed = vec![OsString::from("-i"), OsString::from(identity_file)];
                keyed.extend(ssh_args);
                (self.settings.ssh_bin.as_str(), keyed, Vec::new())
            }
        };

        let output = self.runner.run(program, &args, &env)?;
        if output.is_success() {
            return Ok(());
        }
        Err(SessionError::Connect {
            host: self.target.host.clone(),
            message: failure_text(&output),
        })
    }

    fn connection_options(&self) -> Vec<OsString> {
        let mut args = vec![
            OsString::from("-p"),
            OsString::from(self.target.port.to_string()),
            OsString::from("-o"),
            OsString::from(format!(
                "ConnectTimeout={}",
                self.settings.connect_timeout_secs
            )),
        ];

        if self.settings.batch_mode {
            args.push(OsString::from("-o"));
            args.push(OsString::from("BatchMode=yes"));
        }

        if !self.settings.strict_host_key_checking {
            args.push(OsString::from("-o"));
            args.push(OsString::from("StrictHostKeyChecking=no"));
        }

        if !self.settings.known_hosts_file.trim().is_empty() {
            args.push(OsString::from("-o"));
            args.push(OsString::from(format!(
                "UserKnownHostsFile={}",
                self.settings.known_hosts_file
            )));
        }

        args
    }

    fn wrap_with_timeout(&self, command: &str) -> String {
        if self.settings.command_timeout_secs == 0 {
            return command.to_owned();
        }
        format!(
            "timeout {} sh -c {}",
            self.settings.command_timeout_secs,
            escape(command.into())
        )
    }

    fn stage_upload(&self, content: &str, remote_path: &str) -> Result<Utf8PathBuf, SessionError> {
        let base = Utf8Path::new(remote_path).file_name().unwrap_or("upload");
        let file_name = format!("{}-{base}", Uuid::new_v4().simple());
        let dir = ensure_dir(&self.settings.staging_dir)?;
        let local = self.settings.staging_dir.join(&file_name);
        dir.write(&file_name, content)
            .map_err(|err| SessionError::Stage {
                path: local.clone(),
                message: err.to_string(),
            })?;
        Ok(local)
    }

    fn discard_staged(&self, local: &Utf8Path) {
        let Some(name) = local.file_name() else {
            return;
        };
        let removed = Dir::open_ambient_dir(&self.settings.staging_dir, ambient_authority())
            .and_then(|dir| dir.remove_file(name));
        if let Err(err) = removed {
            debug!(path = %local, error = %err, "failed to remove staged upload");
        }
    }
}

impl<R: CommandRunner> RemoteSession for SshSession<R> {
    fn host(&self) -> &str {
        &self.target.host
    }

    fn execute(&self, command: &str) -> Result<ExecOutput, SessionError> {
        let args = vec![
            OsString::from("-S"),
            OsString::from(self.control_path.as_str()),
            OsString::from("-p"),
            OsString::from(self.target.port.to_string()),
            self.destination(),
            OsString::from(self.wrap_with_timeout(command)),
        ];
        let output = self.runner.run(&self.settings.ssh_bin, &args, &[])?;
        let host = self.target.host.clone();
        match output.code {
            None => Err(SessionError::MissingExitCode { host }),
            Some(TIMEOUT_EXIT) if self.settings.command_timeout_secs > 0 => {
                Err(SessionError::Timeout {
                    host,
                    secs: self.settings.command_timeout_secs,
                })
            }
            Some(SSH_TRANSPORT_EXIT) => Err(SessionError::Execution {
                host,
                message: failure_text(&output),
            }),
            Some(exit_code) => Ok(ExecOutput {
                exit_code,
                stdout: output.stdout,
                stderr: output.stderr,
            }),
        }
    }

    fn upload(&self, content: &str, remote_path: &str) -> Result<(), SessionError> {
        let local = self.stage_upload(content, remote_path)?;
        let args = vec![
            OsString::from("-q"),
            OsString::from("-o"),
            OsString::from(format!("ControlPath={}", self.control_path)),
            OsString::from("-P"),
            OsString::from(self.target.port.to_string()),
            OsString::from(local.as_str()),
            OsString::from(format!(
                "{}@{}:{remote_path}",
                self.target.credential.username(),
                self.target.host
            )),
        ];
        let result = self.runner.run(&self.settings.scp_bin, &args, &[]);
        self.discard_staged(&local);
        let output = result?;
        if output.is_success() {
            return Ok(());
        }
        Err(SessionError::Transfer {
            host: self.target.host.clone(),
            remote_path: remote_path.to_owned(),
            message: failure_text(&output),
        })
    }

    fn disconnect(&mut self) -> Result<(), SessionError> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        let args = vec![
            OsString::from("-S"),
            OsString::from(self.control_path.as_str()),
            OsString::from("-O"),
            OsString::from("exit"),
            self.destination(),
        ];
        let output = self.runner.run(&self.settings.ssh_bin, &args, &[])?;
        if output.is_success() {
            return Ok(());
        }
        warn!(host = %self.target.host, "control master did not exit cleanly");
        Err(SessionError::Execution {
            host: self.target.host.clone(),
            message: failure_text(&output),
        })
    }
}

fn ensure_dir(path: &Utf8Path) -> Result<Dir, SessionError> {
    let stage_error = |err: std::io::Error| SessionError::Stage {
        path: path.to_path_buf(),
        message: err.to_string(),
    };
    Dir::create_ambient_dir_all(path, ambient_authority()).map_err(stage_error)?;
    Dir::open_ambient_dir(path, ambient_authority()).map_err(stage_error)
}

fn failure_text(output: &CommandOutput) -> String {
    let stderr = output.stderr.trim();
    if stderr.is_empty() {
        output.code.map_or_else(
            || String::from("terminated by signal"),
            |code| format!("exit status {code}"),
        )
    } else {
        stderr.to_owned()
    }
}
