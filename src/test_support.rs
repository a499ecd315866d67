//! Test support utilities shared across unit and integration tests.

use std::collections::{BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard};

use crate::config::{
    DEFAULT_CONTAINER_RUNTIME_COMMAND, DEFAULT_HELM_INSTALL_TEMPLATE,
    DEFAULT_PLAYBOOK_COMMAND_TEMPLATE, DEFAULT_PLAYBOOK_DIR, HoistConfig,
};
use crate::model::{Credential, HostConnection, MembershipType, NodeRole, NodeSpec};
use crate::session::{
    CommandOutput, CommandRunner, Connector, ExecOutput, RemoteSession, SessionError,
};

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic process outcomes without spawning anything.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Arc<Mutex<VecDeque<CommandOutput>>>,
    invocations: Arc<Mutex<Vec<CommandInvocation>>>,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
    /// Extra environment passed to the program.
    pub env: Vec<(String, String)>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        self.invocations.lock().clone()
    }

    /// Pushes a successful exit status.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32) {
        self.push_output(Some(code), "", "simulated failure");
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        self.responses.lock().push_back(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        });
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(
        &self,
        program: &str,
        args: &[OsString],
        env: &[(String, String)],
    ) -> Result<CommandOutput, SessionError> {
        self.invocations.lock().push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
            env: env.to_vec(),
        });
        self.responses
            .lock()
            .pop_front()
            .ok_or_else(|| SessionError::Spawn {
                program: program.to_owned(),
                message: String::from("no scripted response available"),
            })
    }
}

/// An upload recorded by a [`ScriptedSession`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RecordedUpload {
    /// Host the file was sent to.
    pub host: String,
    /// Destination path.
    pub remote_path: String,
    /// File contents.
    pub content: String,
}

#[derive(Debug, Default)]
struct RemoteScript {
    unreachable: BTreeSet<String>,
    failing_uploads: BTreeSet<String>,
    responses: VecDeque<Result<ExecOutput, SessionError>>,
    connects: Vec<String>,
    commands: Vec<(String, String)>,
    uploads: Vec<RecordedUpload>,
    disconnects: usize,
}

/// Connector double whose sessions replay scripted command results.
///
/// Commands consume queued responses in FIFO order; once the queue is empty
/// every command succeeds with empty output. All activity is recorded so
/// tests can assert on side effects.
#[derive(Clone, Debug, Default)]
pub struct ScriptedConnector {
    script: Arc<Mutex<RemoteScript>>,
}

impl ScriptedConnector {
    /// Creates a connector with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every connection to `host` fail.
    pub fn refuse_host(&self, host: &str) {
        self.script.lock().unreachable.insert(host.to_owned());
    }

    /// Makes uploads to `remote_path` fail.
    pub fn fail_upload(&self, remote_path: &str) {
        self.script
            .lock()
            .failing_uploads
            .insert(remote_path.to_owned());
    }

    /// Queues the result of the next command.
    pub fn push_exec(&self, exit_code: i32, stdout: &str, stderr: &str) {
        self.script.lock().responses.push_back(Ok(ExecOutput {
            exit_code,
            stdout: stdout.to_owned(),
            stderr: stderr.to_owned(),
        }));
    }

    /// Queues a transport error for the next command.
    pub fn push_exec_error(&self, error: SessionError) {
        self.script.lock().responses.push_back(Err(error));
    }

    /// Hosts connected to, in order.
    #[must_use]
    pub fn connects(&self) -> Vec<String> {
        self.script.lock().connects.clone()
    }

    /// Commands executed, as `(host, command)` pairs.
    #[must_use]
    pub fn commands(&self) -> Vec<(String, String)> {
        self.script.lock().commands.clone()
    }

    /// Uploads performed.
    #[must_use]
    pub fn uploads(&self) -> Vec<RecordedUpload> {
        self.script.lock().uploads.clone()
    }

    /// Number of sessions disconnected.
    #[must_use]
    pub fn disconnects(&self) -> usize {
        self.script.lock().disconnects
    }

    /// Returns `true` when no remote activity was recorded.
    #[must_use]
    pub fn is_untouched(&self) -> bool {
        let script = self.script.lock();
        script.connects.is_empty() && script.commands.is_empty() && script.uploads.is_empty()
    }
}

impl Connector for ScriptedConnector {
    type Session = ScriptedSession;

    fn connect(&self, target: &HostConnection) -> Result<Self::Session, SessionError> {
        let mut script = self.script.lock();
        script.connects.push(target.host.clone());
        if script.unreachable.contains(&target.host) {
            return Err(SessionError::Connect {
                host: target.host.clone(),
                message: String::from("connection refused"),
            });
        }
        Ok(ScriptedSession {
            host: target.host.clone(),
            script: Arc::clone(&self.script),
            open: true,
        })
    }
}

/// Session produced by [`ScriptedConnector`].
#[derive(Debug)]
pub struct ScriptedSession {
    host: String,
    script: Arc<Mutex<RemoteScript>>,
    open: bool,
}

impl RemoteSession for ScriptedSession {
    fn host(&self) -> &str {
        &self.host
    }

    fn execute(&self, command: &str) -> Result<ExecOutput, SessionError> {
        let mut script = self.script.lock();
        script
            .commands
            .push((self.host.clone(), command.to_owned()));
        script.responses.pop_front().unwrap_or_else(|| {
            Ok(ExecOutput {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
            })
        })
    }

    fn upload(&self, content: &str, remote_path: &str) -> Result<(), SessionError> {
        let mut script = self.script.lock();
        if script.failing_uploads.contains(remote_path) {
            return Err(SessionError::Transfer {
                host: self.host.clone(),
                remote_path: remote_path.to_owned(),
                message: String::from("permission denied"),
            });
        }
        script.uploads.push(RecordedUpload {
            host: self.host.clone(),
            remote_path: remote_path.to_owned(),
            content: content.to_owned(),
        });
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), SessionError> {
        if self.open {
            self.open = false;
            self.script.lock().disconnects += 1;
        }
        Ok(())
    }
}

/// Inner node with password credentials on port 22.
#[must_use]
pub fn node_spec(name: &str, role: NodeRole, host: &str) -> NodeSpec {
    NodeSpec {
        name: name.to_owned(),
        role,
        host: host.to_owned(),
        port: 22,
        credential: password_credential(),
        membership: MembershipType::Inner,
    }
}

/// Outer control host with password credentials on port 22.
#[must_use]
pub fn outer_node_spec(name: &str, host: &str) -> NodeSpec {
    NodeSpec {
        membership: MembershipType::Outer,
        ..node_spec(name, NodeRole::Worker, host)
    }
}

/// Password connection to `host` on port 22.
#[must_use]
pub fn password_target(host: &str) -> HostConnection {
    HostConnection {
        host: host.to_owned(),
        port: 22,
        credential: password_credential(),
    }
}

fn password_credential() -> Credential {
    Credential::Password {
        username: String::from("root"),
        password: String::from("secret"),
    }
}

/// Configuration with default values and the given staging directory.
#[must_use]
pub fn test_config(staging_dir: &str) -> HoistConfig {
    HoistConfig {
        ssh_bin: String::from("ssh"),
        scp_bin: String::from("scp"),
        sshpass_bin: String::from("sshpass"),
        ssh_batch_mode: false,
        ssh_strict_host_key_checking: false,
        ssh_known_hosts_file: String::from("/dev/null"),
        connect_timeout_secs: 10,
        command_timeout_secs: 0,
        staging_dir: staging_dir.to_owned(),
        remote_config_dir: String::from("/tmp"),
        install_log_path: String::from("/tmp/install.log"),
        nohup_log_path: String::from("/tmp/nohup-install"),
        exit_code_dir: String::from("/tmp"),
        playbook_dir: DEFAULT_PLAYBOOK_DIR.to_owned(),
        playbook_command_template: DEFAULT_PLAYBOOK_COMMAND_TEMPLATE.to_owned(),
        container_runtime_command: DEFAULT_CONTAINER_RUNTIME_COMMAND.to_owned(),
        lock_ttl_secs: 600,
        sweep_lock_ttl_secs: 180,
        sweep_interval_secs: 30,
        helm_download_url: Some(String::from(
            "https://get.helm.sh/helm-v3.14.0-linux-amd64.tar.gz",
        )),
        helm_install_template: DEFAULT_HELM_INSTALL_TEMPLATE.to_owned(),
        agent_install_template: Some(String::from(
            "helm install agent-{{cluster-code}} --set clusterId={{cluster-id}}",
        )),
        inventory_template_path: None,
        wrapper_template_path: None,
        kv_dir: format!("{staging_dir}/kv"),
        state_file: format!("{staging_dir}/state.json"),
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Guard that holds the env mutex and restores variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
