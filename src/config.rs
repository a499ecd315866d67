//! Configuration loading via `ortho-config`.
//!
//! [`HoistConfig`] merges defaults, `hoist.toml`, and `HOIST_*` environment
//! variables. Remote paths default to the locations the provisioning
//! playbooks expect under `/tmp`.

use std::time::Duration;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

/// Default directory holding the playbooks on the control host.
pub const DEFAULT_PLAYBOOK_DIR: &str = "/tmp/kubeadm-ha";

/// Default command used to make sure a container runtime is present.
pub const DEFAULT_CONTAINER_RUNTIME_COMMAND: &str =
    "command -v docker >/dev/null 2>&1 || (curl -fsSL https://get.docker.com | sh)";

/// Default template for running a playbook against the uploaded inventory.
pub const DEFAULT_PLAYBOOK_COMMAND_TEMPLATE: &str =
    "ansible-playbook -i {{inventory}} {{playbook-dir}}/{{playbook}}";

/// Default template for bootstrapping Helm on the control host.
pub const DEFAULT_HELM_INSTALL_TEMPLATE: &str = concat!(
    "curl -fsSL -o /tmp/helm.tar.gz {{url}} && ",
    "tar -zxf /tmp/helm.tar.gz -C /tmp && ",
    "install -m 0755 /tmp/linux-amd64/helm /usr/bin/helm"
);

/// Provisioner settings loaded via `ortho-config`.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "HOIST",
    discovery(
        app_name = "hoist",
        env_var = "HOIST_CONFIG_PATH",
        config_file_name = "hoist.toml",
        dotfile_name = ".hoist.toml",
        project_file_name = "hoist.toml"
    )
)]
pub struct HoistConfig {
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Path to the `scp` executable.
    #[ortho_config(default = "scp".to_owned())]
    pub scp_bin: String,
    /// Path to the `sshpass` executable used for password logins.
    #[ortho_config(default = "sshpass".to_owned())]
    pub sshpass_bin: String,
    /// Whether to force batch mode. Password logins need this disabled.
    #[ortho_config(default = false)]
    pub ssh_batch_mode: bool,
    /// Whether to enforce host key checking.
    #[ortho_config(default = false)]
    pub ssh_strict_host_key_checking: bool,
    /// Known hosts file override.
    #[ortho_config(default = "/dev/null".to_owned())]
    pub ssh_known_hosts_file: String,
    /// Seconds allowed for connection setup.
    #[ortho_config(default = 10)]
    pub connect_timeout_secs: u64,
    /// Seconds allowed per remote command; `0` disables the limit.
    #[ortho_config(default = 0)]
    pub command_timeout_secs: u64,
    /// Local directory for control sockets and staged uploads.
    #[ortho_config(default = "/tmp/hoist".to_owned())]
    pub staging_dir: String,
    /// Remote directory receiving the inventory and wrapper scripts.
    #[ortho_config(default = "/tmp".to_owned())]
    pub remote_config_dir: String,
    /// Remote log written by the wrapper script.
    #[ortho_config(default = "/tmp/install.log".to_owned())]
    pub install_log_path: String,
    /// Remote log capturing `nohup` output.
    #[ortho_config(default = "/tmp/nohup-install".to_owned())]
    pub nohup_log_path: String,
    /// Remote directory holding per-record exit-code markers.
    #[ortho_config(default = "/tmp".to_owned())]
    pub exit_code_dir: String,
    /// Remote directory holding the playbooks.
    #[ortho_config(default = DEFAULT_PLAYBOOK_DIR.to_owned())]
    pub playbook_dir: String,
    /// Command template used for probes and operations.
    #[ortho_config(default = DEFAULT_PLAYBOOK_COMMAND_TEMPLATE.to_owned())]
    pub playbook_command_template: String,
    /// Command ensuring the container runtime is installed.
    #[ortho_config(default = DEFAULT_CONTAINER_RUNTIME_COMMAND.to_owned())]
    pub container_runtime_command: String,
    /// Lifetime of the per-cluster lock, in seconds.
    #[ortho_config(default = 600)]
    pub lock_ttl_secs: u64,
    /// Lifetime of the sweep lock, in seconds.
    #[ortho_config(default = 180)]
    pub sweep_lock_ttl_secs: u64,
    /// Period of the reconcile loop, in seconds.
    #[ortho_config(default = 30)]
    pub sweep_interval_secs: u64,
    /// Helm release archive fetched before installing the agent.
    pub helm_download_url: Option<String>,
    /// Command template used to bootstrap Helm.
    #[ortho_config(default = DEFAULT_HELM_INSTALL_TEMPLATE.to_owned())]
    pub helm_install_template: String,
    /// Command template installing the cluster agent. Supports
    /// `{{cluster-id}}`, `{{cluster-code}}`, and `{{cluster-name}}`.
    pub agent_install_template: Option<String>,
    /// Inventory template override.
    pub inventory_template_path: Option<String>,
    /// Wrapper script template override.
    pub wrapper_template_path: Option<String>,
    /// Directory backing the shared key-value store.
    #[ortho_config(default = "/tmp/hoist/kv".to_owned())]
    pub kv_dir: String,
    /// JSON snapshot of the record store used by the CLI.
    #[ortho_config(default = "hoist-state.json".to_owned())]
    pub state_file: String,
}

/// Errors raised when loading or validating configuration.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Raised when a required value is empty.
    #[error("missing {field}: set HOIST_{env_suffix} or add {field} to hoist.toml", env_suffix = field.to_uppercase())]
    InvalidConfig {
        /// Configuration field that failed validation.
        field: String,
    },
    /// Raised when a numeric value is out of range.
    #[error("invalid {field}: {reason}")]
    InvalidValue {
        /// Configuration field that failed validation.
        field: String,
        /// Why the value was rejected.
        reason: String,
    },
    /// Raised when merging configuration layers fails.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl HoistConfig {
    /// Loads configuration from defaults, files, and environment variables
    /// without parsing CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when merging sources fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("hoist")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Ensures required values are present and numeric values are usable.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidConfig`] for empty values and
    /// [`ConfigError::InvalidValue`] for zero durations.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (value, field) in [
            (&self.ssh_bin, "ssh_bin"),
            (&self.scp_bin, "scp_bin"),
            (&self.sshpass_bin, "sshpass_bin"),
            (&self.staging_dir, "staging_dir"),
            (&self.remote_config_dir, "remote_config_dir"),
            (&self.install_log_path, "install_log_path"),
            (&self.nohup_log_path, "nohup_log_path"),
            (&self.exit_code_dir, "exit_code_dir"),
            (&self.playbook_dir, "playbook_dir"),
            (&self.playbook_command_template, "playbook_command_template"),
            (&self.container_runtime_command, "container_runtime_command"),
            (&self.helm_install_template, "helm_install_template"),
            (&self.kv_dir, "kv_dir"),
            (&self.state_file, "state_file"),
        ] {
            Self::require_value(value, field)?;
        }
        Self::require_optional_value(self.helm_download_url.as_deref(), "helm_download_url")?;
        Self::require_optional_value(
            self.agent_install_template.as_deref(),
            "agent_install_template",
        )?;
        Self::require_optional_value(
            self.inventory_template_path.as_deref(),
            "inventory_template_path",
        )?;
        Self::require_optional_value(
            self.wrapper_template_path.as_deref(),
            "wrapper_template_path",
        )?;
        Self::require_positive(self.connect_timeout_secs, "connect_timeout_secs")?;
        Self::require_positive(self.lock_ttl_secs, "lock_ttl_secs")?;
        Self::require_positive(self.sweep_lock_ttl_secs, "sweep_lock_ttl_secs")?;
        Self::require_positive(self.sweep_interval_secs, "sweep_interval_secs")?;
        Ok(())
    }

    /// Lifetime of the per-cluster lock.
    #[must_use]
    pub const fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    /// Lifetime of the sweep lock.
    #[must_use]
    pub const fn sweep_lock_ttl(&self) -> Duration {
        Duration::from_secs(self.sweep_lock_ttl_secs)
    }

    /// Period of the reconcile loop.
    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Remote path of the uploaded inventory.
    #[must_use]
    pub fn remote_inventory_path(&self) -> String {
        format!("{}/inventory.ini", self.remote_config_dir)
    }

    /// Remote path of an uploaded wrapper script.
    #[must_use]
    pub fn remote_script_path(&self, script: &str) -> String {
        format!("{}/{script}", self.remote_config_dir)
    }

    /// Remote path of the exit-code marker for `record_id`.
    #[must_use]
    pub fn exit_code_path(&self, record_id: u64) -> String {
        format!("{}/{record_id}", self.exit_code_dir)
    }

    /// Local staging directory.
    #[must_use]
    pub fn staging_path(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(&self.staging_dir)
    }

    fn require_value(value: &str, field: &str) -> Result<(), ConfigError> {
        Self::require_optional_value(Some(value), field)
    }

    fn require_optional_value(value: Option<&str>, field: &str) -> Result<(), ConfigError> {
        match value {
            None => Ok(()),
            Some(v) if !v.trim().is_empty() => Ok(()),
            Some(_) => Err(ConfigError::InvalidConfig {
                field: field.to_owned(),
            }),
        }
    }

    fn require_positive(value: u64, field: &str) -> Result<(), ConfigError> {
        if value == 0 {
            return Err(ConfigError::InvalidValue {
                field: field.to_owned(),
                reason: String::from("must be greater than zero"),
            });
        }
        Ok(())
    }
}
