//! Detached playbook runs on the control host.
//!
//! A launch uploads the rendered inventory and a wrapper script, then starts
//! the script under `nohup`. The wrapper writes the playbook's exit status
//! to the record's marker file, which the reconciler polls.

use std::collections::BTreeMap;

use shell_escape::unix::escape;
use tracing::info;

use crate::config::HoistConfig;
use crate::inventory::Inventory;
use crate::model::{OperationType, RecordId};
use crate::orchestrator::ProvisionError;
use crate::session::{ExecOutput, RemoteSession};
use crate::template::{self, Templates};

/// Playbook bootstrapping a new cluster.
pub const INSTALL_PLAYBOOK: &str = "90-init-cluster.yml";
/// Playbook joining new nodes.
pub const ADD_NODE_PLAYBOOK: &str = "81-add-node.yml";
/// Playbook removing nodes.
pub const REMOVE_NODE_PLAYBOOK: &str = "85-remove-node.yml";
/// Playbook removing single roles.
pub const REMOVE_ROLE_PLAYBOOK: &str = "86-remove-role.yml";

/// A playbook started in the background for one operation record.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PlaybookJob {
    /// Record whose marker receives the exit status.
    pub record_id: RecordId,
    /// Playbook file under the playbook directory.
    pub playbook: &'static str,
    /// Wrapper script name under the remote configuration directory.
    pub script: &'static str,
}

impl PlaybookJob {
    /// Job running the playbook that matches `operation`.
    #[must_use]
    pub const fn for_operation(operation: OperationType, record_id: RecordId) -> Self {
        let (playbook, script) = match operation {
            OperationType::InstallK8s => (INSTALL_PLAYBOOK, "install-k8s.sh"),
            OperationType::AddNode => (ADD_NODE_PLAYBOOK, "add-node.sh"),
            OperationType::DeleteNode => (REMOVE_NODE_PLAYBOOK, "remove-node.sh"),
            OperationType::DeleteNodeRole => (REMOVE_ROLE_PLAYBOOK, "remove-node-role.sh"),
        };
        Self {
            record_id,
            playbook,
            script,
        }
    }
}

/// Renders the command running `playbook` against the uploaded inventory.
#[must_use]
pub fn playbook_command(config: &HoistConfig, playbook: &str) -> String {
    let inventory = config.remote_inventory_path();
    let values = BTreeMap::from([
        ("inventory", inventory.as_str()),
        ("playbook-dir", config.playbook_dir.as_str()),
        ("playbook", playbook),
    ]);
    template::substitute(&config.playbook_command_template, &values)
}

/// Uploads the rendered inventory to its remote location.
///
/// # Errors
///
/// Returns [`ProvisionError::Transport`] when the copy fails.
pub fn upload_inventory<S: RemoteSession + ?Sized>(
    session: &S,
    config: &HoistConfig,
    templates: &Templates,
    inventory: &Inventory,
) -> Result<(), ProvisionError> {
    session.upload(
        &inventory.to_text(&templates.inventory),
        &config.remote_inventory_path(),
    )?;
    Ok(())
}

/// Uploads the inventory and wrapper script for `job` and starts it
/// detached.
///
/// # Errors
///
/// Returns [`ProvisionError::Transport`] when an upload or the launch
/// command fails in transit and [`ProvisionError::Remote`] when the launch
/// exits non-zero.
pub fn launch<S: RemoteSession + ?Sized>(
    session: &S,
    config: &HoistConfig,
    templates: &Templates,
    inventory: &Inventory,
    job: PlaybookJob,
) -> Result<(), ProvisionError> {
    upload_inventory(session, config, templates, inventory)?;

    let script = template::render_wrapper_script(
        &templates.wrapper,
        &playbook_command(config, job.playbook),
        &config.install_log_path,
        &config.exit_code_path(job.record_id),
    );
    let script_path = config.remote_script_path(job.script);
    session.upload(&script, &script_path)?;

    let command = format!(
        "nohup bash {} > {} 2>&1 &",
        escape(script_path.as_str().into()),
        escape(config.nohup_log_path.as_str().into())
    );
    let output = session.execute(&command)?;
    if !output.is_success() {
        return Err(remote_failure(job.script, output));
    }
    info!(
        record_id = job.record_id,
        host = session.host(),
        step = job.script,
        "background playbook launched"
    );
    Ok(())
}

/// Converts a non-zero remote exit into [`ProvisionError::Remote`].
#[must_use]
pub fn remote_failure(step: &str, output: ExecOutput) -> ProvisionError {
    ProvisionError::Remote {
        step: step.to_owned(),
        stdout: output.stdout,
        stderr: output.stderr,
    }
}
