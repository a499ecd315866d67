//! Pre-flight checks for a new cluster.
//!
//! The control host installs the container runtime and runs four probe
//! playbooks against the candidate nodes. Progress is published to the
//! key-value store after every probe so callers can poll it while the
//! checks run. The cluster and its nodes are stored only when every probe
//! passes.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{ProvisionError, Provisioner, validate_spec};
use crate::inventory;
use crate::kv::{KvError, KvStore};
use crate::lock::LockError;
use crate::model::{
    Cluster, ClusterDraft, ClusterStatus, HostConnection, Node, NodeSpec, OperationStatus,
    ProjectId,
};
use crate::operator::{NodeOperator, playbook_command, remote_failure, upload_inventory};
use crate::session::{Connector, RemoteSession, open_session};
use crate::store::RecordStore;

/// One probe playbook run during pre-flight checks.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ProbeStep {
    /// Inventory variables are consistent.
    Variable,
    /// Operating system requirements.
    System,
    /// Memory requirements.
    Memory,
    /// CPU requirements.
    Cpu,
}

impl ProbeStep {
    /// Probes in execution order.
    pub const ALL: [Self; 4] = [Self::Variable, Self::System, Self::Memory, Self::Cpu];

    /// Playbook file implementing the probe.
    #[must_use]
    pub const fn playbook(self) -> &'static str {
        match self {
            Self::Variable => "check-variable.yml",
            Self::System => "check-system.yml",
            Self::Memory => "check-memory.yml",
            Self::Cpu => "check-cpu.yml",
        }
    }

    /// Short name used in logs and errors.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Variable => "variable",
            Self::System => "system",
            Self::Memory => "memory",
            Self::Cpu => "cpu",
        }
    }
}

/// Result of one probe.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepStatus {
    /// Probe status.
    pub status: OperationStatus,
    /// Probe output when it failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl Default for StepStatus {
    fn default() -> Self {
        Self {
            status: OperationStatus::Operating,
            error_message: None,
        }
    }
}

/// Progress of a pre-flight check, stored under the caller's key.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeCheckProgress {
    /// Overall status.
    pub status: OperationStatus,
    /// Variable probe.
    pub configuration: StepStatus,
    /// System probe.
    pub system: StepStatus,
    /// Memory probe.
    pub memory: StepStatus,
    /// CPU probe.
    pub cpu: StepStatus,
    /// Error that aborted the check.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_msg: Option<String>,
}

impl Default for NodeCheckProgress {
    fn default() -> Self {
        Self {
            status: OperationStatus::Operating,
            configuration: StepStatus::default(),
            system: StepStatus::default(),
            memory: StepStatus::default(),
            cpu: StepStatus::default(),
            error_msg: None,
        }
    }
}

impl NodeCheckProgress {
    /// Status of `step`.
    #[must_use]
    pub const fn step(&self, step: ProbeStep) -> &StepStatus {
        match step {
            ProbeStep::Variable => &self.configuration,
            ProbeStep::System => &self.system,
            ProbeStep::Memory => &self.memory,
            ProbeStep::Cpu => &self.cpu,
        }
    }

    const fn step_mut(&mut self, step: ProbeStep) -> &mut StepStatus {
        match step {
            ProbeStep::Variable => &mut self.configuration,
            ProbeStep::System => &mut self.system,
            ProbeStep::Memory => &mut self.memory,
            ProbeStep::Cpu => &mut self.cpu,
        }
    }
}

/// Input of [`Provisioner::check_and_save`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CheckAndSaveRequest {
    /// Project that will own the cluster.
    pub project_id: ProjectId,
    /// Cluster to register.
    pub cluster: ClusterDraft,
    /// Candidate nodes, inner and outer.
    pub nodes: Vec<NodeSpec>,
    /// Host running the probes.
    pub control: HostConnection,
    /// Key receiving [`NodeCheckProgress`] updates.
    pub progress_key: String,
}

/// Rows stored by a successful check.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CheckAndSaveOutcome {
    /// Registered cluster, status `Created`.
    pub cluster: Cluster,
    /// Registered nodes.
    pub nodes: Vec<Node>,
    /// Final progress record.
    pub progress: NodeCheckProgress,
}

impl<C, K, S, O> Provisioner<C, K, S, O>
where
    C: Connector,
    K: KvStore + Clone,
    S: RecordStore,
    O: NodeOperator,
{
    /// Probes the candidate nodes and registers the cluster when every
    /// probe passes.
    ///
    /// A failure at any stage is written to the progress record before it
    /// is returned.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::Connect`] when the control host is
    /// unreachable, [`ProvisionError::ContainerRuntime`] when the runtime
    /// install fails, and [`ProvisionError::Remote`] for the first failing
    /// probe.
    pub fn check_and_save(
        &self,
        request: CheckAndSaveRequest,
    ) -> Result<CheckAndSaveOutcome, ProvisionError> {
        let key = request.progress_key.clone();
        let mut progress = NodeCheckProgress::default();
        match self.run_checks(request, &mut progress) {
            Ok((cluster, nodes)) => Ok(CheckAndSaveOutcome {
                cluster,
                nodes,
                progress,
            }),
            Err(err) => {
                progress.status = OperationStatus::Failed;
                progress.error_msg = Some(err.to_string());
                if let Err(write_err) = self.write_progress(&key, &progress) {
                    warn!(key = %key, error = %write_err, "failed to publish check failure");
                }
                Err(err)
            }
        }
    }

    /// Reads the progress stored under `key`. Progress expires after the
    /// cluster lock TTL.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::Lock`] when the store fails or the value
    /// is not a progress record.
    pub fn check_progress(&self, key: &str) -> Result<Option<NodeCheckProgress>, ProvisionError> {
        let Some(raw) = self.lock.store().get(key).map_err(LockError::from)? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|err| corrupt_progress(key, &err))
    }

    fn run_checks(
        &self,
        request: CheckAndSaveRequest,
        progress: &mut NodeCheckProgress,
    ) -> Result<(Cluster, Vec<Node>), ProvisionError> {
        validate_candidates(&request.nodes)?;
        let host = request.control.host.clone();
        let session = open_session(&self.connector, &request.control)
            .map_err(|source| ProvisionError::Connect {
                host: host.clone(),
                source,
            })?;

        info!(host = %host, "installing container runtime");
        let runtime = session.execute(&self.config.container_runtime_command)?;
        if !runtime.is_success() {
            return Err(ProvisionError::ContainerRuntime {
                host,
                stderr: runtime.stderr,
            });
        }

        let rendered = inventory::render(&request.nodes)?;
        upload_inventory(&*session, &self.config, &self.templates, &rendered)?;
        self.run_probes(&*session, &request.progress_key, progress)?;

        let cluster = self.store.insert_cluster(
            request.project_id,
            &request.cluster,
            ClusterStatus::Created,
        )?;
        let nodes = self
            .store
            .insert_nodes(request.project_id, cluster.id, request.nodes)?;
        info!(cluster_id = cluster.id, nodes = nodes.len(), "cluster registered");
        Ok((cluster, nodes))
    }

    fn run_probes<R: RemoteSession + ?Sized>(
        &self,
        session: &R,
        key: &str,
        progress: &mut NodeCheckProgress,
    ) -> Result<(), ProvisionError> {
        for step in ProbeStep::ALL {
            let output = session.execute(&playbook_command(&self.config, step.playbook()))?;
            if !output.is_success() {
                warn!(host = session.host(), step = step.name(), "probe failed");
                let slot = progress.step_mut(step);
                slot.status = OperationStatus::Failed;
                slot.error_message = Some(output.combined());
                progress.status = OperationStatus::Failed;
                self.write_progress(key, progress)?;
                return Err(remote_failure(step.name(), output));
            }
            progress.step_mut(step).status = OperationStatus::Success;
            if step == ProbeStep::Cpu {
                progress.status = OperationStatus::Success;
            }
            self.write_progress(key, progress)?;
            info!(host = session.host(), step = step.name(), "probe passed");
        }
        Ok(())
    }

    fn write_progress(
        &self,
        key: &str,
        progress: &NodeCheckProgress,
    ) -> Result<(), ProvisionError> {
        let encoded =
            serde_json::to_string(progress).map_err(|err| corrupt_progress(key, &err))?;
        self.lock
            .store()
            .set(key, &encoded, Some(self.config.lock_ttl()))
            .map_err(LockError::from)?;
        Ok(())
    }
}

fn corrupt_progress(key: &str, err: &serde_json::Error) -> ProvisionError {
    ProvisionError::Lock(LockError::Store(KvError::Corrupt {
        key: key.to_owned(),
        message: err.to_string(),
    }))
}

fn validate_candidates(nodes: &[NodeSpec]) -> Result<(), ProvisionError> {
    if nodes.is_empty() {
        return Err(ProvisionError::validation(
            "error.node.list.empty",
            "at least one node is required",
        ));
    }
    let mut names = BTreeSet::new();
    for node in nodes {
        validate_spec(node)?;
        if !names.insert(node.name.as_str()) {
            return Err(ProvisionError::validation(
                "error.node.name.duplicate",
                format!("node name {} is used twice", node.name),
            ));
        }
    }
    Ok(())
}
