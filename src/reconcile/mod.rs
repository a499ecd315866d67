//! Background reconciliation of operation records.
//!
//! Remote playbooks run detached and report through an exit-code marker
//! named after their record. [`StatusReconciler::sweep`] reads those
//! markers, applies the outcome to records, clusters, and nodes, releases
//! finished cluster leases, and publishes a [`Completion`] for every record
//! it finalizes or prunes.

use std::collections::BTreeMap;
use std::sync::Arc;

use shell_escape::unix::escape;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::HoistConfig;
use crate::kv::KvStore;
use crate::lock::{ClusterLease, DistributedLock, LockError, OperationSnapshot, SWEEP_LOCK_KEY};
use crate::model::{
    Cluster, ClusterStatus, Node, NodeStatus, OperationRecord, OperationStatus, OperationType,
};
use crate::session::{Connector, RemoteSession, SessionError, open_session};
use crate::store::{
    self, ClusterPatch, NodePatch, RecordFilter, RecordPatch, RecordStore, StoreError,
};
use crate::template;

mod agent;
mod events;
mod looping;

pub use agent::{AgentCommands, AgentError, TemplateAgentCommands};
pub use events::{COMPLETION_CHANNEL_CAPACITY, Completion, OperationHandle, Outcome};
pub use looping::ReconcileLoop;

/// Stderr fragment meaning the marker has not been written yet.
const MARKER_MISSING: &str = "No such file or directory";

/// Errors raised while reconciling one record.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ReconcileError {
    /// Raised when the record store fails.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Raised when the lock store fails.
    #[error(transparent)]
    Lock(#[from] LockError),
    /// Raised when the control host cannot be reached.
    #[error("Failed to connect to host: [ {host} ] by ssh")]
    Connect {
        /// Host that refused the session.
        host: String,
        /// Underlying session error.
        #[source]
        source: SessionError,
    },
    /// Raised when reading the marker fails in transit.
    #[error(transparent)]
    Transport(#[from] SessionError),
}

/// Tally of one sweep.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SweepReport {
    /// Whether this sweep held the sweep lock.
    pub acquired: bool,
    /// Records still running.
    pub running: usize,
    /// Records moved to a terminal status.
    pub finalized: usize,
    /// Records deleted because their cluster is gone or empty.
    pub pruned: usize,
    /// Records whose handling raised an error.
    pub errors: usize,
}

impl SweepReport {
    /// Report of a sweep that found the lock held elsewhere.
    #[must_use]
    pub const fn skipped() -> Self {
        Self {
            acquired: false,
            running: 0,
            finalized: 0,
            pruned: 0,
            errors: 0,
        }
    }

    const fn started() -> Self {
        Self {
            acquired: true,
            ..Self::skipped()
        }
    }
}

/// Receives per-record failures during a sweep.
pub trait SweepErrorHook: Send + Sync {
    /// Called after `record` failed to reconcile. The sweep continues with
    /// the next record.
    fn on_record_error(&self, record: &OperationRecord, error: &ReconcileError);
}

/// Hook that only logs.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogSweepErrors;

impl SweepErrorHook for LogSweepErrors {
    fn on_record_error(&self, record: &OperationRecord, error: &ReconcileError) {
        warn!(
            record_id = record.id,
            cluster_id = record.cluster_id,
            error = %error,
            "record left for the next sweep"
        );
    }
}

/// One reconciliation pass, run periodically by [`ReconcileLoop`].
pub trait Sweep: Send + Sync {
    /// Runs one pass.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError`] when the pass cannot start.
    fn sweep(&self) -> Result<SweepReport, ReconcileError>;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Decision {
    Running,
    Finalized,
    Pruned,
}

/// Drives operation records to their terminal status.
pub struct StatusReconciler<C, K, S, A>
where
    C: Connector,
    K: KvStore + Clone,
    S: RecordStore,
    A: AgentCommands,
{
    connector: C,
    lock: DistributedLock<K>,
    store: S,
    agent: A,
    config: Arc<HoistConfig>,
    events: broadcast::Sender<Completion>,
    hook: Box<dyn SweepErrorHook>,
}

impl<C, K, S, A> StatusReconciler<C, K, S, A>
where
    C: Connector,
    K: KvStore + Clone,
    S: RecordStore,
    A: AgentCommands,
{
    /// Creates a reconciler with the logging error hook.
    #[must_use]
    pub fn new(config: Arc<HoistConfig>, connector: C, kv: K, store: S, agent: A) -> Self {
        let (events, _) = broadcast::channel(COMPLETION_CHANNEL_CAPACITY);
        Self {
            connector,
            lock: DistributedLock::new(kv),
            store,
            agent,
            config,
            events,
            hook: Box::new(LogSweepErrors),
        }
    }

    /// Replaces the per-record error hook.
    #[must_use]
    pub fn with_error_hook(mut self, hook: impl SweepErrorHook + 'static) -> Self {
        self.hook = Box::new(hook);
        self
    }

    /// Subscribes to completion events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Completion> {
        self.events.subscribe()
    }

    /// Record store being reconciled.
    #[must_use]
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Reconciles every operating record once.
    ///
    /// Returns [`SweepReport::skipped`] when another sweep holds the lock.
    /// Failures on single records go to the error hook and do not stop the
    /// sweep.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError`] when the sweep lock or the record listing
    /// fails.
    pub fn sweep(&self) -> Result<SweepReport, ReconcileError> {
        let Some(guard) = self
            .lock
            .acquire(SWEEP_LOCK_KEY, self.config.sweep_lock_ttl())?
        else {
            debug!("sweep lock held elsewhere");
            return Ok(SweepReport::skipped());
        };

        let records = self
            .store
            .list_records(&RecordFilter::with_status(OperationStatus::Operating))?;
        let mut report = SweepReport::started();
        for record in &records {
            match self.reconcile(record) {
                Ok(Decision::Running) => report.running += 1,
                Ok(Decision::Finalized) => report.finalized += 1,
                Ok(Decision::Pruned) => report.pruned += 1,
                Err(err) => {
                    report.errors += 1;
                    self.hook.on_record_error(record, &err);
                }
            }
        }

        if let Err(err) = guard.release() {
            warn!(error = %err, "failed to release sweep lock");
        }
        info!(
            running = report.running,
            finalized = report.finalized,
            pruned = report.pruned,
            errors = report.errors,
            "sweep finished"
        );
        Ok(report)
    }

    fn reconcile(&self, record: &OperationRecord) -> Result<Decision, ReconcileError> {
        let Some(cluster) = self.store.get_cluster(record.cluster_id)? else {
            info!(
                record_id = record.id,
                cluster_id = record.cluster_id,
                "cluster gone, pruning record"
            );
            return self.prune(record);
        };
        if cluster.status != ClusterStatus::Operating {
            let status = if cluster.status == ClusterStatus::Failed {
                OperationStatus::Failed
            } else {
                OperationStatus::Success
            };
            info!(
                record_id = record.id,
                cluster_id = cluster.id,
                status = ?status,
                "cluster already settled"
            );
            self.store
                .update_record(record.id, &RecordPatch::status(status))?;
            self.finish(record, status)?;
            return Ok(Decision::Finalized);
        }
        let Some(control) = store::control_node(&self.store, cluster.id)? else {
            warn!(
                record_id = record.id,
                cluster_id = cluster.id,
                "cluster has no nodes, pruning record"
            );
            return self.prune(record);
        };

        let host = control.spec.host.clone();
        let session = open_session(&self.connector, &control.spec.connection())
            .map_err(|source| ReconcileError::Connect { host, source })?;
        let marker = self.config.exit_code_path(record.id);
        let output = session.execute(&format!("cat {}", escape(marker.as_str().into())))?;

        if !output.is_success() {
            if output.stderr.contains(MARKER_MISSING) {
                debug!(
                    record_id = record.id,
                    cluster_id = cluster.id,
                    "operation still running"
                );
                return Ok(Decision::Running);
            }
            warn!(
                record_id = record.id,
                host = session.host(),
                stderr = %output.stderr,
                "failed to read exit code"
            );
            self.fail(record, &output.stderr)?;
            return Ok(Decision::Finalized);
        }

        if output.stdout.replace(['\r', '\n'], "") != "0" {
            let message = format!(
                "login node [ {} ] and cat {} for more info",
                session.host(),
                self.config.install_log_path
            );
            info!(record_id = record.id, cluster_id = cluster.id, "operation failed");
            self.fail(record, &message)?;
            return Ok(Decision::Finalized);
        }

        match record.operation {
            OperationType::InstallK8s => self.complete_install(&*session, record, &cluster)?,
            OperationType::AddNode | OperationType::DeleteNode | OperationType::DeleteNodeRole => {
                self.complete_node_operation(record)?;
            }
        }
        Ok(Decision::Finalized)
    }

    fn prune(&self, record: &OperationRecord) -> Result<Decision, ReconcileError> {
        self.store.delete_record(record.id)?;
        if is_node_operation(record.operation) {
            self.lock.release_lease(&self.lease_of(record))?;
        }
        self.publish(record, Outcome::Pruned);
        Ok(Decision::Pruned)
    }

    fn fail(&self, record: &OperationRecord, message: &str) -> Result<(), ReconcileError> {
        self.store
            .update_record(record.id, &RecordPatch::failed(message))?;
        self.store
            .update_cluster(record.cluster_id, &ClusterPatch::status(ClusterStatus::Failed))?;
        if record.operation == OperationType::AddNode
            && let Some(node_id) = record.node_id
        {
            self.store.update_node(
                node_id,
                &NodePatch {
                    operating_status: Some(NodeStatus::Failed),
                    error_msg: Some(message.to_owned()),
                    ..NodePatch::default()
                },
            )?;
        }
        self.finish(record, OperationStatus::Failed)
    }

    fn complete_install<R: RemoteSession + ?Sized>(
        &self,
        session: &R,
        record: &OperationRecord,
        cluster: &Cluster,
    ) -> Result<(), ReconcileError> {
        info!(record_id = record.id, cluster_id = cluster.id, "cluster installed");
        self.store
            .update_record(record.id, &RecordPatch::status(OperationStatus::Success))?;
        self.store
            .update_cluster(cluster.id, &ClusterPatch::status(ClusterStatus::Disconnect))?;

        for problem in self.install_agent(session, cluster) {
            warn!(
                record_id = record.id,
                cluster_id = cluster.id,
                error = %problem,
                "agent install problem"
            );
            self.store.update_record(
                record.id,
                &RecordPatch {
                    status: None,
                    append_error: Some(problem),
                },
            )?;
        }
        self.finish(record, OperationStatus::Success)
    }

    /// Bootstraps Helm and then the agent. Returns the error texts to
    /// append to the record; an agent failure never fails the install.
    fn install_agent<R: RemoteSession + ?Sized>(
        &self,
        session: &R,
        cluster: &Cluster,
    ) -> Vec<String> {
        let mut problems = Vec::new();
        if let Some(url) = self.config.helm_download_url.as_deref() {
            let values = BTreeMap::from([("url", url)]);
            let command = template::substitute(&self.config.helm_install_template, &values);
            if let Some(problem) = run_for_problem(session, &command) {
                problems.push(problem);
            }
        }
        match self.agent.install_command(cluster) {
            Ok(Some(command)) => {
                if let Some(problem) = run_for_problem(session, &command) {
                    problems.push(problem);
                }
            }
            Ok(None) => debug!(cluster_id = cluster.id, "no agent configured"),
            Err(err) => problems.push(err.to_string()),
        }
        problems
    }

    fn complete_node_operation(&self, record: &OperationRecord) -> Result<(), ReconcileError> {
        match record.node_id {
            Some(node_id) => match self.store.get_node(node_id)? {
                Some(node) => self.apply_node_change(record, &node)?,
                None => warn!(record_id = record.id, node_id, "node vanished before completion"),
            },
            None => warn!(record_id = record.id, "node operation without a node"),
        }
        self.store
            .update_record(record.id, &RecordPatch::status(OperationStatus::Success))?;
        self.store
            .update_cluster(record.cluster_id, &ClusterPatch::status(ClusterStatus::Running))?;
        info!(
            record_id = record.id,
            cluster_id = record.cluster_id,
            operation = %record.operation,
            "node operation finished"
        );
        self.finish(record, OperationStatus::Success)
    }

    fn apply_node_change(
        &self,
        record: &OperationRecord,
        node: &Node,
    ) -> Result<(), ReconcileError> {
        match (record.operation, record.removed_role) {
            (OperationType::AddNode, _) => self.store.update_node(
                node.id,
                &NodePatch {
                    operating_status: Some(NodeStatus::Ready),
                    error_msg: Some(String::new()),
                    ..NodePatch::default()
                },
            )?,
            (OperationType::DeleteNodeRole, Some(kind)) => match node.spec.role.without(kind) {
                Some(role) => self.store.update_node(
                    node.id,
                    &NodePatch {
                        role: Some(role),
                        ..NodePatch::default()
                    },
                )?,
                None => {
                    self.store.delete_node(node.id)?;
                }
            },
            (OperationType::DeleteNodeRole, None) => {
                warn!(record_id = record.id, "role removal without a role");
            }
            (OperationType::DeleteNode, _) => {
                self.store.delete_node(node.id)?;
            }
            (OperationType::InstallK8s, _) => {}
        }
        Ok(())
    }

    /// Releases the cluster lease of node operations and publishes the
    /// terminal transition.
    fn finish(
        &self,
        record: &OperationRecord,
        status: OperationStatus,
    ) -> Result<(), ReconcileError> {
        if is_node_operation(record.operation) {
            self.lock.finish_lease(
                &self.lease_of(record),
                OperationSnapshot::operating(record.cluster_id, record.operation, record.node_id),
                status,
            )?;
        }
        self.publish(record, Outcome::from_status(status));
        Ok(())
    }

    fn lease_of(&self, record: &OperationRecord) -> ClusterLease {
        ClusterLease::for_cluster(record.cluster_id, self.config.lock_ttl())
    }

    fn publish(&self, record: &OperationRecord, outcome: Outcome) {
        let completion = Completion {
            record_id: record.id,
            cluster_id: record.cluster_id,
            outcome,
        };
        if self.events.send(completion).is_err() {
            debug!(record_id = record.id, "no completion subscribers");
        }
    }
}

impl<C, K, S, A> Sweep for StatusReconciler<C, K, S, A>
where
    C: Connector,
    K: KvStore + Clone,
    S: RecordStore,
    A: AgentCommands,
{
    fn sweep(&self) -> Result<SweepReport, ReconcileError> {
        Self::sweep(self)
    }
}

const fn is_node_operation(operation: OperationType) -> bool {
    !matches!(operation, OperationType::InstallK8s)
}

/// Runs `command`, returning the text to record when it does not succeed.
fn run_for_problem<R: RemoteSession + ?Sized>(session: &R, command: &str) -> Option<String> {
    match session.execute(command) {
        Ok(output) if output.is_success() => None,
        Ok(output) => Some(output.combined()),
        Err(err) => Some(err.to_string()),
    }
}

#[cfg(test)]
mod tests;
