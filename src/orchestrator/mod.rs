//! Entry points for cluster provisioning and node changes.
//!
//! [`Provisioner`] validates requests, serializes structural operations per
//! cluster through the distributed lock, and starts remote work. It never
//! waits for the remote work: the reconciler observes completion through
//! the exit-code markers and releases the cluster lease.

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::HoistConfig;
use crate::kv::KvStore;
use crate::lock::{ClusterLease, DistributedLock, OperationSnapshot, lock_key};
use crate::model::{
    Cluster, ClusterId, HostConnection, MembershipType, Node, NodeId, NodeSpec, OperationType,
    ProjectId,
};
use crate::operator::NodeOperator;
use crate::policy::{self, DeleteCheck, RoleCounts};
use crate::reconcile::OperationHandle;
use crate::session::{self, Connector};
use crate::store::{NodeFilter, RecordStore};
use crate::template::Templates;

mod check;
mod error;
mod install;
mod nodes;

pub use check::{
    CheckAndSaveOutcome, CheckAndSaveRequest, NodeCheckProgress, ProbeStep, StepStatus,
};
pub use error::{CLUSTER_OPERATING_CODE, ErrorKind, ProvisionError};
pub use install::InstallPayload;

const NODE_NOT_EXIST: &str = "error.node.not.exist";
const CLUSTER_NOT_EXIST: &str = "error.cluster.not.exist";
const OTHER_PROJECT: &str = "error.operating.resource.in.other.project";

/// Orchestrates provisioning flows against one set of collaborators.
#[derive(Debug)]
pub struct Provisioner<C, K, S, O>
where
    C: Connector,
    K: KvStore + Clone,
    S: RecordStore,
    O: NodeOperator,
{
    connector: C,
    lock: DistributedLock<K>,
    store: S,
    operator: O,
    config: Arc<HoistConfig>,
    templates: Arc<Templates>,
}

impl<C, K, S, O> Provisioner<C, K, S, O>
where
    C: Connector,
    K: KvStore + Clone,
    S: RecordStore,
    O: NodeOperator,
{
    /// Creates a provisioner.
    #[must_use]
    pub fn new(
        config: Arc<HoistConfig>,
        templates: Templates,
        connector: C,
        kv: K,
        store: S,
        operator: O,
    ) -> Self {
        Self {
            connector,
            lock: DistributedLock::new(kv),
            store,
            operator,
            config,
            templates: Arc::new(templates),
        }
    }

    /// Record store shared with the operator and reconciler.
    #[must_use]
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Lock client.
    #[must_use]
    pub const fn lock(&self) -> &DistributedLock<K> {
        &self.lock
    }

    /// Returns `true` when a session to `target` can be opened.
    pub fn test_connection(&self, target: &HostConnection) -> bool {
        session::test_connection(&self.connector, target)
    }

    /// Nodes of `cluster_id` in primary-key order.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::Store`] when the query fails.
    pub fn list_nodes(&self, cluster_id: ClusterId) -> Result<Vec<Node>, ProvisionError> {
        Ok(self.store.list_nodes(&NodeFilter::cluster(cluster_id))?)
    }

    /// Node of `cluster_id` called `name`.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::Store`] when the query fails.
    pub fn node_by_name(
        &self,
        cluster_id: ClusterId,
        name: &str,
    ) -> Result<Option<Node>, ProvisionError> {
        let mut nodes = self
            .store
            .list_nodes(&NodeFilter::cluster(cluster_id).named(name))?;
        Ok(nodes.pop())
    }

    /// Nodes of `cluster_id` with the given membership.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::Store`] when the query fails.
    pub fn nodes_by_membership(
        &self,
        cluster_id: ClusterId,
        membership: MembershipType,
    ) -> Result<Vec<Node>, ProvisionError> {
        Ok(self
            .store
            .list_nodes(&NodeFilter::cluster(cluster_id).membership(membership))?)
    }

    /// Advisory check of which role quorums survive deleting `node_id`.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::Validation`] when the node is missing or
    /// belongs to another project.
    pub fn check_enable_delete(
        &self,
        project_id: ProjectId,
        node_id: NodeId,
    ) -> Result<DeleteCheck, ProvisionError> {
        let node = self.node_in_project(project_id, node_id)?;
        let counts = RoleCounts::load(&self.store, node.cluster_id)?;
        Ok(policy::can_delete_node(node.spec.role, counts))
    }

    fn node_in_project(
        &self,
        project_id: ProjectId,
        node_id: NodeId,
    ) -> Result<Node, ProvisionError> {
        let node = self.store.get_node(node_id)?.ok_or_else(|| {
            ProvisionError::validation(NODE_NOT_EXIST, format!("node {node_id} does not exist"))
        })?;
        if node.project_id != project_id {
            return Err(ProvisionError::validation(
                OTHER_PROJECT,
                format!("node {node_id} belongs to another project"),
            ));
        }
        Ok(node)
    }

    fn cluster_in_project(
        &self,
        project_id: ProjectId,
        cluster_id: ClusterId,
    ) -> Result<Cluster, ProvisionError> {
        let cluster = self.store.get_cluster(cluster_id)?.ok_or_else(|| {
            ProvisionError::validation(
                CLUSTER_NOT_EXIST,
                format!("cluster {cluster_id} does not exist"),
            )
        })?;
        if cluster.project_id != project_id {
            return Err(ProvisionError::validation(
                OTHER_PROJECT,
                format!("cluster {cluster_id} belongs to another project"),
            ));
        }
        Ok(cluster)
    }

    /// Takes the cluster lock and publishes the operating snapshot.
    fn lease_cluster(
        &self,
        cluster_id: ClusterId,
        operation: OperationType,
        node_id: Option<NodeId>,
    ) -> Result<ClusterLease, ProvisionError> {
        let Some(guard) = self
            .lock
            .acquire(&lock_key(cluster_id), self.config.lock_ttl())?
        else {
            info!(cluster_id, operation = %operation, "cluster is busy");
            return Err(ProvisionError::Conflict { cluster_id });
        };
        let snapshot = OperationSnapshot::operating(cluster_id, operation, node_id);
        self.lock
            .write_snapshot(&snapshot, Some(self.config.lock_ttl()))?;
        info!(cluster_id, operation = %operation, "cluster lock acquired");
        Ok(guard.into_lease(cluster_id))
    }

    /// Releases `lease` when the operator failed to start its work.
    fn hand_off(
        &self,
        lease: &ClusterLease,
        started: Result<OperationHandle, ProvisionError>,
    ) -> Result<OperationHandle, ProvisionError> {
        if started.is_err()
            && let Err(err) = self.lock.release_lease(lease)
        {
            warn!(cluster_id = lease.cluster_id, error = %err, "failed to release cluster lease");
        }
        started
    }
}

fn validate_spec(spec: &NodeSpec) -> Result<(), ProvisionError> {
    if spec.name.trim().is_empty() {
        return Err(ProvisionError::validation(
            "error.node.name.empty",
            "node name must not be empty",
        ));
    }
    if spec.host.trim().is_empty() {
        return Err(ProvisionError::validation(
            "error.node.host.empty",
            format!("node {} has no host", spec.name),
        ));
    }
    if spec.port == 0 {
        return Err(ProvisionError::validation(
            "error.node.port.invalid",
            format!("node {} has port 0", spec.name),
        ));
    }
    Ok(())
}
