//! Node mutations performed while the orchestrator holds a cluster lease.
//!
//! [`NodeOperator`] is the hand-off point: the orchestrator validates the
//! request and takes the lock, the operator records the operation and
//! starts the remote work. [`PlaybookOperator`] is the built-in operator
//! running the add and remove playbooks from the cluster's control host.

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::HoistConfig;
use crate::inventory::{self, Inventory};
use crate::lock::ClusterLease;
use crate::model::{
    Cluster, ClusterId, ClusterStatus, NewRecord, Node, NodeId, NodeSpec, NodeStatus,
    OperationRecord, OperationType, RecordId, RoleKind,
};
use crate::orchestrator::ProvisionError;
use crate::reconcile::OperationHandle;
use crate::session::{Connector, open_session};
use crate::store::{self, ClusterPatch, NodeFilter, NodePatch, RecordPatch, RecordStore};
use crate::template::Templates;

mod launch;

pub use launch::{
    ADD_NODE_PLAYBOOK, INSTALL_PLAYBOOK, PlaybookJob, REMOVE_NODE_PLAYBOOK, REMOVE_ROLE_PLAYBOOK,
    launch, playbook_command, remote_failure, upload_inventory,
};

/// Performs a structural change on a locked cluster.
///
/// Returning `Ok` means the remote work is running and the lease stays
/// held until the reconciler finalizes the record. Returning `Err` hands
/// the lease back to the caller, which releases it.
pub trait NodeOperator: Send + Sync {
    /// Joins `node` to `cluster`.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError`] when the operation cannot be started.
    fn add_node(
        &self,
        cluster: &Cluster,
        node: NodeSpec,
        lease: &ClusterLease,
    ) -> Result<OperationHandle, ProvisionError>;

    /// Removes `node` from `cluster`.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError`] when the operation cannot be started.
    fn delete_node(
        &self,
        cluster: &Cluster,
        node: &Node,
        lease: &ClusterLease,
    ) -> Result<OperationHandle, ProvisionError>;

    /// Removes the `role` duty from `node`.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError`] when the operation cannot be started.
    fn delete_node_role(
        &self,
        cluster: &Cluster,
        node: &Node,
        role: RoleKind,
        lease: &ClusterLease,
    ) -> Result<OperationHandle, ProvisionError>;
}

/// Marks a record and its cluster failed, appending `message` to the
/// record. When `node_id` is set the node is marked failed too.
///
/// Store failures are logged; the caller is already reporting an error.
pub fn record_failure<S: RecordStore + ?Sized>(
    store: &S,
    record_id: RecordId,
    cluster_id: ClusterId,
    node_id: Option<NodeId>,
    message: &str,
) {
    if let Err(err) = store.update_record(record_id, &RecordPatch::failed(message)) {
        warn!(record_id, error = %err, "failed to mark record failed");
    }
    if let Err(err) = store.update_cluster(cluster_id, &ClusterPatch::status(ClusterStatus::Failed))
    {
        warn!(cluster_id, error = %err, "failed to mark cluster failed");
    }
    if let Some(id) = node_id {
        let patch = NodePatch {
            operating_status: Some(NodeStatus::Failed),
            error_msg: Some(message.to_owned()),
            ..NodePatch::default()
        };
        if let Err(err) = store.update_node(id, &patch) {
            warn!(node_id = id, error = %err, "failed to mark node failed");
        }
    }
}

/// Operator running the node playbooks over SSH.
#[derive(Clone, Debug)]
pub struct PlaybookOperator<C: Connector, S: RecordStore> {
    connector: C,
    store: S,
    config: Arc<HoistConfig>,
    templates: Arc<Templates>,
}

impl<C: Connector, S: RecordStore> PlaybookOperator<C, S> {
    /// Creates an operator sharing `store` with the orchestrator.
    #[must_use]
    pub fn new(connector: C, store: S, config: Arc<HoistConfig>, templates: Templates) -> Self {
        Self {
            connector,
            store,
            config,
            templates: Arc::new(templates),
        }
    }

    fn control_node(&self, cluster_id: ClusterId) -> Result<Node, ProvisionError> {
        store::control_node(&self.store, cluster_id)?.ok_or_else(|| {
            ProvisionError::InconsistentState {
                what: format!("cluster {cluster_id} has no nodes to run playbooks from"),
            }
        })
    }

    fn current_inventory(&self, cluster_id: ClusterId) -> Result<Inventory, ProvisionError> {
        let nodes = self.store.list_nodes(&NodeFilter::cluster(cluster_id))?;
        Ok(inventory::render(nodes.iter().map(|node| &node.spec))?)
    }

    /// Marks the cluster operating and launches the playbook for `record`.
    /// Launch failures are recorded before they are returned.
    fn start(
        &self,
        record: &OperationRecord,
        control: &Node,
        inventory: &Inventory,
        failed_node: Option<NodeId>,
    ) -> Result<OperationHandle, ProvisionError> {
        let result = self.launch_on(record, control, inventory);
        if let Err(err) = &result {
            warn!(
                record_id = record.id,
                cluster_id = record.cluster_id,
                error = %err,
                "node operation failed to start"
            );
            record_failure(
                &self.store,
                record.id,
                record.cluster_id,
                failed_node,
                &err.to_string(),
            );
        }
        result
    }

    fn launch_on(
        &self,
        record: &OperationRecord,
        control: &Node,
        inventory: &Inventory,
    ) -> Result<OperationHandle, ProvisionError> {
        self.store.update_cluster(
            record.cluster_id,
            &ClusterPatch::status(ClusterStatus::Operating),
        )?;
        let session = open_session(&self.connector, &control.spec.connection()).map_err(
            |source| ProvisionError::Connect {
                host: control.spec.host.clone(),
                source,
            },
        )?;
        launch(
            &*session,
            &self.config,
            &self.templates,
            inventory,
            PlaybookJob::for_operation(record.operation, record.id),
        )?;
        Ok(OperationHandle {
            record_id: record.id,
            cluster_id: record.cluster_id,
        })
    }
}

impl<C: Connector, S: RecordStore> NodeOperator for PlaybookOperator<C, S> {
    fn add_node(
        &self,
        cluster: &Cluster,
        node: NodeSpec,
        lease: &ClusterLease,
    ) -> Result<OperationHandle, ProvisionError> {
        let control = self.control_node(cluster.id)?;
        let mut inventory = self.current_inventory(cluster.id)?;
        inventory.add_host(&node)?;
        inventory.add_new_node(&node);

        let stored = self.store.insert_node(cluster.project_id, cluster.id, node)?;
        self.store.update_node(
            stored.id,
            &NodePatch {
                operating_status: Some(NodeStatus::Operating),
                ..NodePatch::default()
            },
        )?;
        let record = self
            .store
            .insert_record(NewRecord::new(cluster.id, OperationType::AddNode).node(stored.id))?;
        info!(
            cluster_id = lease.cluster_id,
            record_id = record.id,
            node = %stored.spec.name,
            "adding node"
        );
        self.start(&record, &control, &inventory, Some(stored.id))
    }

    fn delete_node(
        &self,
        cluster: &Cluster,
        node: &Node,
        lease: &ClusterLease,
    ) -> Result<OperationHandle, ProvisionError> {
        let control = self.control_node(cluster.id)?;
        let mut inventory = self.current_inventory(cluster.id)?;
        inventory.mark_node_removed(&node.spec);

        let record = self
            .store
            .insert_record(NewRecord::new(cluster.id, OperationType::DeleteNode).node(node.id))?;
        info!(
            cluster_id = lease.cluster_id,
            record_id = record.id,
            node = %node.spec.name,
            "deleting node"
        );
        self.start(&record, &control, &inventory, None)
    }

    fn delete_node_role(
        &self,
        cluster: &Cluster,
        node: &Node,
        role: RoleKind,
        lease: &ClusterLease,
    ) -> Result<OperationHandle, ProvisionError> {
        let control = self.control_node(cluster.id)?;
        let mut inventory = self.current_inventory(cluster.id)?;
        inventory.mark_role_removed(&node.spec.name, role);

        let record = self.store.insert_record(
            NewRecord::new(cluster.id, OperationType::DeleteNodeRole)
                .node(node.id)
                .removed_role(role),
        )?;
        info!(
            cluster_id = lease.cluster_id,
            record_id = record.id,
            node = %node.spec.name,
            role = %role,
            "deleting node role"
        );
        self.start(&record, &control, &inventory, None)
    }
}
