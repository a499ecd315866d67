//! Node add and removal requests.

use tracing::info;

use super::{ProvisionError, Provisioner, validate_spec};
use crate::kv::KvStore;
use crate::model::{
    ClusterId, MembershipType, NodeId, NodeSpec, OperationType, ProjectId, RoleKind,
};
use crate::operator::NodeOperator;
use crate::policy::{self, RoleCounts};
use crate::reconcile::OperationHandle;
use crate::session::Connector;
use crate::store::RecordStore;

impl<C, K, S, O> Provisioner<C, K, S, O>
where
    C: Connector,
    K: KvStore + Clone,
    S: RecordStore,
    O: NodeOperator,
{
    /// Joins `node` to `cluster_id` in the background.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::Validation`] for malformed or duplicate
    /// nodes, [`ProvisionError::Conflict`] when the cluster is busy, and
    /// the operator's error when the work cannot start.
    pub fn add_node(
        &self,
        project_id: ProjectId,
        cluster_id: ClusterId,
        node: NodeSpec,
    ) -> Result<OperationHandle, ProvisionError> {
        validate_spec(&node)?;
        if node.membership != MembershipType::Inner {
            return Err(ProvisionError::validation(
                "error.node.membership.invalid",
                format!("node {} must be an inner node", node.name),
            ));
        }
        let cluster = self.cluster_in_project(project_id, cluster_id)?;
        if self.node_by_name(cluster_id, &node.name)?.is_some() {
            return Err(ProvisionError::validation(
                "error.node.name.exist",
                format!("node {} already exists in cluster {cluster_id}", node.name),
            ));
        }

        let lease = self.lease_cluster(cluster_id, OperationType::AddNode, None)?;
        info!(cluster_id, node = %node.name, "handing add-node to operator");
        let started = self.operator.add_node(&cluster, node, &lease);
        self.hand_off(&lease, started)
    }

    /// Removes `node_id` from its cluster in the background.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::Validation`] for unknown or foreign nodes,
    /// [`ProvisionError::Policy`] when a role quorum would break, and
    /// [`ProvisionError::Conflict`] when the cluster is busy.
    pub fn delete_node(
        &self,
        project_id: ProjectId,
        node_id: NodeId,
    ) -> Result<OperationHandle, ProvisionError> {
        let node = self.node_in_project(project_id, node_id)?;
        let counts = RoleCounts::load(&self.store, node.cluster_id)?;
        policy::assert_deletable(node.spec.role, counts)?;
        let cluster = self.cluster_in_project(project_id, node.cluster_id)?;

        let lease = self.lease_cluster(cluster.id, OperationType::DeleteNode, Some(node.id))?;
        info!(cluster_id = cluster.id, node = %node.spec.name, "handing delete-node to operator");
        let started = self.operator.delete_node(&cluster, &node, &lease);
        self.hand_off(&lease, started)
    }

    /// Removes the `role` duty from `node_id` in the background.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::Policy`] when the role cannot be removed
    /// and [`ProvisionError::Conflict`] when the cluster is busy.
    pub fn delete_node_role(
        &self,
        project_id: ProjectId,
        node_id: NodeId,
        role: RoleKind,
    ) -> Result<OperationHandle, ProvisionError> {
        let node = self.node_in_project(project_id, node_id)?;
        let counts = RoleCounts::load(&self.store, node.cluster_id)?;
        policy::assert_role_deletable(node.spec.role, role, counts)?;
        let cluster = self.cluster_in_project(project_id, node.cluster_id)?;

        let lease =
            self.lease_cluster(cluster.id, OperationType::DeleteNodeRole, Some(node.id))?;
        info!(
            cluster_id = cluster.id,
            node = %node.spec.name,
            role = %role,
            "handing delete-node-role to operator"
        );
        let started = self.operator.delete_node_role(&cluster, &node, role, &lease);
        self.hand_off(&lease, started)
    }
}
