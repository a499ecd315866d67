//! Persistence contract for clusters, nodes, and operation records.
//!
//! Updates take selective patches: a `None` field leaves the stored value
//! untouched. Operation record errors can only be appended.

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::model::{
    Cluster, ClusterDraft, ClusterId, ClusterStatus, MembershipType, NewRecord, Node, NodeId,
    NodeRole, NodeSpec, NodeStatus, OperationRecord, OperationStatus, OperationType, ProjectId,
    RecordId,
};

mod memory;

pub use memory::MemoryRecordStore;

/// Errors raised by record stores.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum StoreError {
    /// Raised when an update or delete targets a missing row.
    #[error("{entity} {id} does not exist")]
    NotFound {
        /// Kind of row.
        entity: &'static str,
        /// Requested primary key.
        id: u64,
    },
    /// Raised when an insert did not store the row.
    #[error("failed to store {entity}: {message}")]
    NotStored {
        /// Kind of row.
        entity: &'static str,
        /// Why the row was rejected.
        message: String,
    },
    /// Raised when a snapshot file cannot be read or written.
    #[error("record snapshot I/O failed for {path}: {message}")]
    Io {
        /// Path that failed.
        path: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
    /// Raised when a snapshot file cannot be decoded.
    #[error("corrupt record snapshot {path}: {message}")]
    Corrupt {
        /// Path that failed.
        path: Utf8PathBuf,
        /// Decoder error string.
        message: String,
    },
}

/// Selective update of a cluster.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ClusterPatch {
    /// New lifecycle status.
    pub status: Option<ClusterStatus>,
}

impl ClusterPatch {
    /// Patch setting only the status.
    #[must_use]
    pub const fn status(status: ClusterStatus) -> Self {
        Self {
            status: Some(status),
        }
    }
}

/// Selective update of a node.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct NodePatch {
    /// New role combination.
    pub role: Option<NodeRole>,
    /// New operating status.
    pub operating_status: Option<NodeStatus>,
    /// New error message; an empty string clears it.
    pub error_msg: Option<String>,
}

/// Selective update of an operation record.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RecordPatch {
    /// New status.
    pub status: Option<OperationStatus>,
    /// Text appended to the error log.
    pub append_error: Option<String>,
}

impl RecordPatch {
    /// Patch setting only the status.
    #[must_use]
    pub const fn status(status: OperationStatus) -> Self {
        Self {
            status: Some(status),
            append_error: None,
        }
    }

    /// Patch setting the status and appending `error`.
    #[must_use]
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: Some(OperationStatus::Failed),
            append_error: Some(error.into()),
        }
    }
}

/// Node selection by example; unset fields match everything.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct NodeFilter {
    /// Owning cluster.
    pub cluster_id: Option<ClusterId>,
    /// Exact node name.
    pub name: Option<String>,
    /// Membership type.
    pub membership: Option<MembershipType>,
}

impl NodeFilter {
    /// Matches every node of `cluster_id`.
    #[must_use]
    pub const fn cluster(cluster_id: ClusterId) -> Self {
        Self {
            cluster_id: Some(cluster_id),
            name: None,
            membership: None,
        }
    }

    /// Restricts the filter to `name`.
    #[must_use]
    pub fn named(mut self, name: &str) -> Self {
        self.name = Some(name.to_owned());
        self
    }

    /// Restricts the filter to `membership`.
    #[must_use]
    pub const fn membership(mut self, membership: MembershipType) -> Self {
        self.membership = Some(membership);
        self
    }

    /// Returns `true` when `node` satisfies every set field.
    #[must_use]
    pub fn matches(&self, node: &Node) -> bool {
        self.cluster_id.is_none_or(|id| node.cluster_id == id)
            && self.name.as_ref().is_none_or(|name| &node.spec.name == name)
            && self
                .membership
                .is_none_or(|membership| node.spec.membership == membership)
    }
}

/// Record selection by example; unset fields match everything.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RecordFilter {
    /// Target cluster.
    pub cluster_id: Option<ClusterId>,
    /// Record status.
    pub status: Option<OperationStatus>,
    /// Operation kind.
    pub operation: Option<OperationType>,
}

impl RecordFilter {
    /// Matches every record with `status`.
    #[must_use]
    pub const fn with_status(status: OperationStatus) -> Self {
        Self {
            cluster_id: None,
            status: Some(status),
            operation: None,
        }
    }

    /// Returns `true` when `record` satisfies every set field.
    #[must_use]
    pub fn matches(&self, record: &OperationRecord) -> bool {
        self.cluster_id.is_none_or(|id| record.cluster_id == id)
            && self.status.is_none_or(|status| record.status == status)
            && self
                .operation
                .is_none_or(|operation| record.operation == operation)
    }
}

/// Persistence contract used by the orchestrator and reconciler.
pub trait RecordStore: Send + Sync {
    /// Loads a cluster.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store fails.
    fn get_cluster(&self, id: ClusterId) -> Result<Option<Cluster>, StoreError>;

    /// Inserts a cluster owned by `project_id`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotStored`] when the row is rejected.
    fn insert_cluster(
        &self,
        project_id: ProjectId,
        draft: &ClusterDraft,
        status: ClusterStatus,
    ) -> Result<Cluster, StoreError>;

    /// Applies `patch` to a cluster.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when the cluster is missing.
    fn update_cluster(&self, id: ClusterId, patch: &ClusterPatch) -> Result<(), StoreError>;

    /// Loads a node.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store fails.
    fn get_node(&self, id: NodeId) -> Result<Option<Node>, StoreError>;

    /// Inserts one node.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotStored`] when the cluster already has a
    /// node with the same name.
    fn insert_node(
        &self,
        project_id: ProjectId,
        cluster_id: ClusterId,
        spec: NodeSpec,
    ) -> Result<Node, StoreError>;

    /// Inserts several nodes; either all are stored or none.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotStored`] when any node is rejected.
    fn insert_nodes(
        &self,
        project_id: ProjectId,
        cluster_id: ClusterId,
        specs: Vec<NodeSpec>,
    ) -> Result<Vec<Node>, StoreError>;

    /// Applies `patch` to a node.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when the node is missing.
    fn update_node(&self, id: NodeId, patch: &NodePatch) -> Result<(), StoreError>;

    /// Removes a node, returning `true` when it existed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store fails.
    fn delete_node(&self, id: NodeId) -> Result<bool, StoreError>;

    /// Lists nodes matching `filter`, in primary-key order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store fails.
    fn list_nodes(&self, filter: &NodeFilter) -> Result<Vec<Node>, StoreError>;

    /// Counts nodes of `cluster_id` whose role is in `roles`, whatever their
    /// membership.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store fails.
    fn count_by_role_set(&self, cluster_id: ClusterId, roles: &[NodeRole])
    -> Result<u64, StoreError>;

    /// Loads an operation record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store fails.
    fn get_record(&self, id: RecordId) -> Result<Option<OperationRecord>, StoreError>;

    /// Inserts an operation record with status `Operating`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotStored`] when the row is rejected.
    fn insert_record(&self, record: NewRecord) -> Result<OperationRecord, StoreError>;

    /// Applies `patch` to a record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when the record is missing.
    fn update_record(&self, id: RecordId, patch: &RecordPatch) -> Result<(), StoreError>;

    /// Removes a record, returning `true` when it existed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store fails.
    fn delete_record(&self, id: RecordId) -> Result<bool, StoreError>;

    /// Lists records matching `filter`, in primary-key order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store fails.
    fn list_records(&self, filter: &RecordFilter) -> Result<Vec<OperationRecord>, StoreError>;
}

/// Picks the host that drives playbooks for `cluster_id`: the first outer
/// node, or the first node when the cluster has no outer node.
///
/// # Errors
///
/// Returns [`StoreError`] when the node query fails.
pub fn control_node<S: RecordStore + ?Sized>(
    store: &S,
    cluster_id: ClusterId,
) -> Result<Option<Node>, StoreError> {
    let nodes = store.list_nodes(&NodeFilter::cluster(cluster_id))?;
    Ok(nodes
        .iter()
        .find(|node| node.spec.membership == MembershipType::Outer)
        .or_else(|| nodes.first())
        .cloned())
}

#[cfg(test)]
mod tests;
