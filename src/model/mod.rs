//! Cluster, node, and operation record types.
//!
//! These are the persisted shapes the orchestrator and reconciler read and
//! mutate through a [`crate::store::RecordStore`].

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

mod role;

pub use role::{NodeRole, RoleError, RoleKind};

/// Identifier of the project owning a cluster.
pub type ProjectId = u64;
/// Primary key of a cluster.
pub type ClusterId = u64;
/// Primary key of a node.
pub type NodeId = u64;
/// Primary key of an operation record.
pub type RecordId = u64;

/// Account credential used to reach a host over SSH.
#[derive(Clone, Deserialize, Eq, PartialEq, Serialize)]
#[serde(tag = "account_type")]
pub enum Credential {
    /// Username and password authentication.
    #[serde(rename = "accountPassword")]
    Password {
        /// Remote login.
        username: String,
        /// Remote password.
        password: String,
    },
    /// Key based authentication using an identity file on the control host.
    #[serde(rename = "publicKey")]
    PrivateKey {
        /// Remote login.
        username: String,
        /// Path to the private key passed to `ssh -i`.
        identity_file: String,
    },
}

impl Credential {
    /// Returns the remote login name.
    #[must_use]
    pub fn username(&self) -> &str {
        match self {
            Self::Password { username, .. } | Self::PrivateKey { username, .. } => username,
        }
    }

    /// Returns the account type tag.
    #[must_use]
    pub const fn account_type(&self) -> &'static str {
        match self {
            Self::Password { .. } => "accountPassword",
            Self::PrivateKey { .. } => "publicKey",
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password { username, .. } => formatter
                .debug_struct("Password")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Self::PrivateKey {
                username,
                identity_file,
            } => formatter
                .debug_struct("PrivateKey")
                .field("username", username)
                .field("identity_file", identity_file)
                .finish(),
        }
    }
}

/// Address and credential for one host.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct HostConnection {
    /// Hostname or IP address.
    pub host: String,
    /// SSH port.
    pub port: u16,
    /// Credential used to log in.
    pub credential: Credential,
}

/// Whether a node pre-existed or was provisioned by this system.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MembershipType {
    /// Freshly provisioned node that appears in the inventory.
    Inner,
    /// Pre-existing node used as the control host.
    Outer,
}

/// Operating status of a single node.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    /// A structural operation on this node is in flight.
    Operating,
    /// The last operation on this node failed.
    Failed,
    /// The node is part of a healthy cluster.
    Ready,
}

/// Node attributes supplied by a caller before the node is persisted.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct NodeSpec {
    /// Node name, unique within a cluster.
    pub name: String,
    /// Role combination.
    pub role: NodeRole,
    /// Hostname or IP address.
    pub host: String,
    /// SSH port.
    pub port: u16,
    /// Credential used to log in.
    pub credential: Credential,
    /// Inner or outer membership.
    pub membership: MembershipType,
}

impl NodeSpec {
    /// Connection details for this node.
    #[must_use]
    pub fn connection(&self) -> HostConnection {
        HostConnection {
            host: self.host.clone(),
            port: self.port,
            credential: self.credential.clone(),
        }
    }
}

/// A persisted cluster member.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Node {
    /// Primary key.
    pub id: NodeId,
    /// Owning project.
    pub project_id: ProjectId,
    /// Owning cluster.
    pub cluster_id: ClusterId,
    /// Caller supplied attributes.
    #[serde(flatten)]
    pub spec: NodeSpec,
    /// Operating status, when an operation touched the node.
    #[serde(default)]
    pub operating_status: Option<NodeStatus>,
    /// Last error reported for this node.
    #[serde(default)]
    pub error_msg: Option<String>,
}

/// Lifecycle status of a cluster.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterStatus {
    /// Registered after pre-flight checks, not yet installed.
    Created,
    /// A structural operation is in flight.
    Operating,
    /// Installed and waiting for the agent to connect.
    Disconnect,
    /// The last operation failed.
    Failed,
    /// Normal state after a node operation completed.
    Running,
}

/// Attributes of a cluster being registered.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ClusterDraft {
    /// Short code used to scope staging paths.
    pub code: String,
    /// Display name.
    pub name: String,
}

/// A persisted cluster.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Cluster {
    /// Primary key.
    pub id: ClusterId,
    /// Owning project.
    pub project_id: ProjectId,
    /// Short code used to scope staging paths.
    pub code: String,
    /// Display name.
    pub name: String,
    /// Lifecycle status.
    pub status: ClusterStatus,
}

/// Kind of structural operation tracked by an [`OperationRecord`].
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    /// Bulk bootstrap of a new cluster.
    InstallK8s,
    /// Join a node to an existing cluster.
    AddNode,
    /// Remove a node from a cluster.
    DeleteNode,
    /// Remove one role from a node.
    DeleteNodeRole,
}

impl OperationType {
    /// Wire value written to status snapshots.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InstallK8s => "install_k8s",
            Self::AddNode => "add_node",
            Self::DeleteNode => "delete_node",
            Self::DeleteNodeRole => "delete_node_role",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Status of an operation record.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    /// Remote work is still running.
    Operating,
    /// Remote work finished successfully.
    Success,
    /// Remote work failed.
    Failed,
}

impl OperationStatus {
    /// Returns `true` for [`Self::Success`] and [`Self::Failed`].
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Operating)
    }
}

/// Attributes of an operation record before insertion.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NewRecord {
    /// Cluster the operation targets.
    pub cluster_id: ClusterId,
    /// Operation kind.
    pub operation: OperationType,
    /// Node the operation targets, for node operations.
    pub node_id: Option<NodeId>,
    /// Role being removed, for role removal.
    pub removed_role: Option<RoleKind>,
}

impl NewRecord {
    /// Starts a record for `operation` on `cluster_id`.
    #[must_use]
    pub const fn new(cluster_id: ClusterId, operation: OperationType) -> Self {
        Self {
            cluster_id,
            operation,
            node_id: None,
            removed_role: None,
        }
    }

    /// Attaches the node the operation targets.
    #[must_use]
    pub const fn node(mut self, node_id: NodeId) -> Self {
        self.node_id = Some(node_id);
        self
    }

    /// Attaches the role being removed.
    #[must_use]
    pub const fn removed_role(mut self, kind: RoleKind) -> Self {
        self.removed_role = Some(kind);
        self
    }
}

/// Persisted handle for asynchronous remote work.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct OperationRecord {
    /// Primary key, also used to name the remote exit-code marker.
    pub id: RecordId,
    /// Cluster the operation targets.
    pub cluster_id: ClusterId,
    /// Operation kind.
    pub operation: OperationType,
    /// Current status.
    pub status: OperationStatus,
    /// Accumulated error text; only ever appended to.
    #[serde(default)]
    pub error_msg: String,
    /// Node the operation targets, for node operations.
    #[serde(default)]
    pub node_id: Option<NodeId>,
    /// Role being removed, for role removal.
    #[serde(default)]
    pub removed_role: Option<RoleKind>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl OperationRecord {
    /// Appends `text` to the error log, separating entries with a newline.
    pub fn append_error(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        if !self.error_msg.is_empty() {
            self.error_msg.push('\n');
        }
        self.error_msg.push_str(text);
    }
}
