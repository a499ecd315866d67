//! Quorum rules for removing nodes and roles.
//!
//! A cluster must keep at least two holders of every role. Removing a whole
//! node and removing one role from a node are gated separately; the role
//! gate additionally restricts which role combinations may shed which role.

use serde::Serialize;
use thiserror::Error;

use crate::model::{ClusterId, NodeRole, RoleKind};
use crate::store::{RecordStore, StoreError};

/// Minimum number of holders each role must keep.
pub const MIN_ROLE_HOLDERS: u64 = 2;

/// Stable validation codes raised by the policy gates.
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
pub enum PolicyError {
    /// Removing the node would leave fewer than two masters.
    #[error("error.master.node.only.one")]
    MasterNodeOnlyOne,
    /// Removing the node would leave fewer than two workers.
    #[error("error.worker.node.only.one")]
    WorkerNodeOnlyOne,
    /// Removing the node would leave fewer than two etcd members.
    #[error("error.etcd.node.only.one")]
    EtcdNodeOnlyOne,
    /// The role cannot be removed from this node.
    #[error("error.delete.node.role.failed")]
    DeleteNodeRoleFailed,
}

impl PolicyError {
    /// Stable string code.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::MasterNodeOnlyOne => "error.master.node.only.one",
            Self::WorkerNodeOnlyOne => "error.worker.node.only.one",
            Self::EtcdNodeOnlyOne => "error.etcd.node.only.one",
            Self::DeleteNodeRoleFailed => "error.delete.node.role.failed",
        }
    }

    const fn only_one(kind: RoleKind) -> Self {
        match kind {
            RoleKind::Master => Self::MasterNodeOnlyOne,
            RoleKind::Worker => Self::WorkerNodeOnlyOne,
            RoleKind::Etcd => Self::EtcdNodeOnlyOne,
        }
    }
}

/// Number of nodes holding each role in a cluster.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RoleCounts {
    /// Nodes with the master role.
    pub master: u64,
    /// Nodes with the etcd role.
    pub etcd: u64,
    /// Nodes with the worker role.
    pub worker: u64,
}

impl RoleCounts {
    /// Counts role holders in `cluster_id`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store query fails.
    pub fn load<S: RecordStore + ?Sized>(
        store: &S,
        cluster_id: ClusterId,
    ) -> Result<Self, StoreError> {
        let count = |kind| store.count_by_role_set(cluster_id, &NodeRole::holders_of(kind));
        Ok(Self {
            master: count(RoleKind::Master)?,
            etcd: count(RoleKind::Etcd)?,
            worker: count(RoleKind::Worker)?,
        })
    }

    /// Holders of `kind`.
    #[must_use]
    pub const fn of(self, kind: RoleKind) -> u64 {
        match kind {
            RoleKind::Master => self.master,
            RoleKind::Etcd => self.etcd,
            RoleKind::Worker => self.worker,
        }
    }
}

/// Advisory answer to "may this node be deleted?", one flag per role.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteCheck {
    /// Master quorum survives the deletion.
    pub enable_delete_master: bool,
    /// Worker quorum survives the deletion.
    pub enable_delete_worker: bool,
    /// Etcd quorum survives the deletion.
    pub enable_delete_etcd: bool,
}

impl DeleteCheck {
    /// Returns `true` when every flag allows the deletion.
    #[must_use]
    pub const fn allows_all(self) -> bool {
        self.enable_delete_master && self.enable_delete_worker && self.enable_delete_etcd
    }
}

/// Advisory check: for each role the node holds, the flag is cleared when
/// fewer than two other holders would remain.
#[must_use]
pub const fn can_delete_node(role: NodeRole, counts: RoleCounts) -> DeleteCheck {
    const fn survives(role: NodeRole, kind: RoleKind, counts: RoleCounts) -> bool {
        !role.has(kind) || counts.of(kind).saturating_sub(1) >= MIN_ROLE_HOLDERS
    }
    DeleteCheck {
        enable_delete_master: survives(role, RoleKind::Master, counts),
        enable_delete_worker: survives(role, RoleKind::Worker, counts),
        enable_delete_etcd: survives(role, RoleKind::Etcd, counts),
    }
}

/// Authoritative gate for deleting a whole node.
///
/// Roles are checked in the order master, worker, etcd; the first role with
/// fewer than two holders, counting the node itself, fails.
///
/// # Errors
///
/// Returns the `*_NODE_ONLY_ONE` error of the first failing role.
pub fn assert_deletable(role: NodeRole, counts: RoleCounts) -> Result<(), PolicyError> {
    for kind in RoleKind::ALL {
        if role.has(kind) && counts.of(kind) < MIN_ROLE_HOLDERS {
            return Err(PolicyError::only_one(kind));
        }
    }
    Ok(())
}

/// Gate for removing one role from a node.
///
/// Worker removal is never allowed. Etcd and master removal are allowed
/// only from the combinations listed below, and only while at least two
/// holders of the role exist.
///
/// # Errors
///
/// Returns [`PolicyError::DeleteNodeRoleFailed`] on every rejection.
pub const fn assert_role_deletable(
    role: NodeRole,
    remove: RoleKind,
    counts: RoleCounts,
) -> Result<(), PolicyError> {
    let allowed = match remove {
        RoleKind::Worker => false,
        RoleKind::Etcd => matches!(
            role,
            NodeRole::EtcdWorker | NodeRole::MasterEtcdWorker | NodeRole::MasterEtcd
        ),
        RoleKind::Master => matches!(
            role,
            NodeRole::MasterEtcd
                | NodeRole::Master
                | NodeRole::MasterWorker
                | NodeRole::MasterEtcdWorker
        ),
    };
    if !allowed || counts.of(remove) < MIN_ROLE_HOLDERS {
        return Err(PolicyError::DeleteNodeRoleFailed);
    }
    Ok(())
}

#[cfg(test)]
mod tests;
