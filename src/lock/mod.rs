//! Cluster-scoped mutual exclusion over a [`KvStore`].
//!
//! A structural operation holds `cluster-lock-{id}` from the moment it is
//! accepted until the reconciler finalizes its record, which may happen in
//! another process. Locks are never renewed; the TTL is the only recovery
//! path when a holder dies.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::kv::{KvError, KvStore};
use crate::model::{ClusterId, NodeId, OperationStatus, OperationType, ProjectId};

/// Key of the global reconciler sweep lock.
pub const SWEEP_LOCK_KEY: &str = "cluster-status-sync-lock";

/// Key of the per-cluster mutual-exclusion lock.
#[must_use]
pub fn lock_key(cluster_id: ClusterId) -> String {
    format!("cluster-lock-{cluster_id}")
}

/// Key of the per-cluster operating snapshot.
#[must_use]
pub fn operating_key(cluster_id: ClusterId) -> String {
    format!("cluster-operating-{cluster_id}")
}

/// Key for check-and-save progress when the caller has no token of its own.
#[must_use]
pub fn node_check_key(project_id: ProjectId, token: &str) -> String {
    format!("node-check-step-{project_id}-{token}")
}

/// Errors raised by the lock client.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum LockError {
    /// Raised when the backing store fails.
    #[error(transparent)]
    Store(#[from] KvError),
    /// Raised when a snapshot cannot be encoded or decoded.
    #[error("invalid operating snapshot for cluster {cluster_id}: {message}")]
    Snapshot {
        /// Cluster whose snapshot failed.
        cluster_id: ClusterId,
        /// Serializer error string.
        message: String,
    },
}

/// Status of the structural operation currently running on a cluster.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationSnapshot {
    /// Cluster being operated on.
    pub cluster_id: ClusterId,
    /// Operation in flight.
    pub operating: OperationType,
    /// Node targeted by the operation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    /// Progress of the operation.
    pub status: OperationStatus,
}

impl OperationSnapshot {
    /// Snapshot of a freshly started operation.
    #[must_use]
    pub const fn operating(
        cluster_id: ClusterId,
        operating: OperationType,
        node_id: Option<NodeId>,
    ) -> Self {
        Self {
            cluster_id,
            operating,
            node_id,
            status: OperationStatus::Operating,
        }
    }
}

/// Lock held on behalf of one cluster operation.
///
/// A lease carries no release-on-drop behaviour: whoever owns it decides
/// when the lock ends, either through [`DistributedLock::release_lease`] or
/// by leaving it to the reconciler.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ClusterLease {
    /// Cluster the lease protects.
    pub cluster_id: ClusterId,
    /// Key of the lock entry.
    pub lock_key: String,
    /// Key of the operating snapshot.
    pub operating_key: String,
    /// Lifetime of the lock; snapshots written for the lease expire with
    /// the same TTL.
    pub ttl: Duration,
}

impl ClusterLease {
    /// Lease for `cluster_id` using the standard key formats.
    #[must_use]
    pub fn for_cluster(cluster_id: ClusterId, ttl: Duration) -> Self {
        Self {
            cluster_id,
            lock_key: lock_key(cluster_id),
            operating_key: operating_key(cluster_id),
            ttl,
        }
    }
}

/// Lock client over a shared store.
#[derive(Clone, Debug)]
pub struct DistributedLock<K: KvStore + Clone> {
    store: K,
}

impl<K: KvStore + Clone> DistributedLock<K> {
    /// Creates a client over `store`.
    #[must_use]
    pub const fn new(store: K) -> Self {
        Self { store }
    }

    /// Returns the underlying store.
    #[must_use]
    pub const fn store(&self) -> &K {
        &self.store
    }

    /// Attempts to take `key` for `ttl`.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Store`] when the store is unreachable.
    pub fn try_acquire(&self, key: &str, ttl: Duration) -> Result<bool, LockError> {
        let token = Uuid::new_v4().to_string();
        let acquired = self.store.set_if_absent(key, &token, ttl)?;
        if acquired {
            debug!(key, ttl_secs = ttl.as_secs(), "lock acquired");
        } else {
            debug!(key, "lock busy");
        }
        Ok(acquired)
    }

    /// Releases `key` unconditionally.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Store`] when the store is unreachable.
    pub fn release(&self, key: &str) -> Result<(), LockError> {
        self.store.delete(key)?;
        debug!(key, "lock released");
        Ok(())
    }

    /// Takes `key` and returns a guard releasing it on drop, or `None` when
    /// the lock is held elsewhere.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Store`] when the store is unreachable.
    pub fn acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockGuard<K>>, LockError> {
        if !self.try_acquire(key, ttl)? {
            return Ok(None);
        }
        Ok(Some(LockGuard {
            store: self.store.clone(),
            key: key.to_owned(),
            ttl,
            armed: true,
        }))
    }

    /// Writes the operating snapshot for `snapshot.cluster_id`.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Snapshot`] when encoding fails and
    /// [`LockError::Store`] when the write fails.
    pub fn write_snapshot(
        &self,
        snapshot: &OperationSnapshot,
        ttl: Option<Duration>,
    ) -> Result<(), LockError> {
        let encoded = serde_json::to_string(snapshot).map_err(|err| LockError::Snapshot {
            cluster_id: snapshot.cluster_id,
            message: err.to_string(),
        })?;
        self.store
            .set(&operating_key(snapshot.cluster_id), &encoded, ttl)?;
        Ok(())
    }

    /// Reads the operating snapshot of `cluster_id`.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Snapshot`] when the stored value is not a
    /// snapshot.
    pub fn read_snapshot(
        &self,
        cluster_id: ClusterId,
    ) -> Result<Option<OperationSnapshot>, LockError> {
        let Some(raw) = self.store.get(&operating_key(cluster_id))? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|err| LockError::Snapshot {
                cluster_id,
                message: err.to_string(),
            })
    }

    /// Drops both the lock and the snapshot of a lease.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Store`] when either delete fails; the lock is
    /// still attempted when the snapshot delete fails.
    pub fn release_lease(&self, lease: &ClusterLease) -> Result<(), LockError> {
        let snapshot = self.store.delete(&lease.operating_key);
        self.release(&lease.lock_key)?;
        snapshot?;
        info!(cluster_id = lease.cluster_id, "cluster lease released");
        Ok(())
    }

    /// Releases the lock of `lease` and records the terminal `status` in its
    /// snapshot, keeping whatever operation details were stored. The final
    /// snapshot expires after the lease TTL.
    ///
    /// # Errors
    ///
    /// Returns [`LockError`] when the store fails.
    pub fn finish_lease(
        &self,
        lease: &ClusterLease,
        fallback: OperationSnapshot,
        status: OperationStatus,
    ) -> Result<(), LockError> {
        let previous = match self.read_snapshot(lease.cluster_id) {
            Ok(found) => found,
            Err(err) => {
                warn!(
                    cluster_id = lease.cluster_id,
                    error = %err,
                    "discarding unreadable snapshot"
                );
                None
            }
        };
        let snapshot = OperationSnapshot {
            status,
            ..previous.unwrap_or(fallback)
        };
        self.write_snapshot(&snapshot, Some(lease.ttl))?;
        self.release(&lease.lock_key)?;
        info!(
            cluster_id = lease.cluster_id,
            status = ?status,
            "cluster lease finished"
        );
        Ok(())
    }
}

/// Releases its key when dropped unless handed off with
/// [`LockGuard::into_lease`] or [`LockGuard::disarm`].
#[derive(Debug)]
pub struct LockGuard<K: KvStore> {
    store: K,
    key: String,
    ttl: Duration,
    armed: bool,
}

impl<K: KvStore> LockGuard<K> {
    /// Key held by this guard.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Releases now, reporting any failure.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Store`] when the delete fails.
    pub fn release(mut self) -> Result<(), LockError> {
        self.armed = false;
        self.store.delete(&self.key)?;
        debug!(key = %self.key, "lock released");
        Ok(())
    }

    /// Stops the guard from releasing on drop. The entry then lives until
    /// its TTL elapses or someone deletes it.
    pub fn disarm(mut self) {
        self.armed = false;
    }

    /// Converts a cluster lock guard into a lease whose release belongs to
    /// the caller.
    #[must_use]
    pub fn into_lease(mut self, cluster_id: ClusterId) -> ClusterLease {
        self.armed = false;
        ClusterLease {
            cluster_id,
            lock_key: self.key.clone(),
            operating_key: operating_key(cluster_id),
            ttl: self.ttl,
        }
    }
}

impl<K: KvStore> Drop for LockGuard<K> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match self.store.delete(&self.key) {
            Ok(_) => debug!(key = %self.key, "lock released"),
            Err(err) => warn!(key = %self.key, error = %err, "failed to release lock"),
        }
    }
}
