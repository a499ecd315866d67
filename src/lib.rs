//! Core library for the `hoist` cluster provisioner.
//!
//! The crate drives Kubernetes installation and node membership changes on
//! hosts reached over SSH. Provisioning requests go through the
//! [`Provisioner`], which serializes structural work per cluster with a
//! key-value backed lock and starts detached playbooks on the cluster's
//! control host. The [`StatusReconciler`] later reads each playbook's
//! exit-code marker, settles the operation record, and releases the lock.

pub mod config;
pub mod inventory;
pub mod kv;
pub mod lock;
pub mod logging;
pub mod model;
pub mod operator;
pub mod orchestrator;
pub mod policy;
pub mod reconcile;
pub mod session;
pub mod store;
pub mod template;
pub mod test_support;

pub use config::{ConfigError, HoistConfig};
pub use kv::{DirKvStore, KvError, KvStore, MemoryKvStore};
pub use lock::{DistributedLock, LockError};
pub use model::{Cluster, Node, NodeRole, NodeSpec, OperationRecord, RoleKind};
pub use operator::{NodeOperator, PlaybookOperator};
pub use orchestrator::{ErrorKind, ProvisionError, Provisioner};
pub use reconcile::{Completion, OperationHandle, ReconcileLoop, StatusReconciler};
pub use session::{Connector, ProcessCommandRunner, SshConnector};
pub use store::{MemoryRecordStore, RecordStore, StoreError};
