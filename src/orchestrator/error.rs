//! Errors surfaced to callers of the provisioning operations.

use thiserror::Error;

use crate::inventory::InventoryError;
use crate::lock::LockError;
use crate::model::ClusterId;
use crate::policy::PolicyError;
use crate::session::SessionError;
use crate::store::StoreError;
use crate::template::TemplateError;

/// Code reported when a cluster already runs a structural operation.
pub const CLUSTER_OPERATING_CODE: &str = "error.cluster.status.is.operating";

/// Coarse classification callers use to map errors onto responses.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ErrorKind {
    /// The request was rejected before any side effect.
    Validation,
    /// Another operation holds the cluster.
    Conflict,
    /// A host could not be reached or a transfer failed.
    Transport,
    /// A remote command ran and reported failure.
    Remote,
    /// Persisted state contradicts itself.
    InconsistentState,
    /// A local collaborator failed.
    Internal,
}

/// Errors raised by [`super::Provisioner`] and node operators.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ProvisionError {
    /// Raised when the request is malformed or refers to foreign resources.
    #[error("{message}")]
    Validation {
        /// Stable code.
        code: &'static str,
        /// Human-readable detail.
        message: String,
    },
    /// Raised when the cluster lock is already held.
    #[error("cluster {cluster_id} is operating; try again later")]
    Conflict {
        /// Cluster whose lock was busy.
        cluster_id: ClusterId,
    },
    /// Raised when the control host cannot be reached.
    #[error("Failed to connect to host: [ {host} ] by ssh")]
    Connect {
        /// Host that refused the session.
        host: String,
        /// Underlying transport error.
        #[source]
        source: SessionError,
    },
    /// Raised when the container runtime cannot be installed.
    #[error("Failed to install docker on host: [ {host} ],error is :{stderr}")]
    ContainerRuntime {
        /// Host the install ran on.
        host: String,
        /// Captured standard error.
        stderr: String,
    },
    /// Raised on any other transport fault.
    #[error(transparent)]
    Transport(#[from] SessionError),
    /// Raised when a remote step exits non-zero.
    #[error("{stdout}\n{stderr}")]
    Remote {
        /// Step that failed.
        step: String,
        /// Captured standard output.
        stdout: String,
        /// Captured standard error.
        stderr: String,
    },
    /// Raised when persisted rows are missing or contradict each other.
    #[error("inconsistent state: {what}")]
    InconsistentState {
        /// Description of the contradiction.
        what: String,
    },
    /// Raised when a quorum rule rejects the request.
    #[error(transparent)]
    Policy(#[from] PolicyError),
    /// Raised when the inventory cannot be rendered.
    #[error(transparent)]
    Inventory(#[from] InventoryError),
    /// Raised when a template override cannot be loaded.
    #[error(transparent)]
    Template(#[from] TemplateError),
    /// Raised when the record store fails.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Raised when the lock store fails.
    #[error(transparent)]
    Lock(#[from] LockError),
}

impl ProvisionError {
    /// Validation error with a stable code.
    #[must_use]
    pub fn validation(code: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            code,
            message: message.into(),
        }
    }

    /// Stable string code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Validation { code, .. } => *code,
            Self::Conflict { .. } => CLUSTER_OPERATING_CODE,
            Self::Connect { .. } => "error.host.connect.failed",
            Self::ContainerRuntime { .. } => "error.docker.install.failed",
            Self::Transport(_) => "error.ssh.transport",
            Self::Remote { .. } => "error.remote.command.failed",
            Self::InconsistentState { .. } => "error.inconsistent.state",
            Self::Policy(policy) => policy.code(),
            Self::Inventory(_) => "error.inventory.render",
            Self::Template(_) => "error.template.load",
            Self::Store(_) => "error.record.store",
            Self::Lock(_) => "error.lock.store",
        }
    }

    /// Coarse classification.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } | Self::Policy(_) | Self::Inventory(_) => {
                ErrorKind::Validation
            }
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::Connect { .. } | Self::Transport(_) => ErrorKind::Transport,
            Self::ContainerRuntime { .. } | Self::Remote { .. } => ErrorKind::Remote,
            Self::InconsistentState { .. } => ErrorKind::InconsistentState,
            Self::Template(_) | Self::Store(_) | Self::Lock(_) => ErrorKind::Internal,
        }
    }
}
