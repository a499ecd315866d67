//! Node role combinations.
//!
//! A node carries one or more of the master, etcd, and worker roles. The
//! persisted form is an additive bitmask (`master = 4`, `etcd = 2`,
//! `worker = 1`), but in memory the seven legal combinations are a closed
//! enum so an empty role cannot be represented.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single role a node can hold.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleKind {
    /// Control-plane node.
    Master,
    /// Member of the etcd quorum.
    Etcd,
    /// Node that schedules workloads.
    Worker,
}

impl RoleKind {
    /// All kinds in the order checks are applied.
    pub const ALL: [Self; 3] = [Self::Master, Self::Worker, Self::Etcd];

    /// Bit contributed by this kind to the persisted bitmask.
    #[must_use]
    pub const fn bit(self) -> u8 {
        match self {
            Self::Master => 4,
            Self::Etcd => 2,
            Self::Worker => 1,
        }
    }

    /// Lowercase label used in logs and error messages.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Master => "master",
            Self::Etcd => "etcd",
            Self::Worker => "worker",
        }
    }
}

impl fmt::Display for RoleKind {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

impl FromStr for RoleKind {
    type Err = RoleError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "master" => Ok(Self::Master),
            "etcd" => Ok(Self::Etcd),
            "worker" => Ok(Self::Worker),
            other => Err(RoleError::UnknownKind(other.to_owned())),
        }
    }
}

/// Errors raised when decoding roles.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RoleError {
    /// Raised when a bitmask is zero or has bits outside `0b111`.
    #[error("invalid node role bitmask {0}; expected a value between 1 and 7")]
    InvalidBits(u8),
    /// Raised when a role name is not recognised.
    #[error("unknown node role `{0}`")]
    UnknownKind(String),
}

/// Every non-empty combination of roles.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum NodeRole {
    /// `1`
    Worker,
    /// `2`
    Etcd,
    /// `3`
    EtcdWorker,
    /// `4`
    Master,
    /// `5`
    MasterWorker,
    /// `6`
    MasterEtcd,
    /// `7`
    MasterEtcdWorker,
}

impl NodeRole {
    /// All combinations in bitmask order.
    pub const ALL: [Self; 7] = [
        Self::Worker,
        Self::Etcd,
        Self::EtcdWorker,
        Self::Master,
        Self::MasterWorker,
        Self::MasterEtcd,
        Self::MasterEtcdWorker,
    ];

    /// Decodes a persisted bitmask.
    ///
    /// # Errors
    ///
    /// Returns [`RoleError::InvalidBits`] for `0` or values above `7`.
    pub const fn from_bits(bits: u8) -> Result<Self, RoleError> {
        match bits {
            1 => Ok(Self::Worker),
            2 => Ok(Self::Etcd),
            3 => Ok(Self::EtcdWorker),
            4 => Ok(Self::Master),
            5 => Ok(Self::MasterWorker),
            6 => Ok(Self::MasterEtcd),
            7 => Ok(Self::MasterEtcdWorker),
            other => Err(RoleError::InvalidBits(other)),
        }
    }

    /// Returns the persisted bitmask.
    #[must_use]
    pub const fn bits(self) -> u8 {
        match self {
            Self::Worker => 1,
            Self::Etcd => 2,
            Self::EtcdWorker => 3,
            Self::Master => 4,
            Self::MasterWorker => 5,
            Self::MasterEtcd => 6,
            Self::MasterEtcdWorker => 7,
        }
    }

    /// Returns `true` when the combination includes `kind`.
    #[must_use]
    pub const fn has(self, kind: RoleKind) -> bool {
        self.bits() & kind.bit() != 0
    }

    /// Returns `true` when the combination includes the master role.
    #[must_use]
    pub const fn has_master(self) -> bool {
        self.has(RoleKind::Master)
    }

    /// Returns `true` when the combination includes the etcd role.
    #[must_use]
    pub const fn has_etcd(self) -> bool {
        self.has(RoleKind::Etcd)
    }

    /// Returns `true` when the combination includes the worker role.
    #[must_use]
    pub const fn has_worker(self) -> bool {
        self.has(RoleKind::Worker)
    }

    /// Removes `kind`, returning `None` when nothing would remain.
    #[must_use]
    pub fn without(self, kind: RoleKind) -> Option<Self> {
        Self::from_bits(self.bits() & !kind.bit()).ok()
    }

    /// Adds `kind` to the combination.
    #[must_use]
    pub fn with(self, kind: RoleKind) -> Self {
        Self::from_bits(self.bits() | kind.bit()).unwrap_or(self)
    }

    /// Iterates over the single roles held by this combination.
    pub fn kinds(self) -> impl Iterator<Item = RoleKind> {
        RoleKind::ALL.into_iter().filter(move |kind| self.has(*kind))
    }

    /// Every combination that includes `kind`.
    ///
    /// This is the role set used when counting holders of a role.
    #[must_use]
    pub fn holders_of(kind: RoleKind) -> Vec<Self> {
        Self::ALL
            .into_iter()
            .filter(|role| role.has(kind))
            .collect()
    }
}

impl From<RoleKind> for NodeRole {
    fn from(kind: RoleKind) -> Self {
        match kind {
            RoleKind::Master => Self::Master,
            RoleKind::Etcd => Self::Etcd,
            RoleKind::Worker => Self::Worker,
        }
    }
}

impl From<NodeRole> for u8 {
    fn from(role: NodeRole) -> Self {
        role.bits()
    }
}

impl TryFrom<u8> for NodeRole {
    type Error = RoleError;

    fn try_from(bits: u8) -> Result<Self, Self::Error> {
        Self::from_bits(bits)
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let labels = self.kinds().map(RoleKind::as_str).collect::<Vec<_>>();
        write!(formatter, "{}", labels.join("+"))
    }
}
