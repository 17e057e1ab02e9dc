//! Crate-wide error type.
//!
//! Subsystems carry their own error enums ([`crate::ssh::SshError`],
//! [`crate::broker::BrokerError`], [`crate::cloud::CloudError`],
//! [`crate::store::StoreError`]); this module rolls them up together with
//! the provisioning-specific failure kinds the services react to.

use thiserror::Error;

use crate::broker::BrokerError;
use crate::cloud::CloudError;
use crate::ssh::SshError;
use crate::store::StoreError;

/// Errors surfaced by the provisioning core.
#[derive(Error, Debug)]
pub enum Error {
    /// The broker reported a VM in `FAILED` status.
    #[error("Failed to create a vm (status={status}, cause='{cause}')")]
    VmCreation { status: String, cause: String },

    /// A created VM came back without the IP the service type requires.
    #[error("Failed to create a vm (status={status}, cause='unbounded {kind}-ip')")]
    VmUnboundedIp {
        status: String,
        kind: &'static str,
    },

    /// A VM descriptor did not match any staged machine.
    #[error("Can't be found a machine by name '{0}'")]
    UnknownMachine(String),

    /// `kubeadm init` did not report success on the leader.
    #[error("Failed to initialize control-plane. ({0})")]
    ControlPlaneInit(String),

    /// `kubeadm token create` printed nothing.
    #[error("join command is empty")]
    JoinTokenEmpty,

    /// A node's join command did not produce the kubeadm success marker.
    #[error("Failed to join '{node}'. (cause='{cause}')")]
    JoinFailed { node: String, cause: String },

    /// A kubectl invocation on the leader failed.
    #[error("Failed to kubectl. (command='{command}')")]
    KubectlFailed { command: String },

    #[error("Could not be found a cluster '{cluster}'. (namespace={namespace})")]
    ClusterNotFound { namespace: String, cluster: String },

    #[error("Could not be found a node '{node}' (namespace={namespace}, cluster={cluster})")]
    NodeNotFound {
        namespace: String,
        cluster: String,
        node: String,
    },

    /// Deleting the control-plane leader is always refused.
    #[error("Could not be delete a control-plane leader node.")]
    RemoveLeader,

    /// Request-level validation failure (wrong phase, connection
    /// mismatch, duplicate cluster, ...).
    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Ssh(#[from] SshError),

    #[error(transparent)]
    Cloud(#[from] CloudError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Error {
    /// Whether this error came from the store's compare-and-swap check.
    #[must_use]
    pub fn is_store_conflict(&self) -> bool {
        matches!(self, Self::Store(StoreError::Conflict { .. }))
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
