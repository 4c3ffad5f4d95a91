//! Cluster runtime seam
//!
//! The bootstrappers never shell out themselves; everything they need from the
//! cluster software on the instance goes through [`ClusterRuntime`]. The
//! production implementation is [`crate::k0s::K0sRuntime`]; tests drive the
//! state machines with mocks and in-process fakes.

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

use keel_common::credentials::{AdminCredentialBundle, JoinToken, JoinTokenRequest};

/// Role an instance plays in the cluster
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeRole {
    /// The single control-plane member
    Controller,
    /// A worker
    Worker,
}

impl NodeRole {
    /// Role name as used in logs and errors
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Controller => "controller",
            Self::Worker => "worker",
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failures reported by the cluster runtime
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RuntimeError {
    /// Installing the runtime software failed
    #[error("install failed for {role}: {message}")]
    Install {
        /// Role being installed
        role: NodeRole,
        /// Description of what failed
        message: String,
    },

    /// The control plane did not come up
    #[error("control plane did not start: {0}")]
    Start(String),

    /// Minting a join token failed
    #[error("token create failed: {0}")]
    TokenCreate(String),

    /// The admin credential bundle could not be read
    #[error("admin credentials unavailable: {0}")]
    AdminCredentials(String),

    /// The join API refused the token because its validity window elapsed
    #[error("join token expired: {0}")]
    TokenExpired(String),

    /// The join API refused the token for any other reason
    #[error("join rejected: {0}")]
    JoinRejected(String),
}

impl From<RuntimeError> for keel_common::Error {
    fn from(err: RuntimeError) -> Self {
        use keel_common::Error;
        match err {
            RuntimeError::Install { role, message } => Error::runtime_install(role.as_str(), message),
            RuntimeError::Start(msg) => Error::control_plane_start(msg),
            RuntimeError::TokenCreate(msg) => Error::token_mint(msg),
            RuntimeError::AdminCredentials(msg) => {
                Error::internal_with_context("admin_credentials", msg)
            }
            RuntimeError::TokenExpired(msg) => Error::token_expired(msg),
            RuntimeError::JoinRejected(msg) => Error::join_rejected(msg),
        }
    }
}

/// Cluster software on the local instance
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterRuntime: Send + Sync {
    /// Install the runtime software for `role`
    async fn install(&self, role: NodeRole) -> Result<(), RuntimeError>;

    /// Initialize and start the sole control-plane member
    ///
    /// Returns the address the control plane is reachable at once it is serving
    /// the join API.
    async fn start_controller(&self) -> Result<String, RuntimeError>;

    /// Mint a join token from the running control plane
    async fn create_join_token(&self, request: &JoinTokenRequest)
        -> Result<JoinToken, RuntimeError>;

    /// Read the cluster's administrative kubeconfig
    async fn admin_credentials(&self) -> Result<AdminCredentialBundle, RuntimeError>;

    /// Register this instance with the control plane as a worker
    async fn join_worker(&self, token: &JoinToken) -> Result<(), RuntimeError>;
}
