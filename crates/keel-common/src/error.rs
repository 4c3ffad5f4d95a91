//! Error types for keel
//!
//! Errors are structured with fields to aid debugging on a booting instance,
//! where the console log is often the only thing an operator gets to see.
//! Every variant maps to a [`FailureScope`] so callers can tell an instance-local
//! boot failure from one that leaves the whole cluster unable to scale.

use std::time::Duration;

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// How far the damage of an error reaches
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureScope {
    /// The instance fails its boot; other instances are unaffected
    Instance,
    /// The cluster is up but cannot add workers; operator must be told
    Cluster,
    /// Expected to clear on its own; retried with backoff
    Transient,
}

/// Main error type for keel operations
#[derive(Debug, Error)]
pub enum Error {
    /// Installing the cluster runtime on an instance failed
    #[error("runtime install failed on {node}: {message}")]
    RuntimeInstall {
        /// Role of the node that failed ("controller" or "worker")
        node: String,
        /// Description of what failed
        message: String,
    },

    /// The local control plane could not be initialized or started
    #[error("control plane failed to start: {message}")]
    ControlPlaneStart {
        /// Description of what failed
        message: String,
    },

    /// The control plane refused or failed to mint a join token
    #[error("join token creation failed: {message}")]
    TokenMint {
        /// Description of what failed
        message: String,
    },

    /// Writing a credential into the channel failed
    #[error("failed to publish {key} to credential channel: {message}")]
    Publish {
        /// Channel key that could not be written
        key: String,
        /// Description of what failed
        message: String,
    },

    /// The join token never became readable within the fetch deadline
    #[error("timed out after {waited:?} waiting for {key}: {last_error}")]
    TokenFetchTimeout {
        /// Channel key being polled
        key: String,
        /// How long the worker waited
        waited: Duration,
        /// The last error observed before giving up
        last_error: String,
    },

    /// The join token's validity window elapsed before it was used
    #[error("join token expired: {message}")]
    TokenExpired {
        /// Description from the control plane
        message: String,
    },

    /// The control plane rejected the join request
    #[error("join rejected by control plane: {message}")]
    JoinRejected {
        /// Description from the control plane
        message: String,
    },

    /// Credential channel error outside of publish/fetch-deadline handling
    #[error("credential channel error on {key}: {message}")]
    Channel {
        /// Channel key involved
        key: String,
        /// Description of what failed
        message: String,
        /// Whether this error is expected to clear on retry
        retryable: bool,
    },

    /// A credential read from the channel is unusable
    #[error("invalid credential in {key}: {message}")]
    InvalidCredential {
        /// Channel key the credential was read from
        key: String,
        /// Description of what is wrong with it
        message: String,
    },

    /// Configuration rejected before provisioning
    #[error("validation error: {message}")]
    Validation {
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "workerMinCapacity")
        field: Option<String>,
    },

    /// Infrastructure provider error
    #[error("provider error [{provider}]: {message}")]
    Provider {
        /// Provider that failed
        provider: String,
        /// Description of what failed
        message: String,
        /// Whether this error is retryable
        retryable: bool,
    },

    /// Worker fleet management error
    #[error("fleet error: {message}")]
    Fleet {
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The document kind being processed (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred
        context: String,
    },
}

impl Error {
    /// Create a runtime install error for a node role
    pub fn runtime_install(node: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::RuntimeInstall {
            node: node.into(),
            message: msg.into(),
        }
    }

    /// Create a control-plane start error
    pub fn control_plane_start(msg: impl Into<String>) -> Self {
        Self::ControlPlaneStart {
            message: msg.into(),
        }
    }

    /// Create a token mint error
    pub fn token_mint(msg: impl Into<String>) -> Self {
        Self::TokenMint {
            message: msg.into(),
        }
    }

    /// Create a publish error for a channel key
    pub fn publish(key: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Publish {
            key: key.into(),
            message: msg.into(),
        }
    }

    /// Create a token fetch timeout error
    pub fn token_fetch_timeout(
        key: impl Into<String>,
        waited: Duration,
        last_error: impl Into<String>,
    ) -> Self {
        Self::TokenFetchTimeout {
            key: key.into(),
            waited,
            last_error: last_error.into(),
        }
    }

    /// Create a token expired error
    pub fn token_expired(msg: impl Into<String>) -> Self {
        Self::TokenExpired {
            message: msg.into(),
        }
    }

    /// Create a join rejected error
    pub fn join_rejected(msg: impl Into<String>) -> Self {
        Self::JoinRejected {
            message: msg.into(),
        }
    }

    /// Create a channel error
    pub fn channel(key: impl Into<String>, msg: impl Into<String>, retryable: bool) -> Self {
        Self::Channel {
            key: key.into(),
            message: msg.into(),
            retryable,
        }
    }

    /// Create an invalid credential error
    pub fn invalid_credential(key: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::InvalidCredential {
            key: key.into(),
            message: msg.into(),
        }
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with a field path
    pub fn validation_for_field(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a provider error with the given message
    pub fn provider(provider: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create a non-retryable provider error (e.g., configuration error)
    pub fn provider_permanent(provider: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: msg.into(),
            retryable: false,
        }
    }

    /// Create a fleet error
    pub fn fleet(msg: impl Into<String>) -> Self {
        Self::Fleet {
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with document kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// How far this failure reaches
    pub fn scope(&self) -> FailureScope {
        match self {
            Self::RuntimeInstall { .. }
            | Self::ControlPlaneStart { .. }
            | Self::TokenFetchTimeout { .. }
            | Self::TokenExpired { .. }
            | Self::JoinRejected { .. }
            | Self::InvalidCredential { .. } => FailureScope::Instance,
            Self::TokenMint { .. }
            | Self::Publish { .. }
            | Self::Validation { .. }
            | Self::Fleet { .. }
            | Self::Serialization { .. }
            | Self::Internal { .. } => FailureScope::Cluster,
            Self::Channel { retryable, .. } | Self::Provider { retryable, .. } => {
                if *retryable {
                    FailureScope::Transient
                } else {
                    FailureScope::Instance
                }
            }
        }
    }

    /// Whether this error is expected to clear on retry
    pub fn is_retryable(&self) -> bool {
        self.scope() == FailureScope::Transient
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Self::serialization_for_kind("yaml", err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization_for_kind("json", err.to_string())
    }
}
