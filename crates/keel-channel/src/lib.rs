//! Credential channel for keel
//!
//! The channel is a durable key-value object store that both node roles can
//! reach without talking to each other: the control plane writes the join
//! token and admin bundle into it, and every worker reads the token back out.
//! It knows nothing about clusters; it moves opaque blobs under string keys.
//!
//! Contract every implementation upholds:
//! - `put` is atomic per object. A concurrent `get` sees either the old blob,
//!   no blob, or the complete new blob, never a partial write.
//! - Read-after-write: once `put(k, v)` returns `Ok`, every later `get(k)`
//!   returns `v` until the next `put(k, ..)`.
//!
//! # Modules
//!
//! - [`memory`] - concurrent in-memory store with fault injection
//! - [`fs`] - shared-directory store using temp-file + rename
//! - [`s3`] - S3 bucket accessed through the `aws` CLI
//! - [`access`] - least-privilege wrapper enforcing per-principal grants

#![deny(missing_docs)]

pub mod access;
pub mod fs;
pub mod memory;
pub mod s3;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

pub use access::{Access, AccessControlledChannel, ChannelPolicy, Principal};
pub use fs::FsChannel;
pub use memory::InMemoryChannel;
pub use s3::S3Channel;

/// Errors returned by credential channel operations
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    /// No object exists under the key (yet)
    #[error("{key}: not found")]
    NotFound {
        /// Requested key
        key: String,
    },

    /// The caller's identity is not allowed to perform the operation
    #[error("{key}: access denied: {message}")]
    AccessDenied {
        /// Requested key
        key: String,
        /// Description from the store
        message: String,
    },

    /// The store could not be reached or failed the request
    #[error("{key}: store unavailable: {message}")]
    Unavailable {
        /// Requested key
        key: String,
        /// Description of the failure
        message: String,
    },

    /// The key cannot be used with this store
    #[error("invalid channel key '{key}': {message}")]
    InvalidKey {
        /// Rejected key
        key: String,
        /// Why it was rejected
        message: String,
    },
}

impl ChannelError {
    /// Create a not-found error
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    /// Create an access-denied error
    pub fn access_denied(key: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::AccessDenied {
            key: key.into(),
            message: msg.into(),
        }
    }

    /// Create an unavailable error
    pub fn unavailable(key: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Unavailable {
            key: key.into(),
            message: msg.into(),
        }
    }

    /// Key the error refers to
    pub fn key(&self) -> &str {
        match self {
            Self::NotFound { key }
            | Self::AccessDenied { key, .. }
            | Self::Unavailable { key, .. }
            | Self::InvalidKey { key, .. } => key,
        }
    }

    /// Whether the store itself may recover (only `Unavailable`)
    ///
    /// `NotFound` is not a store failure; whether to keep polling for a key
    /// is the reader's decision.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

impl From<ChannelError> for keel_common::Error {
    fn from(err: ChannelError) -> Self {
        let retryable = err.is_retryable();
        keel_common::Error::channel(err.key().to_string(), err.to_string(), retryable)
    }
}

/// Durable key-value store shared by the control plane and workers
#[async_trait]
pub trait CredentialChannel: Send + Sync {
    /// Store `blob` under `key`, replacing any previous object atomically
    async fn put(&self, key: &str, blob: &[u8]) -> Result<(), ChannelError>;

    /// Read the object stored under `key`
    async fn get(&self, key: &str) -> Result<Vec<u8>, ChannelError>;

    /// Operator-facing reference to where `key` is stored (e.g. `s3://bucket/key`)
    fn locate(&self, key: &str) -> String;
}

#[async_trait]
impl<C: CredentialChannel + ?Sized> CredentialChannel for Arc<C> {
    async fn put(&self, key: &str, blob: &[u8]) -> Result<(), ChannelError> {
        (**self).put(key, blob).await
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, ChannelError> {
        (**self).get(key).await
    }

    fn locate(&self, key: &str) -> String {
        (**self).locate(key)
    }
}

/// Reject keys that could escape a store's namespace
///
/// Keys are flat names like `worker-token`; path separators and relative
/// components are refused so file- and bucket-backed stores stay confined.
pub fn validate_key(key: &str) -> Result<(), ChannelError> {
    let invalid = |message: &str| {
        Err(ChannelError::InvalidKey {
            key: key.to_string(),
            message: message.to_string(),
        })
    };

    if key.is_empty() {
        return invalid("key is empty");
    }
    if key.contains('/') || key.contains('\\') {
        return invalid("key must not contain path separators");
    }
    if key == "." || key == ".." || key.starts_with('.') {
        return invalid("key must not start with '.'");
    }
    if !key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return invalid("key may only contain [A-Za-z0-9._-]");
    }
    Ok(())
}
