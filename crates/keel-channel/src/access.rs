//! Least-privilege access to the credential channel
//!
//! The control plane may write the channel but has no reason to read it; the
//! workers may read it but must never be able to replace the token. The real
//! enforcement lives in the store's identity layer (instance roles); this
//! wrapper states the same policy in code so it can be handed to the
//! infrastructure provider and checked in tests.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::{ChannelError, CredentialChannel};

/// Identity acting on the channel
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Principal {
    /// The control-plane instance
    ControlPlane,
    /// Any worker instance
    Worker,
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ControlPlane => f.write_str("control-plane"),
            Self::Worker => f.write_str("worker"),
        }
    }
}

/// Permission level on the channel
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    /// `get` only
    Read,
    /// `put` only
    Write,
    /// `get` and `put`
    ReadWrite,
}

impl Access {
    /// Whether `get` is permitted
    pub fn can_read(self) -> bool {
        matches!(self, Self::Read | Self::ReadWrite)
    }

    /// Whether `put` is permitted
    pub fn can_write(self) -> bool {
        matches!(self, Self::Write | Self::ReadWrite)
    }
}

/// Grants of channel access per principal; anything not granted is denied
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChannelPolicy {
    grants: BTreeMap<Principal, Access>,
}

impl ChannelPolicy {
    /// Policy with no grants at all
    pub fn deny_all() -> Self {
        Self::default()
    }

    /// Control plane writes, workers read
    pub fn least_privilege() -> Self {
        Self::deny_all()
            .grant(Principal::ControlPlane, Access::Write)
            .grant(Principal::Worker, Access::Read)
    }

    /// Add or replace a grant
    pub fn grant(mut self, principal: Principal, access: Access) -> Self {
        self.grants.insert(principal, access);
        self
    }

    /// Access granted to `principal`, if any
    pub fn access_for(&self, principal: Principal) -> Option<Access> {
        self.grants.get(&principal).copied()
    }

    /// Whether `principal` may read
    pub fn allows_read(&self, principal: Principal) -> bool {
        self.access_for(principal).is_some_and(Access::can_read)
    }

    /// Whether `principal` may write
    pub fn allows_write(&self, principal: Principal) -> bool {
        self.access_for(principal).is_some_and(Access::can_write)
    }

    /// All grants, in principal order
    pub fn grants(&self) -> impl Iterator<Item = (Principal, Access)> + '_ {
        self.grants.iter().map(|(p, a)| (*p, *a))
    }
}

/// A channel handle bound to one principal, enforcing a [`ChannelPolicy`]
pub struct AccessControlledChannel<C> {
    inner: C,
    principal: Principal,
    policy: Arc<ChannelPolicy>,
}

impl<C: CredentialChannel> AccessControlledChannel<C> {
    /// Bind `inner` to `principal` under `policy`
    pub fn new(inner: C, principal: Principal, policy: Arc<ChannelPolicy>) -> Self {
        Self {
            inner,
            principal,
            policy,
        }
    }

    /// Principal this handle acts as
    pub fn principal(&self) -> Principal {
        self.principal
    }
}

#[async_trait]
impl<C: CredentialChannel> CredentialChannel for AccessControlledChannel<C> {
    async fn put(&self, key: &str, blob: &[u8]) -> Result<(), ChannelError> {
        if !self.policy.allows_write(self.principal) {
            warn!(principal = %self.principal, key, "channel write denied by policy");
            return Err(ChannelError::access_denied(
                key,
                format!("{} is not allowed to write", self.principal),
            ));
        }
        self.inner.put(key, blob).await
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, ChannelError> {
        if !self.policy.allows_read(self.principal) {
            warn!(principal = %self.principal, key, "channel read denied by policy");
            return Err(ChannelError::access_denied(
                key,
                format!("{} is not allowed to read", self.principal),
            ));
        }
        self.inner.get(key).await
    }

    fn locate(&self, key: &str) -> String {
        self.inner.locate(key)
    }
}
