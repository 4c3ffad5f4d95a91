//! Instance launching seam and lifecycle events

use std::fmt;

use async_trait::async_trait;
use serde::Serialize;

#[cfg(test)]
use mockall::automock;

use keel_common::Error;

use crate::template::LaunchTemplate;

/// Identifier of a launched instance
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct InstanceId(String);

impl InstanceId {
    /// Wrap an identifier assigned by the platform
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh identifier in the platform's `i-<hex>` shape
    pub fn generate() -> Self {
        let hex = uuid::Uuid::new_v4().simple().to_string();
        Self(format!("i-{}", &hex[..17]))
    }

    /// The identifier as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Something that happened to a worker instance
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InstanceEvent {
    /// The platform reclaimed an interruptible instance
    Reclaimed(InstanceId),
    /// The instance's bootstrap sequence failed; it will never become schedulable
    BootFailed {
        /// Failed instance
        id: InstanceId,
        /// What the instance reported
        reason: String,
    },
    /// The instance joined the cluster
    Joined(InstanceId),
}

impl InstanceEvent {
    /// Instance the event is about
    pub fn instance(&self) -> &InstanceId {
        match self {
            Self::Reclaimed(id) | Self::Joined(id) | Self::BootFailed { id, .. } => id,
        }
    }
}

/// Launches and terminates worker instances
#[cfg_attr(test, automock)]
#[async_trait]
pub trait InstanceLauncher: Send + Sync {
    /// Launch one instance from `template`
    async fn launch(&self, template: &LaunchTemplate) -> Result<InstanceId, Error>;

    /// Terminate an instance; terminating an unknown instance succeeds
    async fn terminate(&self, id: &InstanceId) -> Result<(), Error>;
}
