//! Common types for keel: errors, retry, telemetry, configuration and credentials
//!
//! Everything that more than one keel crate needs lives here: the error taxonomy
//! shared by the bootstrappers, the backoff helper used for every channel read,
//! the cluster configuration with its documented defaults, and the credential
//! types handed from the control plane to the worker fleet.

#![deny(missing_docs)]

pub mod config;
pub mod credentials;
pub mod error;
pub mod retry;
pub mod telemetry;
pub mod topology;

pub use error::{Error, FailureScope};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Port the control plane's API server listens on
pub const CONTROL_PLANE_PORT: u16 = 6443;

/// Channel key holding the worker join token
pub const WORKER_TOKEN_KEY: &str = "worker-token";

/// Channel key holding the admin credential bundle
pub const KUBECONFIG_KEY: &str = "kubeconfig.yaml";

/// Default instance shape for both node roles (mid-size ARM)
pub const DEFAULT_INSTANCE_TYPE: &str = "m6g.medium";

/// Default minimum number of worker instances
pub const DEFAULT_WORKER_MIN_CAPACITY: u32 = 3;

/// Default join token validity window (100 hours)
pub const DEFAULT_TOKEN_VALIDITY_SECS: u64 = 100 * 60 * 60;

/// Build the reachable endpoint URI for a control-plane address
pub fn endpoint_uri(address: &str) -> String {
    format!("https://{}:{}", address, CONTROL_PLANE_PORT)
}
