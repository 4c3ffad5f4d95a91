//! User-facing cluster configuration
//!
//! Every field is optional in YAML; omitted fields take the documented
//! defaults:
//!
//! ```yaml
//! network: create            # or `default`, or `existing: vpc-0abc`
//! spotWorkerNodes: true
//! controlPlaneInstanceType: m6g.medium
//! workerInstanceType: m6g.medium
//! workerMinCapacity: 3
//! bucketRemovalPolicy: retain  # or `destroy`
//! tokenValiditySecs: 360000    # 100h
//! tokenFetch:
//!   initialDelayMs: 1000
//!   maxDelaySecs: 30
//!   timeoutSecs: 900
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::RetryConfig;
use crate::topology::InstanceType;
use crate::{Error, DEFAULT_INSTANCE_TYPE, DEFAULT_TOKEN_VALIDITY_SECS, DEFAULT_WORKER_MIN_CAPACITY};

/// Which network the cluster's instances are placed in
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NetworkSelection {
    /// Create a dedicated network for the cluster
    #[default]
    Create,
    /// Reuse the account's default network
    Default,
    /// Reuse an existing network by identifier
    Existing(String),
}

impl NetworkSelection {
    /// Resolve the selection from provisioning context switches
    ///
    /// `use_default_vpc = "1"` wins over `use_vpc_id`; with neither set a new
    /// network is created.
    pub fn from_context(use_default_vpc: Option<&str>, use_vpc_id: Option<&str>) -> Self {
        if use_default_vpc == Some("1") {
            return Self::Default;
        }
        match use_vpc_id.map(str::trim) {
            Some(id) if !id.is_empty() => Self::Existing(id.to_string()),
            _ => Self::Create,
        }
    }
}

/// What happens to the credential channel's store when the cluster is torn down
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RemovalPolicy {
    /// Keep the store and its objects
    #[default]
    Retain,
    /// Delete the store together with all objects in it
    Destroy,
}

impl RemovalPolicy {
    /// Whether objects must be emptied out of the store before it is removed
    pub fn auto_delete_objects(self) -> bool {
        matches!(self, Self::Destroy)
    }
}

/// How long and how patiently a worker polls for the join token
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FetchPolicy {
    /// First delay between polls, in milliseconds
    pub initial_delay_ms: u64,
    /// Upper bound on the delay between polls, in seconds
    pub max_delay_secs: u64,
    /// Give up and fail the boot after this many seconds
    pub timeout_secs: u64,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_secs: 30,
            timeout_secs: 900,
        }
    }
}

impl FetchPolicy {
    /// Overall fetch deadline
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Reject policies that would poll without backing off or never give up
    pub fn validate(&self) -> Result<(), Error> {
        if self.initial_delay_ms == 0 {
            return Err(Error::validation_for_field(
                "tokenFetch.initialDelayMs",
                "delay between token polls must be positive",
            ));
        }
        if self.max_delay_secs == 0 {
            return Err(Error::validation_for_field(
                "tokenFetch.maxDelaySecs",
                "maximum delay between token polls must be positive",
            ));
        }
        if self.timeout_secs == 0 {
            return Err(Error::validation_for_field(
                "tokenFetch.timeoutSecs",
                "token fetch timeout must be positive",
            ));
        }
        Ok(())
    }

    /// Retry configuration implementing this policy
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: 0,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_secs(self.max_delay_secs),
            backoff_multiplier: 2.0,
            timeout: Some(self.timeout()),
        }
    }
}

/// Cluster configuration accepted at provisioning time
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterConfig {
    /// Network to place instances in
    #[serde(with = "serde_yaml::with::singleton_map")]
    pub network: NetworkSelection,
    /// Run workers on interruptible (spot) capacity
    pub spot_worker_nodes: bool,
    /// Control-plane instance shape
    pub control_plane_instance_type: String,
    /// Worker instance shape
    pub worker_instance_type: String,
    /// Minimum number of workers
    pub worker_min_capacity: u32,
    /// Credential store retention on teardown
    pub bucket_removal_policy: RemovalPolicy,
    /// Join token validity window in seconds
    pub token_validity_secs: u64,
    /// Worker token polling policy
    pub token_fetch: FetchPolicy,
    /// Where instances download the boot agent from (None = already on PATH)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub boot_agent_url: Option<String>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            network: NetworkSelection::default(),
            spot_worker_nodes: true,
            control_plane_instance_type: DEFAULT_INSTANCE_TYPE.to_string(),
            worker_instance_type: DEFAULT_INSTANCE_TYPE.to_string(),
            worker_min_capacity: DEFAULT_WORKER_MIN_CAPACITY,
            bucket_removal_policy: RemovalPolicy::default(),
            token_validity_secs: DEFAULT_TOKEN_VALIDITY_SECS,
            token_fetch: FetchPolicy::default(),
            boot_agent_url: None,
        }
    }
}

impl ClusterConfig {
    /// Parse configuration from a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self, Error> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| Error::serialization_for_kind("ClusterConfig", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse configuration from a YAML file
    pub fn from_file(path: &Path) -> Result<Self, Error> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            Error::validation(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&data)
    }

    /// Join token validity window
    pub fn token_validity(&self) -> Duration {
        Duration::from_secs(self.token_validity_secs)
    }

    /// Reject configurations that cannot produce a working cluster
    pub fn validate(&self) -> Result<(), Error> {
        if self.worker_min_capacity == 0 {
            return Err(Error::validation_for_field(
                "workerMinCapacity",
                "worker fleet must have at least 1 instance",
            ));
        }

        self.control_plane_instance_type
            .parse::<InstanceType>()
            .map_err(|e| Error::validation_for_field("controlPlaneInstanceType", e.to_string()))?;
        self.worker_instance_type
            .parse::<InstanceType>()
            .map_err(|e| Error::validation_for_field("workerInstanceType", e.to_string()))?;

        if self.token_validity_secs == 0 {
            return Err(Error::validation_for_field(
                "tokenValiditySecs",
                "join token validity window must be positive",
            ));
        }

        self.token_fetch.validate()?;

        if let NetworkSelection::Existing(id) = &self.network {
            if id.trim().is_empty() {
                return Err(Error::validation_for_field(
                    "network.existing",
                    "existing network id must not be empty",
                ));
            }
        }

        Ok(())
    }
}
