//! Infrastructure provider seam
//!
//! The orchestrator never creates networks, buckets, roles or instances
//! itself. It hands declarative requests to an [`InfrastructureProvider`] and
//! gets back handles: a credential channel for the store, an address for the
//! control plane, and an [`InstanceLauncher`] for the worker pool.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

#[cfg(test)]
use mockall::automock;

use keel_channel::{ChannelPolicy, CredentialChannel, Principal};
use keel_common::config::{NetworkSelection, RemovalPolicy};
use keel_common::topology::NodeDescriptor;
use keel_common::{Error, CONTROL_PLANE_PORT};
use keel_fleet::{InstanceId, InstanceLauncher, MachineImage};

/// Inbound TCP rule attached to a node security group
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngressRule {
    /// TCP port
    pub port: u16,
    /// Source range in CIDR notation
    pub source_cidr: String,
    /// Rule description
    pub description: String,
}

impl IngressRule {
    /// Allow `port` from anywhere
    pub fn from_anywhere(port: u16, description: impl Into<String>) -> Self {
        Self {
            port,
            source_cidr: "0.0.0.0/0".to_string(),
            description: description.into(),
        }
    }
}

/// Rules shared by control-plane and worker groups: SSH and the API server
pub fn node_ingress_rules() -> Vec<IngressRule> {
    vec![
        IngressRule::from_anywhere(22, "SSH"),
        IngressRule::from_anywhere(CONTROL_PLANE_PORT, "k0s API server"),
    ]
}

/// Identifier of a resolved network
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct NetworkId(pub String);

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Request for the durable store backing the credential channel
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelStoreSpec {
    /// Name hint; providers may add a unique suffix
    pub name: String,
    /// What happens to the store on teardown
    pub removal_policy: RemovalPolicy,
    /// Which node identities may read or write it
    pub policy: ChannelPolicy,
}

impl ChannelStoreSpec {
    /// Whether objects are emptied out with the store on teardown
    pub fn auto_delete_objects(&self) -> bool {
        self.removal_policy.auto_delete_objects()
    }
}

/// A created store
#[derive(Clone)]
pub struct ChannelStore {
    /// Final store (bucket) name, baked into startup scripts
    pub name: String,
    /// Store region, if the provider is regional
    pub region: Option<String>,
    /// Operator handle on the store
    pub channel: Arc<dyn CredentialChannel>,
}

/// Request for the single control-plane instance
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControlPlaneRequest {
    /// Resource name
    pub name: String,
    /// Network to place the instance in
    pub network: NetworkId,
    /// Instance shape
    pub node: NodeDescriptor,
    /// Boot image
    pub image: MachineImage,
    /// Startup script (plain text)
    pub user_data: String,
    /// Security group rules
    pub ingress: Vec<IngressRule>,
    /// Identity the instance acts as on the channel
    pub principal: Principal,
}

/// A launched control-plane instance
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControlPlaneInstance {
    /// Instance identifier
    pub id: InstanceId,
    /// Public address the API server will be reachable at
    pub public_address: String,
}

/// Request for the worker pool's identity and network plumbing
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerPoolRequest {
    /// Resource name
    pub name: String,
    /// Network to place workers in
    pub network: NetworkId,
    /// Security group rules
    pub ingress: Vec<IngressRule>,
    /// Identity every worker acts as on the channel
    pub principal: Principal,
}

/// Everything needed to launch workers into the pool
#[derive(Clone)]
pub struct WorkerPool {
    /// Launches and terminates worker instances
    pub launcher: Arc<dyn InstanceLauncher>,
    /// Instance profile carrying the worker identity
    pub instance_profile: Option<String>,
    /// Security group for worker instances
    pub security_group: Option<String>,
}

/// Creates the infrastructure the cluster runs on
#[cfg_attr(test, automock)]
#[async_trait]
pub trait InfrastructureProvider: Send + Sync {
    /// Resolve or create the network for `selection`
    async fn resolve_network(&self, selection: &NetworkSelection) -> Result<NetworkId, Error>;

    /// Create the credential channel's store with its access policy
    async fn create_channel_store(&self, spec: &ChannelStoreSpec) -> Result<ChannelStore, Error>;

    /// Launch the control-plane instance
    async fn launch_control_plane(&self, request: &ControlPlaneRequest) -> Result<ControlPlaneInstance, Error>;

    /// Prepare the worker pool (identity, security group, launcher)
    async fn create_worker_pool(&self, request: &WorkerPoolRequest) -> Result<WorkerPool, Error>;
}
