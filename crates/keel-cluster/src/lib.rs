//! Cluster orchestration for keel
//!
//! Wires the credential channel, the two bootstrappers and the worker fleet
//! together: resolves the topology from [`ClusterConfig`](keel_common::config::ClusterConfig),
//! renders the startup scripts that run the boot agent on each instance, asks
//! an [`InfrastructureProvider`] for the resources in dependency order, and
//! exposes the endpoint and credential locator as outputs.
//!
//! - [`userdata`] - startup scripts for control-plane and worker instances
//! - [`provider`] - infrastructure seam and request types
//! - [`cluster`] - [`Cluster::provision`] and [`ClusterOutputs`]

#![deny(missing_docs)]

pub mod cluster;
pub mod provider;
pub mod userdata;

pub use cluster::{Cluster, ClusterOutputs};
pub use provider::{
    node_ingress_rules, ChannelStore, ChannelStoreSpec, ControlPlaneInstance, ControlPlaneRequest,
    InfrastructureProvider, IngressRule, NetworkId, WorkerPool, WorkerPoolRequest,
};
pub use userdata::{render_control_plane, render_worker, BootScriptContext};
