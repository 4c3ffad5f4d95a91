//! Cluster provisioning
//!
//! [`Cluster::provision`] is the composition root. It resolves the topology
//! from configuration and creates the pieces in dependency order:
//!
//! 1. network
//! 2. credential store, control plane writes and workers read
//! 3. control-plane instance, whose startup script runs the control-plane
//!    bootstrapper
//! 4. worker pool and launch template, whose startup script runs the worker
//!    bootstrapper
//! 5. the initial fleet
//!
//! Workers launch after the control plane, but nothing waits for the publish:
//! a worker that boots first keeps polling the channel until the token shows
//! up or its fetch deadline passes.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, instrument};

use keel_channel::{ChannelError, ChannelPolicy, CredentialChannel, Principal};
use keel_common::config::{ClusterConfig, FetchPolicy};
use keel_common::credentials::AdminCredentialBundle;
use keel_common::retry::{retry_until, RetryError};
use keel_common::topology::ClusterTopology;
use keel_common::{endpoint_uri, Error, KUBECONFIG_KEY};
use keel_fleet::{FleetManager, LaunchTemplate, MachineImage};

use crate::provider::{
    node_ingress_rules, ChannelStoreSpec, ControlPlaneInstance, ControlPlaneRequest,
    InfrastructureProvider, WorkerPoolRequest,
};
use crate::userdata::{render_control_plane, render_worker, BootScriptContext};

/// Provisioning outputs handed to the operator
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ClusterOutputs {
    /// `https://<control-plane-address>:6443`
    pub endpoint: String,
    /// Where the admin credential bundle will be published
    pub kubeconfig_locator: String,
    /// Control-plane instance shape
    pub control_plane_instance_type: String,
    /// Worker instance shape
    pub worker_instance_type: String,
    /// Minimum worker count
    pub worker_min_capacity: u32,
    /// Name of the credential store
    pub credential_store: String,
}

impl ClusterOutputs {
    /// Outputs as pretty-printed JSON
    pub fn to_json(&self) -> Result<String, Error> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// A provisioned cluster
pub struct Cluster {
    name: String,
    topology: ClusterTopology,
    outputs: ClusterOutputs,
    control_plane: ControlPlaneInstance,
    channel: Arc<dyn CredentialChannel>,
    fetch: FetchPolicy,
    fleet: FleetManager,
}

impl Cluster {
    /// Create every resource of cluster `name` through `provider`
    #[instrument(skip(config, provider))]
    pub async fn provision(
        name: &str,
        config: &ClusterConfig,
        provider: &dyn InfrastructureProvider,
    ) -> Result<Self, Error> {
        let topology = ClusterTopology::from_config(config)?;

        let network = provider.resolve_network(&config.network).await?;
        info!(network = %network, "network resolved");

        let store = provider
            .create_channel_store(&ChannelStoreSpec {
                name: format!("{}-state", name),
                removal_policy: config.bucket_removal_policy,
                policy: ChannelPolicy::least_privilege(),
            })
            .await?;
        info!(store = %store.name, "credential store created");

        let scripts = BootScriptContext::new(store.name.clone(), store.region.clone(), config);

        let control_plane = provider
            .launch_control_plane(&ControlPlaneRequest {
                name: format!("{}-control-plane", name),
                network: network.clone(),
                node: topology.control_plane.clone(),
                image: MachineImage::latest_for(&topology.control_plane.instance_type),
                user_data: render_control_plane(&scripts)?,
                ingress: node_ingress_rules(),
                principal: Principal::ControlPlane,
            })
            .await?;
        info!(
            instance = %control_plane.id,
            address = %control_plane.public_address,
            "control plane launched"
        );

        let pool = provider
            .create_worker_pool(&WorkerPoolRequest {
                name: format!("{}-workers", name),
                network,
                ingress: node_ingress_rules(),
                principal: Principal::Worker,
            })
            .await?;

        let mut template =
            LaunchTemplate::for_fleet(format!("{}-workers", name), &topology.workers, render_worker(&scripts)?);
        if let Some(profile) = &pool.instance_profile {
            template = template.with_instance_profile(profile.clone());
        }
        if let Some(group) = &pool.security_group {
            template = template.with_security_group(group.clone());
        }

        let mut fleet = FleetManager::new(pool.launcher, template, topology.workers.min_capacity);
        let launched = fleet.reconcile().await?;
        info!(workers = launched.len(), market = ?topology.workers.market, "worker fleet launched");

        let outputs = ClusterOutputs {
            endpoint: endpoint_uri(&control_plane.public_address),
            kubeconfig_locator: store.channel.locate(KUBECONFIG_KEY),
            control_plane_instance_type: topology.control_plane.instance_type.to_string(),
            worker_instance_type: topology.workers.instance_type.to_string(),
            worker_min_capacity: topology.workers.min_capacity,
            credential_store: store.name,
        };

        Ok(Self {
            name: name.to_string(),
            topology,
            outputs,
            control_plane,
            channel: store.channel,
            fetch: config.token_fetch.clone(),
            fleet,
        })
    }

    /// Cluster name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Provisioning outputs
    pub fn outputs(&self) -> &ClusterOutputs {
        &self.outputs
    }

    /// Resolved topology
    pub fn topology(&self) -> &ClusterTopology {
        &self.topology
    }

    /// The control-plane instance
    pub fn control_plane(&self) -> &ControlPlaneInstance {
        &self.control_plane
    }

    /// Operator handle on the credential channel
    pub fn channel(&self) -> &Arc<dyn CredentialChannel> {
        &self.channel
    }

    /// The fleet manager
    pub fn fleet(&self) -> &FleetManager {
        &self.fleet
    }

    /// Hand the fleet manager over, typically to [`FleetManager::run`]
    pub fn into_fleet(self) -> FleetManager {
        self.fleet
    }

    /// Wait for the control plane to publish the admin bundle and read it
    ///
    /// Polls with the same policy workers use for the join token.
    pub async fn admin_credentials(&self) -> Result<AdminCredentialBundle, Error> {
        let channel = &self.channel;
        let blob = retry_until(
            &self.fetch.retry_config(),
            "fetch_admin_credentials",
            |e: &ChannelError| matches!(e, ChannelError::NotFound { .. } | ChannelError::Unavailable { .. }),
            || channel.get(KUBECONFIG_KEY),
        )
        .await
        .map_err(|e| match e {
            RetryError::TimedOut { elapsed, last } => {
                Error::token_fetch_timeout(KUBECONFIG_KEY, elapsed, last.to_string())
            }
            RetryError::Exhausted { last, .. } => {
                Error::token_fetch_timeout(KUBECONFIG_KEY, self.fetch.timeout(), last.to_string())
            }
            RetryError::Permanent(last) => last.into(),
        })?;

        AdminCredentialBundle::from_blob(&blob)
    }
}
