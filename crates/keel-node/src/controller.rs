//! Control-plane bootstrapper
//!
//! Runs once on the control-plane instance at first boot and walks a linear
//! state machine:
//!
//! ```text
//! Uninitialized -> RuntimeInstalled -> ControlPlaneStarted -> TokenMinted -> PublishedToChannel
//! ```
//!
//! Each transition has one guard: the previous state. A failed step leaves
//! the state where it was, so the error names exactly how far the boot got.
//! `PublishedToChannel` is terminal; running the bootstrapper again returns the
//! recorded outcome without minting or publishing anything.
//!
//! Publishing is the step the whole fleet depends on. Transient channel outages
//! are retried a bounded number of times; anything else (access denied, retries
//! exhausted) is a fatal-to-cluster [`Error::Publish`] that the boot agent turns
//! into a non-zero exit.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{error, info, instrument};

use keel_channel::{ChannelError, CredentialChannel};
use keel_common::credentials::{JoinToken, JoinTokenRequest};
use keel_common::retry::{retry_until, RetryConfig};
use keel_common::{endpoint_uri, Error, DEFAULT_TOKEN_VALIDITY_SECS, KUBECONFIG_KEY, WORKER_TOKEN_KEY};

use crate::runtime::{ClusterRuntime, NodeRole};

/// Where the control-plane bootstrap sequence currently stands
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlPlaneState {
    /// Nothing has happened yet
    Uninitialized,
    /// Runtime software is installed
    RuntimeInstalled,
    /// The control plane is serving the join API at `address`
    ControlPlaneStarted {
        /// Reachable control-plane address
        address: String,
    },
    /// A worker join token has been minted but not yet published
    TokenMinted {
        /// Reachable control-plane address
        address: String,
        /// The minted token
        token: JoinToken,
    },
    /// Token and admin bundle are in the channel (terminal)
    PublishedToChannel(ControlPlaneOutcome),
}

impl ControlPlaneState {
    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            Self::Uninitialized => "Uninitialized",
            Self::RuntimeInstalled => "RuntimeInstalled",
            Self::ControlPlaneStarted { .. } => "ControlPlaneStarted",
            Self::TokenMinted { .. } => "TokenMinted",
            Self::PublishedToChannel(_) => "PublishedToChannel",
        }
    }

    /// Whether the sequence has finished
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::PublishedToChannel(_))
    }
}

/// What a completed control-plane boot exposes
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneOutcome {
    /// Address the control plane was reached at
    pub address: String,
    /// `https://<address>:6443`
    pub endpoint: String,
    /// Where the admin credential bundle was written
    pub kubeconfig_locator: String,
    /// Fingerprint of the published join token
    pub token_fingerprint: String,
}

/// Settings for a control-plane boot
#[derive(Clone, Debug)]
pub struct ControlPlaneConfig {
    /// Validity window requested for the worker join token
    pub token_validity: Duration,
    /// Public address to put into the endpoint and admin bundle
    /// (defaults to the address the runtime reports)
    pub advertise_address: Option<String>,
    /// Retry policy for transient channel failures while publishing
    pub publish_retry: RetryConfig,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            token_validity: Duration::from_secs(DEFAULT_TOKEN_VALIDITY_SECS),
            advertise_address: None,
            publish_retry: RetryConfig {
                max_attempts: 5,
                initial_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(15),
                ..Default::default()
            },
        }
    }
}

/// Drives the control-plane instance from first boot to a published token
pub struct ControlPlaneBootstrapper {
    runtime: Arc<dyn ClusterRuntime>,
    channel: Arc<dyn CredentialChannel>,
    config: ControlPlaneConfig,
    state: ControlPlaneState,
}

impl ControlPlaneBootstrapper {
    /// Create a bootstrapper in the `Uninitialized` state
    pub fn new(
        runtime: Arc<dyn ClusterRuntime>,
        channel: Arc<dyn CredentialChannel>,
        config: ControlPlaneConfig,
    ) -> Self {
        Self {
            runtime,
            channel,
            config,
            state: ControlPlaneState::Uninitialized,
        }
    }

    /// Current state
    pub fn state(&self) -> &ControlPlaneState {
        &self.state
    }

    /// Reachable control-plane address, available from `ControlPlaneStarted` on
    pub fn address(&self) -> Option<&str> {
        match &self.state {
            ControlPlaneState::Uninitialized | ControlPlaneState::RuntimeInstalled => None,
            ControlPlaneState::ControlPlaneStarted { address }
            | ControlPlaneState::TokenMinted { address, .. } => Some(address),
            ControlPlaneState::PublishedToChannel(outcome) => Some(&outcome.address),
        }
    }

    /// Run every remaining transition until the terminal state
    #[instrument(skip(self), fields(state = self.state.name()))]
    pub async fn run(&mut self) -> Result<ControlPlaneOutcome, Error> {
        if let ControlPlaneState::PublishedToChannel(outcome) = &self.state {
            info!("credentials already published, nothing to do");
            return Ok(outcome.clone());
        }

        loop {
            if let Err(e) = self.step().await {
                error!(state = self.state.name(), scope = ?e.scope(), error = %e, "control-plane bootstrap failed");
                return Err(e);
            }
            if let ControlPlaneState::PublishedToChannel(outcome) = &self.state {
                return Ok(outcome.clone());
            }
        }
    }

    /// Perform the single transition out of the current state
    pub async fn step(&mut self) -> Result<(), Error> {
        let next = match &self.state {
            ControlPlaneState::Uninitialized => {
                self.runtime.install(NodeRole::Controller).await?;
                info!("runtime installed");
                ControlPlaneState::RuntimeInstalled
            }
            ControlPlaneState::RuntimeInstalled => {
                let address = self.runtime.start_controller().await?;
                info!(address = %address, "control plane started");
                ControlPlaneState::ControlPlaneStarted { address }
            }
            ControlPlaneState::ControlPlaneStarted { address } => {
                let request = JoinTokenRequest::worker(self.config.token_validity);
                let token = self.runtime.create_join_token(&request).await?;
                info!(
                    fingerprint = %token.fingerprint(),
                    expiry = %request.expiry_arg(),
                    "worker join token minted"
                );
                ControlPlaneState::TokenMinted {
                    address: address.clone(),
                    token,
                }
            }
            ControlPlaneState::TokenMinted { address, token } => {
                let outcome = self.publish(address, token).await?;
                ControlPlaneState::PublishedToChannel(outcome)
            }
            ControlPlaneState::PublishedToChannel(_) => return Ok(()),
        };
        self.state = next;
        Ok(())
    }

    async fn publish(&self, address: &str, token: &JoinToken) -> Result<ControlPlaneOutcome, Error> {
        let public_address = self
            .config
            .advertise_address
            .as_deref()
            .unwrap_or(address)
            .to_string();
        let endpoint = endpoint_uri(&public_address);

        // The token goes first: it is what unblocks the fleet
        self.put_with_retry(WORKER_TOKEN_KEY, &token.to_blob()).await?;
        info!(key = WORKER_TOKEN_KEY, fingerprint = %token.fingerprint(), "join token published");

        let bundle = self
            .runtime
            .admin_credentials()
            .await?
            .with_server(&endpoint)?;
        self.put_with_retry(KUBECONFIG_KEY, &bundle.to_blob()).await?;

        let kubeconfig_locator = self.channel.locate(KUBECONFIG_KEY);
        info!(locator = %kubeconfig_locator, endpoint = %endpoint, "admin credentials published");

        Ok(ControlPlaneOutcome {
            address: public_address,
            endpoint,
            kubeconfig_locator,
            token_fingerprint: token.fingerprint(),
        })
    }

    async fn put_with_retry(&self, key: &str, blob: &[u8]) -> Result<(), Error> {
        let channel = &self.channel;
        retry_until(
            &self.config.publish_retry,
            "publish_credential",
            |e: &ChannelError| e.is_retryable(),
            || channel.put(key, blob),
        )
        .await
        .map_err(|e| Error::publish(key, e.into_inner().to_string()))
    }
}
