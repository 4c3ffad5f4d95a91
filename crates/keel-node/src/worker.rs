//! Worker bootstrapper
//!
//! Runs on every worker instance at boot, including replacements launched by
//! the fleet after a reclaim:
//!
//! ```text
//! Uninitialized -> RuntimeInstalled -> TokenFetched -> Joined
//! ```
//!
//! Nothing orders a worker's boot after the control plane's publish. The
//! worker tolerates that by polling the channel: `NotFound` (not published
//! yet) and `Unavailable` (store hiccup) are retried with backoff until the
//! fetch deadline, after which the boot fails with
//! [`Error::TokenFetchTimeout`]. `AccessDenied` never clears on its own and
//! fails the boot immediately.
//!
//! Expiry is judged by the control plane's join API, not here: an expired
//! token surfaces from the join step as [`Error::TokenExpired`] and is not
//! retried.

use std::sync::Arc;

use tracing::{debug, error, info, instrument};

use keel_channel::{ChannelError, CredentialChannel};
use keel_common::config::FetchPolicy;
use keel_common::credentials::JoinToken;
use keel_common::retry::{retry_until, RetryError};
use keel_common::{Error, WORKER_TOKEN_KEY};

use crate::runtime::{ClusterRuntime, NodeRole};

/// Where the worker bootstrap sequence currently stands
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WorkerState {
    /// Nothing has happened yet
    Uninitialized,
    /// Runtime software is installed
    RuntimeInstalled,
    /// The join token has been read from the channel
    TokenFetched {
        /// The fetched token
        token: JoinToken,
    },
    /// Registered with the control plane (terminal)
    Joined {
        /// Fingerprint of the token used to join
        token_fingerprint: String,
    },
}

impl WorkerState {
    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            Self::Uninitialized => "Uninitialized",
            Self::RuntimeInstalled => "RuntimeInstalled",
            Self::TokenFetched { .. } => "TokenFetched",
            Self::Joined { .. } => "Joined",
        }
    }

    /// Whether the sequence has finished
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Joined { .. })
    }
}

/// Whether a channel read is worth repeating while waiting for the token
fn worth_polling(err: &ChannelError) -> bool {
    matches!(
        err,
        ChannelError::NotFound { .. } | ChannelError::Unavailable { .. }
    )
}

/// Drives one worker instance from boot to a joined node
pub struct WorkerBootstrapper {
    runtime: Arc<dyn ClusterRuntime>,
    channel: Arc<dyn CredentialChannel>,
    fetch: FetchPolicy,
    state: WorkerState,
}

impl WorkerBootstrapper {
    /// Create a bootstrapper in the `Uninitialized` state
    pub fn new(
        runtime: Arc<dyn ClusterRuntime>,
        channel: Arc<dyn CredentialChannel>,
        fetch: FetchPolicy,
    ) -> Self {
        Self {
            runtime,
            channel,
            fetch,
            state: WorkerState::Uninitialized,
        }
    }

    /// Current state
    pub fn state(&self) -> &WorkerState {
        &self.state
    }

    /// Run every remaining transition until the worker has joined
    #[instrument(skip(self), fields(state = self.state.name()))]
    pub async fn run(&mut self) -> Result<(), Error> {
        while !self.state.is_terminal() {
            if let Err(e) = self.step().await {
                error!(state = self.state.name(), scope = ?e.scope(), error = %e, "worker bootstrap failed");
                return Err(e);
            }
        }
        Ok(())
    }

    /// Perform the single transition out of the current state
    pub async fn step(&mut self) -> Result<(), Error> {
        let next = match &self.state {
            WorkerState::Uninitialized => {
                self.runtime.install(NodeRole::Worker).await?;
                info!("runtime installed");
                WorkerState::RuntimeInstalled
            }
            WorkerState::RuntimeInstalled => {
                let token = self.fetch_token().await?;
                info!(fingerprint = %token.fingerprint(), "join token fetched");
                WorkerState::TokenFetched { token }
            }
            WorkerState::TokenFetched { token } => {
                self.runtime.join_worker(token).await?;
                info!(fingerprint = %token.fingerprint(), "joined cluster");
                WorkerState::Joined {
                    token_fingerprint: token.fingerprint(),
                }
            }
            WorkerState::Joined { .. } => return Ok(()),
        };
        self.state = next;
        Ok(())
    }

    async fn fetch_token(&self) -> Result<JoinToken, Error> {
        let channel = &self.channel;
        debug!(
            key = WORKER_TOKEN_KEY,
            timeout_secs = self.fetch.timeout_secs,
            "polling credential channel for join token"
        );

        let blob = retry_until(
            &self.fetch.retry_config(),
            "fetch_worker_token",
            worth_polling,
            || channel.get(WORKER_TOKEN_KEY),
        )
        .await
        .map_err(|e| match e {
            RetryError::TimedOut { elapsed, last } => {
                Error::token_fetch_timeout(WORKER_TOKEN_KEY, elapsed, last.to_string())
            }
            RetryError::Exhausted { last, .. } => {
                Error::token_fetch_timeout(WORKER_TOKEN_KEY, self.fetch.timeout(), last.to_string())
            }
            RetryError::Permanent(last) => last.into(),
        })?;

        JoinToken::from_blob(&blob)
    }
}
