//! Fleet manager
//!
//! Keeps `min_capacity` workers alive from a single launch template. It does
//! not know anything about join tokens: a replacement worker is just a fresh
//! launch whose startup script runs the worker bootstrapper from
//! `Uninitialized`, exactly like the initial workers did.
//!
//! Replacement triggers:
//! - [`InstanceEvent::Reclaimed`]: the platform took an interruptible instance back
//! - [`InstanceEvent::BootFailed`]: the instance will never become schedulable;
//!   it is terminated and replaced
//!
//! A periodic resync also tops the fleet back up after launch failures.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use keel_common::retry::{retry_until, RetryConfig};
use keel_common::Error;

use crate::launcher::{InstanceEvent, InstanceId, InstanceLauncher};
use crate::template::LaunchTemplate;

/// Lifecycle phase of a tracked worker
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum InstancePhase {
    /// Launched, bootstrap still running
    Booting,
    /// Joined the cluster
    Joined,
}

/// Snapshot of the fleet
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetStatus {
    /// Target number of workers
    pub desired: u32,
    /// Workers still booting
    pub booting: u32,
    /// Workers that have joined
    pub joined: u32,
    /// Instances replaced after a reclaim or failed boot
    pub replaced: u64,
    /// Launches that failed after retries
    pub launch_failures: u64,
}

impl FleetStatus {
    /// Workers currently tracked
    pub fn running(&self) -> u32 {
        self.booting + self.joined
    }

    /// Whether every desired worker has joined
    pub fn is_ready(&self) -> bool {
        self.joined >= self.desired
    }
}

/// Maintains the worker fleet at its target size
pub struct FleetManager {
    launcher: Arc<dyn InstanceLauncher>,
    template: LaunchTemplate,
    desired: u32,
    instances: BTreeMap<InstanceId, InstancePhase>,
    launch_retry: RetryConfig,
    resync_interval: Duration,
    replaced: u64,
    launch_failures: u64,
    status_tx: watch::Sender<FleetStatus>,
}

impl FleetManager {
    /// Create a manager for an empty fleet; call [`reconcile`](Self::reconcile) to launch
    pub fn new(launcher: Arc<dyn InstanceLauncher>, template: LaunchTemplate, min_capacity: u32) -> Self {
        let (status_tx, _) = watch::channel(FleetStatus {
            desired: min_capacity,
            ..Default::default()
        });
        Self {
            launcher,
            template,
            desired: min_capacity,
            instances: BTreeMap::new(),
            launch_retry: RetryConfig {
                max_attempts: 5,
                initial_delay: Duration::from_secs(2),
                max_delay: Duration::from_secs(30),
                ..Default::default()
            },
            resync_interval: Duration::from_secs(60),
            replaced: 0,
            launch_failures: 0,
            status_tx,
        }
    }

    /// Override the retry policy for launches
    pub fn with_launch_retry(mut self, retry: RetryConfig) -> Self {
        self.launch_retry = retry;
        self
    }

    /// Override how often the run loop re-checks capacity
    pub fn with_resync_interval(mut self, interval: Duration) -> Self {
        self.resync_interval = interval;
        self
    }

    /// Template every worker is launched from
    pub fn template(&self) -> &LaunchTemplate {
        &self.template
    }

    /// Tracked instances and their phases
    pub fn instances(&self) -> impl Iterator<Item = (&InstanceId, InstancePhase)> {
        self.instances.iter().map(|(id, phase)| (id, *phase))
    }

    /// Current snapshot
    pub fn status(&self) -> FleetStatus {
        let joined = self
            .instances
            .values()
            .filter(|phase| **phase == InstancePhase::Joined)
            .count() as u32;
        FleetStatus {
            desired: self.desired,
            booting: self.instances.len() as u32 - joined,
            joined,
            replaced: self.replaced,
            launch_failures: self.launch_failures,
        }
    }

    /// Watch status changes
    pub fn subscribe(&self) -> watch::Receiver<FleetStatus> {
        self.status_tx.subscribe()
    }

    fn publish_status(&self) {
        self.status_tx.send_replace(self.status());
    }

    async fn launch_one(&mut self) -> Result<InstanceId, Error> {
        let launcher = &self.launcher;
        let template = &self.template;
        let result = retry_until(
            &self.launch_retry,
            "launch_worker",
            |e: &Error| e.is_retryable(),
            || launcher.launch(template),
        )
        .await;

        result.map_err(|e| {
            self.launch_failures += 1;
            Error::fleet(format!("failed to launch worker: {}", e.into_inner()))
        })
    }

    /// Launch or terminate instances until the fleet matches its target size
    ///
    /// Returns the instances launched by this call.
    #[instrument(skip(self), fields(template = %self.template.name, desired = self.desired))]
    pub async fn reconcile(&mut self) -> Result<Vec<InstanceId>, Error> {
        let mut launched = Vec::new();

        while (self.instances.len() as u32) < self.desired {
            let id = match self.launch_one().await {
                Ok(id) => id,
                Err(e) => {
                    self.publish_status();
                    return Err(e);
                }
            };
            info!(instance = %id, "launched worker");
            self.instances.insert(id.clone(), InstancePhase::Booting);
            launched.push(id);
        }

        while (self.instances.len() as u32) > self.desired {
            // Prefer dropping instances that have not joined yet
            let victim = self
                .instances
                .iter()
                .find(|(_, phase)| **phase == InstancePhase::Booting)
                .or_else(|| self.instances.iter().next())
                .map(|(id, _)| id.clone());
            let Some(victim) = victim else { break };

            self.launcher.terminate(&victim).await?;
            self.instances.remove(&victim);
            info!(instance = %victim, "terminated surplus worker");
        }

        self.publish_status();
        Ok(launched)
    }

    /// Change the target size and reconcile
    pub async fn scale_to(&mut self, min_capacity: u32) -> Result<Vec<InstanceId>, Error> {
        if min_capacity == 0 {
            return Err(Error::validation_for_field(
                "workerMinCapacity",
                "worker fleet must have at least 1 instance",
            ));
        }
        info!(from = self.desired, to = min_capacity, "scaling worker fleet");
        self.desired = min_capacity;
        self.reconcile().await
    }

    /// Apply one lifecycle event
    pub async fn handle_event(&mut self, event: InstanceEvent) -> Result<(), Error> {
        match event {
            InstanceEvent::Joined(id) => match self.instances.get_mut(&id) {
                Some(phase) => {
                    *phase = InstancePhase::Joined;
                    info!(instance = %id, "worker joined");
                }
                None => debug!(instance = %id, "join reported by untracked instance"),
            },
            InstanceEvent::Reclaimed(id) => {
                if self.instances.remove(&id).is_none() {
                    debug!(instance = %id, "reclaim of untracked instance");
                    return Ok(());
                }
                warn!(instance = %id, "worker reclaimed, launching replacement");
                self.replaced += 1;
                self.reconcile().await?;
            }
            InstanceEvent::BootFailed { id, reason } => {
                if self.instances.remove(&id).is_none() {
                    debug!(instance = %id, "boot failure of untracked instance");
                    return Ok(());
                }
                warn!(instance = %id, reason = %reason, "worker failed to boot, replacing it");
                if let Err(e) = self.launcher.terminate(&id).await {
                    error!(instance = %id, error = %e, "failed to terminate unhealthy worker");
                }
                self.replaced += 1;
                self.reconcile().await?;
            }
        }
        self.publish_status();
        Ok(())
    }

    /// Launch the fleet and keep it at size until `shutdown` fires or the
    /// event stream ends
    ///
    /// Returns the final status.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<InstanceEvent>,
        shutdown: CancellationToken,
    ) -> FleetStatus {
        if let Err(e) = self.reconcile().await {
            error!(error = %e, "initial fleet launch incomplete");
        }

        let mut resync = tokio::time::interval(self.resync_interval);
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);
        resync.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("fleet manager shutting down");
                    break;
                }
                event = events.recv() => match event {
                    Some(event) => {
                        if let Err(e) = self.handle_event(event).await {
                            error!(error = %e, "failed to handle instance event");
                        }
                    }
                    None => {
                        debug!("instance event stream closed");
                        break;
                    }
                },
                _ = resync.tick() => {
                    if (self.instances.len() as u32) < self.desired {
                        if let Err(e) = self.reconcile().await {
                            error!(error = %e, "fleet resync failed");
                        }
                    }
                }
            }
        }

        self.status()
    }
}
