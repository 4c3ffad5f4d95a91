//! In-process instance launcher
//!
//! Each "instance" is a tokio task running a boot hook, typically a worker
//! bootstrapper wired to an in-memory or directory channel. The task reports
//! `Joined` or `BootFailed` on the event channel when the hook finishes, the
//! way an instance's health would surface to the fleet. [`LocalLauncher::reclaim`]
//! simulates the platform taking an interruptible instance back.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use keel_common::Error;

use crate::launcher::{InstanceEvent, InstanceId, InstanceLauncher};
use crate::template::LaunchTemplate;

/// Boot sequence run by every local instance
pub type BootHook = Arc<dyn Fn(InstanceId) -> BoxFuture<'static, Result<(), Error>> + Send + Sync>;

/// Launches instances as tokio tasks
pub struct LocalLauncher {
    boot: BootHook,
    events: mpsc::Sender<InstanceEvent>,
    tasks: DashMap<InstanceId, JoinHandle<()>>,
    launched: AtomicU64,
}

impl LocalLauncher {
    /// Create a launcher that runs `boot` for each instance and reports on `events`
    pub fn new(boot: BootHook, events: mpsc::Sender<InstanceEvent>) -> Self {
        Self {
            boot,
            events,
            tasks: DashMap::new(),
            launched: AtomicU64::new(0),
        }
    }

    /// Total launches so far
    pub fn launched(&self) -> u64 {
        self.launched.load(Ordering::SeqCst)
    }

    /// Instances not yet terminated or reclaimed
    pub fn live_instances(&self) -> Vec<InstanceId> {
        let mut ids: Vec<_> = self.tasks.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Simulate the platform reclaiming an interruptible instance
    pub async fn reclaim(&self, id: &InstanceId) -> Result<(), Error> {
        let Some((_, task)) = self.tasks.remove(id) else {
            return Err(Error::fleet(format!("no live instance {}", id)));
        };
        task.abort();
        warn!(instance = %id, "instance reclaimed by platform");
        self.events
            .send(InstanceEvent::Reclaimed(id.clone()))
            .await
            .map_err(|_| Error::fleet("fleet event channel closed"))
    }
}

#[async_trait]
impl InstanceLauncher for LocalLauncher {
    async fn launch(&self, template: &LaunchTemplate) -> Result<InstanceId, Error> {
        let id = InstanceId::generate();
        let boot = Arc::clone(&self.boot);
        let events = self.events.clone();
        let task_id = id.clone();

        let handle = tokio::spawn(async move {
            let event = match boot(task_id.clone()).await {
                Ok(()) => InstanceEvent::Joined(task_id),
                Err(e) => InstanceEvent::BootFailed {
                    id: task_id,
                    reason: e.to_string(),
                },
            };
            if events.send(event).await.is_err() {
                debug!("fleet event channel closed before boot finished");
            }
        });

        self.tasks.insert(id.clone(), handle);
        self.launched.fetch_add(1, Ordering::SeqCst);
        info!(instance = %id, template = %template.name, "started local instance");
        Ok(id)
    }

    async fn terminate(&self, id: &InstanceId) -> Result<(), Error> {
        if let Some((_, task)) = self.tasks.remove(id) {
            task.abort();
            info!(instance = %id, "terminated local instance");
        }
        Ok(())
    }
}
