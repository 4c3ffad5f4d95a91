//! Test helpers for handoff stories
//!
//! Provides an in-process control plane that mints and checks join tokens, a
//! [`ClusterRuntime`] backed by it, a channel wrapper recording every read, and
//! an [`InfrastructureProvider`] that "launches" instances as tokio tasks
//! running the real bootstrappers.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use keel_channel::{
    AccessControlledChannel, ChannelError, ChannelPolicy, CredentialChannel, InMemoryChannel,
    Principal,
};
use keel_cluster::{
    ChannelStore, ChannelStoreSpec, ControlPlaneInstance, ControlPlaneRequest,
    InfrastructureProvider, NetworkId, WorkerPool, WorkerPoolRequest,
};
use keel_common::config::{FetchPolicy, NetworkSelection};
use keel_common::credentials::{AdminCredentialBundle, JoinToken, JoinTokenRequest};
use keel_common::retry::RetryConfig;
use keel_common::Error;
use keel_fleet::{BootHook, InstanceEvent, InstanceId, LocalLauncher};
use keel_node::{
    ClusterRuntime, ControlPlaneBootstrapper, ControlPlaneConfig, ControlPlaneOutcome, NodeRole,
    RuntimeError, WorkerBootstrapper,
};

/// Address the fake control plane serves on inside the network
pub const PRIVATE_ADDRESS: &str = "10.0.0.10";

/// Public address handed out for the control-plane instance
pub const PUBLIC_ADDRESS: &str = "198.51.100.7";

/// Admin config as the runtime writes it, pointing at the local address
pub fn admin_conf(address: &str) -> String {
    format!(
        "apiVersion: v1\nkind: Config\nclusters:\n- name: keel\n  cluster:\n    server: https://{}:6443\nusers:\n- name: admin\n  user:\n    token: secret\n",
        address
    )
}

/// Fetch policy tuned for paused-time tests
pub fn fetch_policy(timeout_secs: u64) -> FetchPolicy {
    FetchPolicy {
        initial_delay_ms: 500,
        max_delay_secs: 5,
        timeout_secs,
    }
}

// =============================================================================
// Fake control plane
// =============================================================================

/// The join API of a running control plane
///
/// Remembers the one token it minted and when it expires; every join is
/// checked against both.
#[derive(Default)]
pub struct FakeControlPlane {
    fixed_token: Option<String>,
    minted: Mutex<Option<(String, Instant)>>,
    mints: AtomicU32,
    join_attempts: AtomicU32,
    joins: AtomicU32,
}

impl FakeControlPlane {
    /// Control plane minting `token-<n>` tokens
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Control plane that always mints `token`
    pub fn with_token(token: &str) -> Arc<Self> {
        Arc::new(Self {
            fixed_token: Some(token.to_string()),
            ..Default::default()
        })
    }

    fn mint(&self, validity: Duration) -> Result<JoinToken, RuntimeError> {
        let n = self.mints.fetch_add(1, Ordering::SeqCst) + 1;
        let value = self
            .fixed_token
            .clone()
            .unwrap_or_else(|| format!("token-{}", n));
        let token = JoinToken::new(&value).map_err(|e| RuntimeError::TokenCreate(e.to_string()))?;
        *self.minted.lock().unwrap() = Some((value, Instant::now() + validity));
        Ok(token)
    }

    fn accept(&self, token: &JoinToken) -> Result<(), RuntimeError> {
        self.join_attempts.fetch_add(1, Ordering::SeqCst);
        let minted = self.minted.lock().unwrap().clone();
        match minted {
            None => Err(RuntimeError::JoinRejected("no token has been minted".into())),
            Some((value, _)) if value != token.as_str() => {
                Err(RuntimeError::JoinRejected("unknown token".into()))
            }
            Some((_, expires_at)) if Instant::now() >= expires_at => {
                Err(RuntimeError::TokenExpired("token validity window has elapsed".into()))
            }
            Some(_) => {
                self.joins.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }
    }

    /// Tokens minted so far
    pub fn mints(&self) -> u32 {
        self.mints.load(Ordering::SeqCst)
    }

    /// Join calls received, successful or not
    pub fn join_attempts(&self) -> u32 {
        self.join_attempts.load(Ordering::SeqCst)
    }

    /// Successful joins
    pub fn joins(&self) -> u32 {
        self.joins.load(Ordering::SeqCst)
    }
}

/// Runtime on one instance, talking to the shared fake control plane
pub struct FakeRuntime {
    control_plane: Arc<FakeControlPlane>,
    installs: Mutex<Vec<NodeRole>>,
}

impl FakeRuntime {
    /// Runtime for an instance of a cluster served by `control_plane`
    pub fn new(control_plane: Arc<FakeControlPlane>) -> Arc<Self> {
        Arc::new(Self {
            control_plane,
            installs: Mutex::new(Vec::new()),
        })
    }

    /// Roles installed on this instance
    pub fn installs(&self) -> Vec<NodeRole> {
        self.installs.lock().unwrap().clone()
    }
}

#[async_trait]
impl ClusterRuntime for FakeRuntime {
    async fn install(&self, role: NodeRole) -> Result<(), RuntimeError> {
        self.installs.lock().unwrap().push(role);
        Ok(())
    }

    async fn start_controller(&self) -> Result<String, RuntimeError> {
        Ok(PRIVATE_ADDRESS.to_string())
    }

    async fn create_join_token(&self, request: &JoinTokenRequest) -> Result<JoinToken, RuntimeError> {
        self.control_plane.mint(request.validity)
    }

    async fn admin_credentials(&self) -> Result<AdminCredentialBundle, RuntimeError> {
        AdminCredentialBundle::parse(admin_conf(PRIVATE_ADDRESS))
            .map_err(|e| RuntimeError::AdminCredentials(e.to_string()))
    }

    async fn join_worker(&self, token: &JoinToken) -> Result<(), RuntimeError> {
        self.control_plane.accept(token)
    }
}

// =============================================================================
// Recording channel
// =============================================================================

/// Passes everything through and records the outcome of every `get`
pub struct RecordingChannel {
    inner: Arc<dyn CredentialChannel>,
    reads: Mutex<Vec<Result<(), ChannelError>>>,
}

impl RecordingChannel {
    /// Wrap `inner`
    pub fn new(inner: Arc<dyn CredentialChannel>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            reads: Mutex::new(Vec::new()),
        })
    }

    /// Outcome of every read so far, oldest first
    pub fn reads(&self) -> Vec<Result<(), ChannelError>> {
        self.reads.lock().unwrap().clone()
    }
}

#[async_trait]
impl CredentialChannel for RecordingChannel {
    async fn put(&self, key: &str, blob: &[u8]) -> Result<(), ChannelError> {
        self.inner.put(key, blob).await
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, ChannelError> {
        let result = self.inner.get(key).await;
        self.reads
            .lock()
            .unwrap()
            .push(result.as_ref().map(|_| ()).map_err(|e| e.clone()));
        result
    }

    fn locate(&self, key: &str) -> String {
        self.inner.locate(key)
    }
}

/// Control-plane bootstrapper against `store` with least-privilege access
pub fn control_plane_node(
    control_plane: &Arc<FakeControlPlane>,
    store: Arc<dyn CredentialChannel>,
    policy: Arc<ChannelPolicy>,
    config: ControlPlaneConfig,
) -> ControlPlaneBootstrapper {
    ControlPlaneBootstrapper::new(
        FakeRuntime::new(control_plane.clone()),
        Arc::new(AccessControlledChannel::new(
            store,
            Principal::ControlPlane,
            policy,
        )),
        config,
    )
}

/// Worker bootstrapper against `store` with least-privilege access
pub fn worker_node(
    control_plane: &Arc<FakeControlPlane>,
    store: Arc<dyn CredentialChannel>,
    policy: Arc<ChannelPolicy>,
    fetch: FetchPolicy,
) -> WorkerBootstrapper {
    WorkerBootstrapper::new(
        FakeRuntime::new(control_plane.clone()),
        Arc::new(AccessControlledChannel::new(
            store,
            Principal::Worker,
            policy,
        )),
        fetch,
    )
}

// =============================================================================
// Local infrastructure provider
// =============================================================================

/// Provider whose instances are tokio tasks running the real bootstrappers
pub struct LocalProvider {
    store: Arc<InMemoryChannel>,
    control_plane: Arc<FakeControlPlane>,
    fetch: FetchPolicy,
    publish_delay: Duration,
    policy_override: Option<ChannelPolicy>,
    policy: Mutex<Option<Arc<ChannelPolicy>>>,
    events_tx: mpsc::Sender<InstanceEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<InstanceEvent>>>,
    launcher: Mutex<Option<Arc<LocalLauncher>>>,
    control_plane_task: Mutex<Option<JoinHandle<Result<ControlPlaneOutcome, Error>>>>,
}

impl LocalProvider {
    /// Provider with an empty store; workers poll with `fetch`
    pub fn new(control_plane: Arc<FakeControlPlane>, fetch: FetchPolicy) -> Self {
        let (events_tx, events_rx) = mpsc::channel(64);
        Self {
            store: Arc::new(InMemoryChannel::new("local")),
            control_plane,
            fetch,
            publish_delay: Duration::ZERO,
            policy_override: None,
            policy: Mutex::new(None),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            launcher: Mutex::new(None),
            control_plane_task: Mutex::new(None),
        }
    }

    /// Enforce `policy` on the store instead of the requested one
    pub fn with_policy(mut self, policy: ChannelPolicy) -> Self {
        self.policy_override = Some(policy);
        self
    }

    /// Delay the control-plane boot so workers come up first
    pub fn with_publish_delay(mut self, delay: Duration) -> Self {
        self.publish_delay = delay;
        self
    }

    /// The store behind the channel
    pub fn store(&self) -> &Arc<InMemoryChannel> {
        &self.store
    }

    /// Instance events, for handing to the fleet manager
    pub fn take_events(&self) -> mpsc::Receiver<InstanceEvent> {
        self.events_rx
            .lock()
            .unwrap()
            .take()
            .expect("events already taken")
    }

    /// Launcher created for the worker pool
    pub fn launcher(&self) -> Arc<LocalLauncher> {
        self.launcher
            .lock()
            .unwrap()
            .clone()
            .expect("worker pool not created")
    }

    /// Wait for the control-plane bootstrapper to finish
    pub async fn control_plane_outcome(&self) -> Result<ControlPlaneOutcome, Error> {
        let task = self
            .control_plane_task
            .lock()
            .unwrap()
            .take()
            .expect("control plane not launched");
        task.await.expect("control-plane task panicked")
    }

    fn policy(&self) -> Result<Arc<ChannelPolicy>, Error> {
        self.policy
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::internal("channel store not created"))
    }
}

#[async_trait]
impl InfrastructureProvider for LocalProvider {
    async fn resolve_network(&self, _selection: &NetworkSelection) -> Result<NetworkId, Error> {
        Ok(NetworkId("local".to_string()))
    }

    async fn create_channel_store(&self, spec: &ChannelStoreSpec) -> Result<ChannelStore, Error> {
        let policy = self
            .policy_override
            .clone()
            .unwrap_or_else(|| spec.policy.clone());
        *self.policy.lock().unwrap() = Some(Arc::new(policy));
        Ok(ChannelStore {
            name: spec.name.clone(),
            region: None,
            channel: self.store.clone(),
        })
    }

    async fn launch_control_plane(
        &self,
        request: &ControlPlaneRequest,
    ) -> Result<ControlPlaneInstance, Error> {
        assert!(request.user_data.contains("exec keel-node controller"));

        let config = ControlPlaneConfig {
            advertise_address: Some(PUBLIC_ADDRESS.to_string()),
            publish_retry: RetryConfig::with_max_attempts(3),
            ..Default::default()
        };
        let mut node = control_plane_node(&self.control_plane, self.store.clone(), self.policy()?, config);
        let delay = self.publish_delay;

        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            node.run().await
        });
        *self.control_plane_task.lock().unwrap() = Some(task);

        Ok(ControlPlaneInstance {
            id: InstanceId::generate(),
            public_address: PUBLIC_ADDRESS.to_string(),
        })
    }

    async fn create_worker_pool(&self, request: &WorkerPoolRequest) -> Result<WorkerPool, Error> {
        let control_plane = self.control_plane.clone();
        let store = self.store.clone();
        let policy = self.policy()?;
        let fetch = self.fetch.clone();

        let boot: BootHook = Arc::new(move |_id: InstanceId| {
            let mut node = worker_node(&control_plane, store.clone(), policy.clone(), fetch.clone());
            async move { node.run().await }.boxed()
        });
        let launcher = Arc::new(LocalLauncher::new(boot, self.events_tx.clone()));
        *self.launcher.lock().unwrap() = Some(launcher.clone());

        Ok(WorkerPool {
            launcher,
            instance_profile: Some(format!("{}-profile", request.name)),
            security_group: None,
        })
    }
}
