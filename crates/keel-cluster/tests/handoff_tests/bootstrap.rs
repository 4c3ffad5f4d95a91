//! Stories about the control plane and workers meeting through the channel

use std::sync::Arc;
use std::time::Duration;

use keel_channel::{Access, ChannelError, ChannelPolicy, CredentialChannel, InMemoryChannel, Principal};
use keel_common::credentials::JoinToken;
use keel_common::{Error, FailureScope, KUBECONFIG_KEY, WORKER_TOKEN_KEY};
use keel_node::{ControlPlaneConfig, ControlPlaneState, NodeRole, WorkerState};

use super::helpers::*;

fn least_privilege() -> Arc<ChannelPolicy> {
    Arc::new(ChannelPolicy::least_privilege())
}

// =============================================================================
// Story: every worker joins with the one published token
// =============================================================================

#[tokio::test(start_paused = true)]
async fn story_concurrent_workers_join_with_published_token() {
    let control_plane = FakeControlPlane::with_token("abc123");
    let store = Arc::new(InMemoryChannel::new("keel-state"));
    let policy = least_privilege();

    let mut node = control_plane_node(&control_plane, store.clone(), policy.clone(), ControlPlaneConfig::default());
    let outcome = node.run().await.unwrap();

    assert_eq!(store.get(WORKER_TOKEN_KEY).await.unwrap(), b"abc123\n");
    assert_eq!(outcome.endpoint, "https://10.0.0.10:6443");
    assert_eq!(outcome.kubeconfig_locator, "memory://keel-state/kubeconfig.yaml");

    let workers: Vec<_> = (0..3)
        .map(|_| {
            let mut worker = worker_node(&control_plane, store.clone(), policy.clone(), fetch_policy(60));
            tokio::spawn(async move { worker.run().await.map(|_| worker.state().clone()) })
        })
        .collect();

    let expected = WorkerState::Joined {
        token_fingerprint: JoinToken::new("abc123").unwrap().fingerprint(),
    };
    for worker in workers {
        assert_eq!(worker.await.unwrap().unwrap(), expected);
    }

    assert_eq!(control_plane.joins(), 3);
    assert_eq!(control_plane.mints(), 1);
}

// =============================================================================
// Story: a worker that boots before the publish waits for it
// =============================================================================

#[tokio::test(start_paused = true)]
async fn story_worker_booting_first_waits_for_publish() {
    let control_plane = FakeControlPlane::new();
    let store = Arc::new(InMemoryChannel::new("keel-state"));
    let policy = least_privilege();
    let recorder = RecordingChannel::new(store.clone());

    let mut worker = worker_node(&control_plane, recorder.clone(), policy.clone(), fetch_policy(900));
    let pending = tokio::spawn(async move { worker.run().await });

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(!pending.is_finished());
    assert_eq!(control_plane.join_attempts(), 0);

    let mut node = control_plane_node(&control_plane, store.clone(), policy, ControlPlaneConfig::default());
    node.run().await.unwrap();

    pending.await.unwrap().unwrap();
    assert_eq!(control_plane.joins(), 1);

    let reads = recorder.reads();
    assert!(reads.len() > 1);
    assert!(matches!(reads.first(), Some(Err(ChannelError::NotFound { .. }))));
    assert!(matches!(reads.last(), Some(Ok(()))));
}

// =============================================================================
// Story: a denied publish is fatal to the cluster and nobody joins
// =============================================================================

#[tokio::test(start_paused = true)]
async fn story_denied_publish_leaves_fleet_unable_to_join() {
    let control_plane = FakeControlPlane::new();
    let store = Arc::new(InMemoryChannel::new("keel-state"));
    // Control plane was never granted write access
    let policy = Arc::new(ChannelPolicy::deny_all().grant(Principal::Worker, Access::Read));

    let mut node = control_plane_node(&control_plane, store.clone(), policy.clone(), ControlPlaneConfig::default());
    let err = node.run().await.unwrap_err();

    assert!(matches!(err, Error::Publish { ref key, .. } if key == WORKER_TOKEN_KEY));
    assert_eq!(err.scope(), FailureScope::Cluster);
    assert!(matches!(node.state(), ControlPlaneState::TokenMinted { .. }));
    assert!(store.is_empty());

    for _ in 0..2 {
        let mut worker = worker_node(&control_plane, store.clone(), policy.clone(), fetch_policy(120));
        let err = worker.run().await.unwrap_err();
        assert!(matches!(err, Error::TokenFetchTimeout { .. }));
        assert_eq!(worker.state(), &WorkerState::RuntimeInstalled);
    }
    assert_eq!(control_plane.join_attempts(), 0);
}

// =============================================================================
// Story: the control plane publishes exactly once
// =============================================================================

#[tokio::test(start_paused = true)]
async fn story_rerunning_control_plane_does_not_republish() {
    let control_plane = FakeControlPlane::new();
    let store = Arc::new(InMemoryChannel::new("keel-state"));

    let mut node = control_plane_node(&control_plane, store.clone(), least_privilege(), ControlPlaneConfig::default());
    let first = node.run().await.unwrap();
    let second = node.run().await.unwrap();

    assert_eq!(first, second);
    assert_eq!(store.write_count(), 2);
    assert_eq!(control_plane.mints(), 1);

    // The published bundle points at the reachable endpoint
    let bundle = keel_common::credentials::AdminCredentialBundle::from_blob(
        &store.get(KUBECONFIG_KEY).await.unwrap(),
    )
    .unwrap();
    assert_eq!(bundle.server().as_deref(), Some("https://10.0.0.10:6443"));
}

#[tokio::test(start_paused = true)]
async fn test_worker_installs_worker_role() {
    let control_plane = FakeControlPlane::new();
    let store = Arc::new(InMemoryChannel::new("keel-state"));
    let runtime = FakeRuntime::new(control_plane.clone());

    let mut node = control_plane_node(&control_plane, store.clone(), least_privilege(), ControlPlaneConfig::default());
    node.run().await.unwrap();

    let mut worker = keel_node::WorkerBootstrapper::new(runtime.clone(), store.clone(), fetch_policy(60));
    worker.run().await.unwrap();
    assert_eq!(runtime.installs(), vec![NodeRole::Worker]);
}

// =============================================================================
// Story: token expiry is its own failure
// =============================================================================

#[tokio::test(start_paused = true)]
async fn story_token_expiry_boundary() {
    let control_plane = FakeControlPlane::new();
    let store = Arc::new(InMemoryChannel::new("keel-state"));
    let policy = least_privilege();
    let config = ControlPlaneConfig {
        token_validity: Duration::from_secs(10),
        ..Default::default()
    };

    let mut node = control_plane_node(&control_plane, store.clone(), policy.clone(), config);
    node.run().await.unwrap();

    // Just inside the window
    tokio::time::sleep(Duration::from_secs(9)).await;
    let mut early = worker_node(&control_plane, store.clone(), policy.clone(), fetch_policy(60));
    early.run().await.unwrap();

    // Past it: the join API refuses, and the worker does not retry
    tokio::time::sleep(Duration::from_secs(2)).await;
    let mut late = worker_node(&control_plane, store.clone(), policy.clone(), fetch_policy(60));
    let err = late.run().await.unwrap_err();

    assert!(matches!(err, Error::TokenExpired { .. }));
    assert_eq!(err.scope(), FailureScope::Instance);
    assert!(matches!(late.state(), WorkerState::TokenFetched { .. }));
    assert_eq!(control_plane.join_attempts(), 2);
    assert_eq!(control_plane.joins(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_store_is_a_fetch_timeout_not_expiry() {
    let control_plane = FakeControlPlane::new();
    let store = Arc::new(InMemoryChannel::new("keel-state"));
    let policy = least_privilege();

    let mut node = control_plane_node(&control_plane, store.clone(), policy.clone(), ControlPlaneConfig::default());
    node.run().await.unwrap();
    store.set_available(false);

    let mut worker = worker_node(&control_plane, store.clone(), policy, fetch_policy(60));
    let err = worker.run().await.unwrap_err();

    match err {
        Error::TokenFetchTimeout { key, last_error, .. } => {
            assert_eq!(key, WORKER_TOKEN_KEY);
            assert!(last_error.contains("unavailable"), "{last_error}");
        }
        other => panic!("expected TokenFetchTimeout, got {other:?}"),
    }
    assert_eq!(control_plane.join_attempts(), 0);
}
