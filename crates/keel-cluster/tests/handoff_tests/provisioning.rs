//! Stories about provisioning a whole cluster and keeping its fleet alive

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use keel_channel::{Access, ChannelPolicy, Principal};
use keel_cluster::Cluster;
use keel_common::config::ClusterConfig;
use keel_common::{Error, FailureScope, WORKER_TOKEN_KEY};
use keel_fleet::InstanceEvent;

use super::helpers::*;

fn config(workers: u32, fetch_timeout_secs: u64) -> ClusterConfig {
    ClusterConfig {
        worker_min_capacity: workers,
        token_fetch: fetch_policy(fetch_timeout_secs),
        ..Default::default()
    }
}

// =============================================================================
// Story: provision, lose a spot worker, get a replacement that joins on its own
// =============================================================================

#[tokio::test(start_paused = true)]
async fn story_reclaimed_worker_is_replaced_and_rejoins() {
    let control_plane = FakeControlPlane::new();
    let provider = LocalProvider::new(control_plane.clone(), fetch_policy(900))
        .with_publish_delay(Duration::from_secs(20));

    let cluster = Cluster::provision("demo", &config(3, 900), &provider)
        .await
        .unwrap();
    assert_eq!(cluster.outputs().endpoint, "https://198.51.100.7:6443");
    assert_eq!(cluster.outputs().kubeconfig_locator, "memory://local/kubeconfig.yaml");

    let mut status = cluster.fleet().subscribe();
    let shutdown = CancellationToken::new();
    let fleet = tokio::spawn(cluster.into_fleet().run(provider.take_events(), shutdown.clone()));

    status.wait_for(|s| s.joined == 3).await.unwrap();
    let outcome = provider.control_plane_outcome().await.unwrap();
    assert_eq!(outcome.endpoint, "https://198.51.100.7:6443");
    assert_eq!(control_plane.joins(), 3);

    let launcher = provider.launcher();
    let victim = launcher.live_instances()[0].clone();
    launcher.reclaim(&victim).await.unwrap();

    status
        .wait_for(|s| s.replaced == 1 && s.joined == 3)
        .await
        .unwrap();
    assert_eq!(control_plane.joins(), 4);
    assert_eq!(control_plane.mints(), 1);
    assert_eq!(launcher.launched(), 4);
    assert!(!launcher.live_instances().contains(&victim));

    shutdown.cancel();
    let final_status = fleet.await.unwrap();
    assert!(final_status.is_ready());
    assert_eq!(final_status.replaced, 1);

    // One publish, never repeated for the replacement
    assert_eq!(provider.store().write_count(), 2);
}

// =============================================================================
// Story: a cluster whose control plane cannot publish never gets workers
// =============================================================================

#[tokio::test(start_paused = true)]
async fn story_denied_publish_surfaces_and_workers_fail_boot() {
    let control_plane = FakeControlPlane::new();
    let provider = LocalProvider::new(control_plane.clone(), fetch_policy(60))
        .with_policy(ChannelPolicy::deny_all().grant(Principal::Worker, Access::Read));

    let cluster = Cluster::provision("demo", &config(2, 60), &provider)
        .await
        .unwrap();
    assert_eq!(cluster.fleet().status().booting, 2);

    let err = provider.control_plane_outcome().await.unwrap_err();
    assert!(matches!(err, Error::Publish { ref key, .. } if key == WORKER_TOKEN_KEY));
    assert_eq!(err.scope(), FailureScope::Cluster);

    let mut events = provider.take_events();
    for _ in 0..2 {
        match events.recv().await.unwrap() {
            InstanceEvent::BootFailed { reason, .. } => assert!(reason.contains(WORKER_TOKEN_KEY), "{reason}"),
            other => panic!("expected BootFailed, got {other:?}"),
        }
    }
    assert_eq!(control_plane.join_attempts(), 0);
    assert!(provider.store().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_operator_reads_admin_bundle_with_public_endpoint() {
    let control_plane = FakeControlPlane::new();
    let provider = LocalProvider::new(control_plane, fetch_policy(900))
        .with_publish_delay(Duration::from_secs(5));

    let cluster = Cluster::provision("demo", &config(1, 900), &provider)
        .await
        .unwrap();

    let bundle = cluster.admin_credentials().await.unwrap();
    assert_eq!(bundle.server().as_deref(), Some("https://198.51.100.7:6443"));

    let json: serde_json::Value = serde_json::from_str(&cluster.outputs().to_json().unwrap()).unwrap();
    assert_eq!(json["Endpoint"], "https://198.51.100.7:6443");
    assert_eq!(json["WorkerMinCapacity"], 1);
}
