//! Integration tests for pod queries and convergence assertions
//!
//! These tests tell the story of synchronizing test logic with asynchronous
//! cluster convergence: apply a manifest, then poll single-shot evaluators
//! until the live state matches.

use testclusters::retry::poll_until;
use testclusters::ManifestApplier;

use super::helpers::{create_test_cluster, CONVERGE_TIMEOUT, POLL_INTERVAL};

const NGINX_DEPLOYMENT: &str = r#"
apiVersion: apps/v1
kind: Deployment
metadata:
  name: nginx
  labels:
    app: nginx
spec:
  replicas: 3
  selector:
    matchLabels:
      app: nginx
  template:
    metadata:
      labels:
        app: nginx
    spec:
      containers:
      - name: nginx
        image: nginx:1.25-alpine
"#;

/// Story: a deployment converges and the assertions track it
///
/// Right after apply, fewer than 3 pods are Running and `len` reports the
/// shortfall; polling the same immutable descriptor eventually passes once
/// the third replica comes up.
#[tokio::test]
#[ignore = "requires docker and k3d - run with: cargo test --test k3d -- --ignored"]
async fn story_deployment_rollout_converges_under_polling() {
    let cluster = create_test_cluster().await;

    cluster
        .applier("pod-queries-test")
        .apply(NGINX_DEPLOYMENT.as_bytes(), "default")
        .await
        .expect("apply failed");

    let running = cluster
        .pods()
        .by_labels("app=nginx")
        .by_fields("status.phase=Running")
        .bind(cluster.pod_api());

    poll_until(POLL_INTERVAL, CONVERGE_TIMEOUT, || running.len(3))
        .await
        .expect("deployment never reached 3 running pods");

    // The same live set satisfies the phase assertion
    let all_nginx = cluster
        .pods()
        .by_labels("app=nginx")
        .bind(cluster.pod_api());
    poll_until(POLL_INTERVAL, CONVERGE_TIMEOUT, || {
        all_nginx.status_phase("Running")
    })
    .await
    .expect("not all nginx pods are Running");

    cluster.terminate().await.expect("teardown failed");
}

/// Story: single-pod inspection reaches events and logs
#[tokio::test]
#[ignore = "requires docker and k3d - run with: cargo test --test k3d -- --ignored"]
async fn story_single_pod_events_and_logs_are_reachable() {
    let cluster = create_test_cluster().await;

    cluster
        .applier("pod-queries-test")
        .apply(NGINX_DEPLOYMENT.as_bytes(), "default")
        .await
        .expect("apply failed");

    let running = cluster
        .pods()
        .by_labels("app=nginx")
        .by_fields("status.phase=Running")
        .bind(cluster.pod_api());
    poll_until(POLL_INTERVAL, CONVERGE_TIMEOUT, || running.len(3))
        .await
        .expect("deployment never converged");

    let pods = running.raw().await.expect("list failed");
    let name = pods[0]
        .metadata
        .name
        .clone()
        .expect("pod without a name");
    let handle = cluster.pod(&name);

    // Scheduling produces at least one event involving the pod
    let events = handle.events(&[]).await.expect("event query failed");
    assert!(!events.is_empty(), "no events for pod {name}");

    // nginx writes its startup notice to the log
    let logs = handle.logs().await.expect("log fetch failed");
    assert!(!logs.is_empty(), "no logs for pod {name}");

    cluster.terminate().await.expect("teardown failed");
}
