//! Shared helpers for the k3d integration suite

use std::sync::Arc;
use std::time::Duration;

use testclusters::{K3dCli, K3dCluster};
use tracing_subscriber::EnvFilter;

/// Poll interval for convergence assertions
pub const POLL_INTERVAL: Duration = Duration::from_secs(2);
/// How long a workload gets to converge before the assertion fails
pub const CONVERGE_TIMEOUT: Duration = Duration::from_secs(180);

/// Make the harness's retry/backoff logging visible under `--nocapture`
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

/// Provision a fresh disposable cluster and wait for its control plane to
/// finish bootstrapping.
///
/// Panics with a clear message when the k3d binary is missing, so a
/// misconfigured machine fails fast instead of half-way into a story.
pub async fn create_test_cluster() -> K3dCluster {
    init_tracing();
    let cli = K3dCli::new();
    assert!(
        cli.binary_available().await,
        "k3d binary not found on PATH - install k3d to run these tests"
    );

    let cluster = K3dCluster::create(Arc::new(cli), "tc-it")
        .await
        .expect("failed to create test cluster");
    cluster
        .wait_for_baseline_readiness()
        .await
        .expect("cluster control plane never converged");
    cluster
}
