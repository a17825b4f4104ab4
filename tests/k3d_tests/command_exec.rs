//! Integration tests for in-pod command execution
//!
//! These tests tell the story of running commands inside cluster pods: the
//! readiness gate in front of the exec stream, the captured output, and the
//! diagnosis a test gets when the gate never opens.

use std::time::Duration;

use testclusters::retry::BackoffConfig;
use testclusters::{Error, ExpectedStatus, ManifestApplier, PodRef, ShellCommand};

use super::helpers::create_test_cluster;

const SLEEPER_POD: &str = r#"
apiVersion: v1
kind: Pod
metadata:
  name: busybox-exec
  labels:
    app: busybox-exec
spec:
  restartPolicy: Never
  terminationGracePeriodSeconds: 1
  containers:
  - name: busybox
    image: busybox:1.36
    command: ["sh", "-c", "sleep 300"]
"#;

const UNSCHEDULABLE_POD: &str = r#"
apiVersion: v1
kind: Pod
metadata:
  name: busybox-stuck
spec:
  nodeSelector:
    disktype: does-not-exist
  containers:
  - name: busybox
    image: busybox:1.36
    command: ["sh", "-c", "sleep 300"]
"#;

/// Story: a command runs once the pod is up, and its output comes back
///
/// The executor waits out the image pull and container start on its own;
/// the test never sleeps explicitly.
#[tokio::test]
#[ignore = "requires docker and k3d - run with: cargo test --test k3d -- --ignored"]
async fn story_exec_waits_for_the_pod_and_captures_output() {
    let cluster = create_test_cluster().await;

    cluster
        .applier("command-exec-test")
        .apply(SLEEPER_POD.as_bytes(), "default")
        .await
        .expect("apply failed");

    let output = cluster
        .executor()
        .execute(
            &PodRef::new("default", "busybox-exec"),
            &ShellCommand::new("sh", ["-c", "echo hello from the cluster"]),
            ExpectedStatus::Ready,
        )
        .await
        .expect("exec failed");

    assert_eq!(output.stdout_utf8(), "hello from the cluster\n");
    assert!(output.stderr.is_empty());

    cluster.terminate().await.expect("teardown failed");
}

/// Story: stderr is captured separately from stdout
#[tokio::test]
#[ignore = "requires docker and k3d - run with: cargo test --test k3d -- --ignored"]
async fn story_exec_separates_stdout_from_stderr() {
    let cluster = create_test_cluster().await;

    cluster
        .applier("command-exec-test")
        .apply(SLEEPER_POD.as_bytes(), "default")
        .await
        .expect("apply failed");

    let output = cluster
        .executor()
        .execute(
            &PodRef::new("default", "busybox-exec"),
            &ShellCommand::new("sh", ["-c", "echo out; echo err 1>&2"]),
            ExpectedStatus::Started,
        )
        .await
        .expect("exec failed");

    assert_eq!(output.stdout_utf8(), "out\n");
    assert_eq!(output.stderr_utf8(), "err\n");

    cluster.terminate().await.expect("teardown failed");
}

/// Story: a pod that cannot start produces a diagnosable timeout
///
/// With a tight gate budget, the executor reports what it last observed
/// instead of hanging for the full production schedule.
#[tokio::test]
#[ignore = "requires docker and k3d - run with: cargo test --test k3d -- --ignored"]
async fn story_gate_timeout_reports_last_observed_state() {
    let cluster = create_test_cluster().await;

    cluster
        .applier("command-exec-test")
        .apply(UNSCHEDULABLE_POD.as_bytes(), "default")
        .await
        .expect("apply failed");

    let executor = cluster.executor().gate_backoff(BackoffConfig {
        initial_delay: Duration::from_secs(1),
        multiplier: 1.0,
        jitter_fraction: 0.0,
        max_steps: 5,
        total_cap: Duration::from_secs(10),
    });

    let err = executor
        .execute(
            &PodRef::new("default", "busybox-stuck"),
            &ShellCommand::new("date", Vec::<String>::new()),
            ExpectedStatus::Started,
        )
        .await
        .expect_err("an unschedulable pod must not pass the gate");

    match err {
        Error::PreconditionTimeout {
            pod, last_observed, ..
        } => {
            assert_eq!(pod, "default/busybox-stuck");
            assert_eq!(last_observed, "Pending");
        }
        other => panic!("expected PreconditionTimeout, got {other}"),
    }

    cluster.terminate().await.expect("teardown failed");
}
