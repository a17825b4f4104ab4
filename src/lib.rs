//! testclusters - disposable k3d clusters for Kubernetes integration tests
//!
//! This crate provisions short-lived clusters for a test, grants the test
//! privileged access, and provides the primitives to assert on converging
//! cluster state (pods reaching a phase, logs, events) without flaking on
//! transient infrastructure delays.
//!
//! # Architecture
//!
//! Cluster creation and teardown are delegated to the external `k3d` tool
//! behind a narrow provisioner trait. On top of the live cluster handle the
//! crate supplies two tightly coupled cores:
//!
//! - Resilient in-cluster command execution: a readiness gate, an exec
//!   upgrade stream, and automatic recovery from the known transient
//!   dial-reset failure, each bounded by a capped exponential backoff.
//! - Eventual-consistency queries: immutable, chainable pod query
//!   descriptors whose single-shot evaluators are polled until the cluster
//!   converges or a timeout elapses.
//!
//! # Modules
//!
//! - [`cluster`] - Cluster lifecycle (create with rollback, readiness, terminate)
//! - [`provision`] - Provisioning collaborator (`k3d` CLI)
//! - [`exec`] - In-pod command execution with transient-failure recovery
//! - [`pods`] - Pod query descriptors, convergence evaluators, events, logs
//! - [`apply`] - Declarative manifest application (server-side apply)
//! - [`retry`] - Backoff schedules, classified retry, poll-until helper
//! - [`naming`] - DNS-label-safe unique name generation
//! - [`error`] - Error types for the harness
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use testclusters::retry::poll_until;
//! use testclusters::{ExpectedStatus, K3dCli, K3dCluster, ShellCommand};
//!
//! let cluster = K3dCluster::create(Arc::new(K3dCli::new()), "my-test").await?;
//! cluster.wait_for_baseline_readiness().await?;
//!
//! cluster.applier("my-test").apply(MANIFEST_YAML, "default").await?;
//!
//! let running = cluster.pods().by_labels("app=nginx").bind(cluster.pod_api());
//! poll_until(Duration::from_secs(2), Duration::from_secs(120), || running.len(3)).await?;
//!
//! let out = cluster
//!     .executor()
//!     .execute(
//!         &cluster_pod_ref,
//!         &ShellCommand::new("nginx", ["-v"]),
//!         ExpectedStatus::Ready,
//!     )
//!     .await?;
//!
//! cluster.terminate().await?;
//! ```

#![deny(missing_docs)]

pub mod apply;
pub mod cluster;
pub mod error;
pub mod exec;
pub mod naming;
pub mod pods;
pub mod provision;
pub mod retry;

pub use apply::{ManifestApplier, ServerSideApplier};
pub use cluster::K3dCluster;
pub use error::{Error, Result};
pub use exec::{CommandExecutor, ExecOutput, ExpectedStatus, PodRef, ShellCommand};
pub use pods::{PodHandle, PodQuery};
pub use provision::{ClusterConfig, ClusterProvisioner, K3dCli, RegistryConfig};
