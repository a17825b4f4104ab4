//! Integration tests for the testclusters harness
//!
//! These tests tell the story of how a test author uses disposable clusters
//! in real scenarios.
//!
//! # Test Organization
//!
//! - `cluster_lifecycle`: Stories about creating and terminating clusters,
//!   including the guarantees around the privileged identity and teardown
//!
//! - `pod_queries`: Stories about asserting convergence with query
//!   descriptors after applying manifests
//!
//! - `command_exec`: Stories about running commands inside pods and the
//!   readiness gate in front of them
//!
//! # Running These Tests
//!
//! ```bash
//! cargo test --test k3d -- --ignored --nocapture
//! ```

mod cluster_lifecycle;
mod command_exec;
mod helpers;
mod pod_queries;
