//! Provisioning collaborator: the external tool that creates and deletes
//! disposable clusters.
//!
//! The harness talks to the provisioner through the narrow
//! [`ClusterProvisioner`] trait so lifecycle tests can substitute fakes.
//! The shipped implementation, [`K3dCli`], shells out to the `k3d` binary,
//! which owns image pulling, container networking, and node bootstrap.

use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// k3s 1.26 image tag.
///
/// Warning: k3s releases are tagged with a `+` separator before `k3s1`, but
/// the container images use `-`.
pub const K3S_VERSION_1_26: &str = "v1.26.2-k3s1";
/// k3s 1.28 image tag
pub const K3S_VERSION_1_28: &str = "v1.28.2-k3s1";

/// Default k3s image repository
pub const DEFAULT_K3S_IMAGE_REPO: &str = "docker.io/rancher/k3s";

/// Local registry mirror configuration for a cluster under creation.
///
/// A created registry lets unpublished images-under-test be pushed into the
/// cluster; the proxy keeps public pulls working through a single endpoint.
#[derive(Clone, Debug)]
pub struct RegistryConfig {
    /// Host port the created registry listens on
    pub host_port: u16,
    /// Upstream the registry proxies cache misses to
    pub proxy_remote_url: String,
    /// Extra registries.yaml content mounted into the nodes, if any
    pub mirror_config: Option<String>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            host_port: 5000,
            proxy_remote_url: "https://registry-1.docker.io".to_string(),
            mirror_config: None,
        }
    }
}

/// Declarative specification of the cluster to provision
#[derive(Clone, Debug)]
pub struct ClusterConfig {
    /// Full k3s image reference (repository:tag)
    pub image: String,
    /// Number of server (control-plane) nodes
    pub servers: u32,
    /// Number of agent (worker) nodes
    pub agents: u32,
    /// Block cluster creation until the control plane answers
    pub wait_for_ready: bool,
    /// How long the provisioner may wait for readiness
    pub startup_timeout: Duration,
    /// Host port to expose the API server on; a random free port when unset
    pub api_host_port: Option<u16>,
    /// Optional local registry mirror
    pub registry: Option<RegistryConfig>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            image: format!("{DEFAULT_K3S_IMAGE_REPO}:{K3S_VERSION_1_28}"),
            servers: 1,
            agents: 0,
            wait_for_ready: true,
            startup_timeout: Duration::from_secs(60),
            api_host_port: None,
            registry: None,
        }
    }
}

/// Trait abstracting the cluster-provisioning tool.
///
/// Create/delete are by cluster identity; `kubeconfig` returns the raw
/// connection credentials the tool produced for that identity.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterProvisioner: Send + Sync {
    /// Provision a new cluster with the given identity and specification
    async fn create(&self, name: &str, config: &ClusterConfig) -> Result<()>;

    /// Fetch the kubeconfig YAML for a provisioned cluster
    async fn kubeconfig(&self, name: &str) -> Result<String>;

    /// Delete a provisioned cluster by identity
    async fn delete(&self, name: &str) -> Result<()>;
}

/// [`ClusterProvisioner`] backed by the `k3d` command-line tool
#[derive(Clone, Debug, Default)]
pub struct K3dCli {
    binary: Option<String>,
}

impl K3dCli {
    /// Create a provisioner invoking `k3d` from `PATH`
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a provisioner invoking a specific k3d binary
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: Some(binary.into()),
        }
    }

    fn binary(&self) -> &str {
        self.binary.as_deref().unwrap_or("k3d")
    }

    /// Check that the k3d binary is available on this machine
    pub async fn binary_available(&self) -> bool {
        Command::new("which")
            .arg(self.binary())
            .output()
            .await
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    /// Run k3d with the given arguments, capturing stdout
    async fn run(&self, cluster: &str, args: &[String]) -> Result<String> {
        debug!(binary = self.binary(), ?args, "Invoking k3d");
        let output = Command::new(self.binary())
            .args(args)
            .output()
            .await
            .map_err(|e| {
                Error::provisioning(cluster, format!("failed to spawn {}: {e}", self.binary()))
            })?;

        if !output.status.success() {
            return Err(Error::provisioning(
                cluster,
                format!(
                    "{} {} failed: {}",
                    self.binary(),
                    args.join(" "),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Build the `k3d cluster create` argument list for a cluster specification
fn create_args(name: &str, config: &ClusterConfig, api_host_port: u16) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "cluster".into(),
        "create".into(),
        name.into(),
        "--image".into(),
        config.image.clone(),
        "--servers".into(),
        config.servers.to_string(),
        "--agents".into(),
        config.agents.to_string(),
        "--api-port".into(),
        format!("127.0.0.1:{api_host_port}"),
    ];
    if config.wait_for_ready {
        args.push("--wait".into());
        args.push("--timeout".into());
        args.push(format!("{}s", config.startup_timeout.as_secs()));
    }
    if let Some(registry) = &config.registry {
        args.push("--registry-create".into());
        args.push(format!("{name}-registry:0.0.0.0:{}", registry.host_port));
    }
    args
}

/// Pick a currently-free host port to expose the API server on
fn free_host_port() -> std::io::Result<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

#[async_trait]
impl ClusterProvisioner for K3dCli {
    async fn create(&self, name: &str, config: &ClusterConfig) -> Result<()> {
        let api_host_port = match config.api_host_port {
            Some(port) => port,
            None => free_host_port().map_err(|e| {
                Error::provisioning(name, format!("could not find a free host port: {e}"))
            })?,
        };
        let mut args = create_args(name, config, api_host_port);

        // Mirror config travels as a registries.yaml file next to the CLI call.
        let mut registry_config_path = None;
        if let Some(mirror) = config
            .registry
            .as_ref()
            .and_then(|r| r.mirror_config.as_deref())
        {
            let path = std::env::temp_dir().join(format!("{name}-registries.yaml"));
            tokio::fs::write(&path, mirror).await.map_err(|e| {
                Error::provisioning(name, format!("could not write registry config: {e}"))
            })?;
            args.push("--registry-config".into());
            args.push(path.to_string_lossy().into_owned());
            registry_config_path = Some(path);
        }

        info!(cluster = name, image = %config.image, api_host_port, "Creating k3d cluster");
        let result = self.run(name, &args).await;
        if let Some(path) = registry_config_path {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                debug!(path = %path.display(), error = %e, "Could not remove registry config file");
            }
        }
        result?;
        info!(cluster = name, "k3d cluster created");
        Ok(())
    }

    async fn kubeconfig(&self, name: &str) -> Result<String> {
        self.run(
            name,
            &["kubeconfig".into(), "get".into(), name.to_string()],
        )
        .await
    }

    async fn delete(&self, name: &str) -> Result<()> {
        info!(cluster = name, "Deleting k3d cluster");
        self.run(name, &["cluster".into(), "delete".into(), name.to_string()])
            .await?;
        Ok(())
    }
}
