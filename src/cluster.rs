//! Cluster lifecycle management: create, wait for baseline readiness,
//! terminate.
//!
//! [`K3dCluster`] is the live handle a test works with. Creation provisions
//! a fresh cluster through the [`ClusterProvisioner`], connects a Kubernetes
//! client to it, and bootstraps a privileged service identity. Any failure
//! after provisioning has started rolls the partially-created cluster back
//! and returns the original error; a secondary teardown failure is logged
//! and never masks the primary cause.
//!
//! The handle's connection credentials are read-only after creation and safe
//! to share across concurrent executors and queries. Teardown must happen
//! exactly once; tests sharing a handle coordinate that externally (usually
//! the owning test tears down).
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use testclusters::{K3dCli, K3dCluster};
//!
//! let cluster = K3dCluster::create(Arc::new(K3dCli::new()), "hello-world").await?;
//! cluster.wait_for_baseline_readiness().await?;
//! // ... run the test body against cluster.client() ...
//! cluster.terminate().await?;
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::{info, warn};

use crate::apply::ServerSideApplier;
use crate::error::{Error, Result};
use crate::exec::CommandExecutor;
use crate::naming;
use crate::pods::{KubePodApi, PodHandle, PodQuery};
use crate::provision::{ClusterConfig, ClusterProvisioner};
use crate::retry::{retry_classified, BackoffConfig, RetryClass};

/// Namespace the harness creates its objects in
pub const TARGET_NAMESPACE: &str = "default";

/// Value of the creator label stamped on harness-owned objects
const APP_NAME: &str = "testclusters";
/// Label key marking objects created by this harness
const CREATOR_LABEL: &str = "k3s.creator";
/// Suffix shared by the privileged identity's objects
const ADMIN_SUFFIX: &str = "ford-prefect";

/// Backoff for waiting on control-plane bootstrap convergence
fn bootstrap_backoff() -> BackoffConfig {
    BackoffConfig {
        initial_delay: Duration::from_millis(500),
        multiplier: 1.5,
        jitter_fraction: 0.0,
        max_steps: 10,
        total_cap: Duration::from_secs(30),
    }
}

/// Retry 404s while an object the API accepted becomes visible; anything
/// else is terminal.
fn until_found(err: &Error) -> RetryClass {
    match err {
        Error::Kube(kube::Error::Api(ae)) if ae.code == 404 => RetryClass::Retryable,
        _ => RetryClass::Terminal,
    }
}

/// A live, disposable cluster owned by the current test
pub struct K3dCluster {
    provisioner: Arc<dyn ClusterProvisioner>,
    name: String,
    kubeconfig: Kubeconfig,
    client: Client,
    admin_service_account: Option<String>,
}

impl fmt::Debug for K3dCluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("K3dCluster")
            .field("name", &self.name)
            .field("admin_service_account", &self.admin_service_account)
            .finish_non_exhaustive()
    }
}

impl K3dCluster {
    /// Create a completely new cluster with the default specification.
    ///
    /// This is the usual entry point of a test. The cluster name is the
    /// given prefix plus a unique hash.
    pub async fn create(provisioner: Arc<dyn ClusterProvisioner>, name_prefix: &str) -> Result<Self> {
        Self::create_with_config(provisioner, name_prefix, ClusterConfig::default()).await
    }

    /// Create a completely new cluster with an explicit specification
    pub async fn create_with_config(
        provisioner: Arc<dyn ClusterProvisioner>,
        name_prefix: &str,
        config: ClusterConfig,
    ) -> Result<Self> {
        let name = naming::generate_k8s_name(name_prefix)?;
        info!(cluster = %name, "Creating test cluster");

        // Roll back even when the provisioning run itself fails partway, so
        // half-started containers do not leak.
        if let Err(e) = provisioner.create(&name, &config).await {
            return Err(Self::rollback(provisioner.as_ref(), &name, e).await);
        }
        match Self::connect_and_bootstrap(provisioner.clone(), &name).await {
            Ok(cluster) => {
                info!(cluster = %name, "Test cluster ready");
                Ok(cluster)
            }
            Err(e) => Err(Self::rollback(provisioner.as_ref(), &name, e).await),
        }
    }

    /// Tear the partially-created cluster down and hand back the original
    /// error. A secondary teardown failure is logged, never returned.
    async fn rollback(provisioner: &dyn ClusterProvisioner, name: &str, cause: Error) -> Error {
        warn!(cluster = name, error = %cause, "Cluster setup failed, rolling back");
        if let Err(teardown) = provisioner.delete(name).await {
            warn!(
                cluster = name,
                error = %teardown,
                "Rollback teardown also failed; cluster may need manual cleanup"
            );
        }
        cause
    }

    async fn connect_and_bootstrap(
        provisioner: Arc<dyn ClusterProvisioner>,
        name: &str,
    ) -> Result<Self> {
        let kubeconfig_yaml = provisioner.kubeconfig(name).await?;
        let kubeconfig = Kubeconfig::from_yaml(&kubeconfig_yaml)
            .map_err(|e| Error::provisioning(name, format!("could not parse kubeconfig: {e}")))?;
        let config =
            Config::from_custom_kubeconfig(kubeconfig.clone(), &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    Error::provisioning(name, format!("could not build client config: {e}"))
                })?;
        let client = Client::try_from(config)?;

        let mut cluster = Self {
            provisioner,
            name: name.to_string(),
            kubeconfig,
            client,
            admin_service_account: None,
        };
        let admin = cluster.create_admin_identity().await?;
        cluster.admin_service_account = Some(admin);
        Ok(cluster)
    }

    /// Create the privileged service identity: a service account bound to a
    /// cluster-wide admin role. Returns the service account name only after
    /// the API serves it back.
    async fn create_admin_identity(&self) -> Result<String> {
        let labels = BTreeMap::from([(CREATOR_LABEL.to_string(), APP_NAME.to_string())]);

        let sa_name = format!("sa-{ADMIN_SUFFIX}");
        let sa_api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), TARGET_NAMESPACE);
        let account = ServiceAccount {
            metadata: ObjectMeta {
                name: Some(sa_name.clone()),
                namespace: Some(TARGET_NAMESPACE.to_string()),
                labels: Some(labels.clone()),
                ..Default::default()
            },
            ..Default::default()
        };
        sa_api.create(&PostParams::default(), &account).await?;

        let role_name = format!("cr-{ADMIN_SUFFIX}");
        let role = ClusterRole {
            metadata: ObjectMeta {
                name: Some(role_name.clone()),
                labels: Some(labels.clone()),
                ..Default::default()
            },
            rules: Some(vec![PolicyRule {
                verbs: vec!["*".to_string()],
                api_groups: Some(vec!["*".to_string()]),
                resources: Some(vec!["*".to_string()]),
                ..Default::default()
            }]),
            ..Default::default()
        };
        let role_api: Api<ClusterRole> = Api::all(self.client.clone());
        role_api.create(&PostParams::default(), &role).await?;

        let binding = ClusterRoleBinding {
            metadata: ObjectMeta {
                name: Some(format!("crb-{ADMIN_SUFFIX}")),
                labels: Some(labels),
                ..Default::default()
            },
            role_ref: RoleRef {
                api_group: "rbac.authorization.k8s.io".to_string(),
                kind: "ClusterRole".to_string(),
                name: role_name,
            },
            subjects: Some(vec![Subject {
                kind: "ServiceAccount".to_string(),
                name: sa_name.clone(),
                namespace: Some(TARGET_NAMESPACE.to_string()),
                ..Default::default()
            }]),
        };
        let binding_api: Api<ClusterRoleBinding> = Api::all(self.client.clone());
        binding_api.create(&PostParams::default(), &binding).await?;

        // The identity counts as provisioned only once a read observes it.
        let sa_api = sa_api.clone();
        let observed_name = sa_name.clone();
        retry_classified(&bootstrap_backoff(), "observe_admin_identity", until_found, || {
            let api = sa_api.clone();
            let name = observed_name.clone();
            async move { api.get(&name).await.map_err(Error::from) }
        })
        .await?;

        Ok(sa_name)
    }

    /// Wait until the control plane's default bootstrapping has converged.
    ///
    /// API calls issued immediately after cluster start can race internal
    /// initialization; the built-in `default` service account appearing is a
    /// usable proxy signal that it has finished.
    pub async fn wait_for_baseline_readiness(&self) -> Result<()> {
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), TARGET_NAMESPACE);
        retry_classified(&bootstrap_backoff(), "baseline_readiness", until_found, || {
            let api = api.clone();
            async move { api.get("default").await.map_err(Error::from) }
        })
        .await?;
        Ok(())
    }

    /// Shut the cluster down.
    ///
    /// Not retried: a failure here means the cluster may be left in an
    /// inconsistent state requiring manual cleanup. Calling this twice on an
    /// already-terminated cluster surfaces the provisioner's error.
    pub async fn terminate(&self) -> Result<()> {
        info!(cluster = %self.name, "Terminating test cluster");
        self.provisioner.delete(&self.name).await
    }

    /// The generated cluster identity
    pub fn name(&self) -> &str {
        &self.name
    }

    /// A Kubernetes client connected to this cluster
    pub fn client(&self) -> Client {
        self.client.clone()
    }

    /// The raw connection credentials the provisioner produced
    pub fn kubeconfig(&self) -> &Kubeconfig {
        &self.kubeconfig
    }

    /// Name of the privileged service account, once provisioned
    pub fn admin_service_account(&self) -> Option<&str> {
        self.admin_service_account.as_deref()
    }

    /// Pod API for binding query descriptors
    pub fn pod_api(&self) -> Arc<KubePodApi> {
        Arc::new(KubePodApi::new(self.client.clone()))
    }

    /// A fresh query descriptor over pods in the harness namespace
    pub fn pods(&self) -> PodQuery {
        PodQuery::namespaced(TARGET_NAMESPACE)
    }

    /// A handle for one named pod in the harness namespace
    pub fn pod(&self, name: impl Into<String>) -> PodHandle {
        PodHandle::new(self.pod_api(), TARGET_NAMESPACE, name)
    }

    /// A command executor bound to this cluster
    pub fn executor(&self) -> CommandExecutor {
        CommandExecutor::new(self.client.clone())
    }

    /// A manifest applier bound to this cluster, patching under the given
    /// field manager and defaulting into the harness namespace
    pub fn applier(&self, field_manager: impl Into<String>) -> ServerSideApplier {
        ServerSideApplier::new(self.client.clone(), field_manager)
    }
}
