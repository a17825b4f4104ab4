//! Immutable pod query descriptors and convergence evaluators.
//!
//! A [`PodQuery`] describes a pod list query (namespace plus optional label
//! and field selectors). Narrowing never mutates: `by_labels`/`by_fields`
//! return a new descriptor, so a base query can be branched and reused
//! concurrently. Binding a descriptor to a lister yields a [`PodList`]
//! whose evaluators each issue exactly one live list call — nothing is
//! cached, the cluster is the source of truth.
//!
//! The evaluators are single-shot checks meant to be driven repeatedly by
//! [`crate::retry::poll_until`] (or a test framework's own loop) until the
//! cluster converges:
//!
//! ```ignore
//! let query = PodQuery::namespaced("default")
//!     .by_labels("app=nginx")
//!     .by_fields("status.phase=Running");
//! let list = query.bind(cluster.pod_api());
//! poll_until(interval, timeout, || list.len(3)).await?;
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Event, Pod};
use kube::api::{Api, ListParams, LogParams};
use kube::{Client, ResourceExt};
#[cfg(test)]
use mockall::automock;

use crate::error::{Error, Result};

/// Lists pods matching a selector set
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PodLister: Send + Sync {
    /// Execute one list call against the live cluster
    async fn list_pods(&self, namespace: &str, params: &ListParams) -> Result<Vec<Pod>>;
}

/// Reads a single pod's state, events, and logs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PodInspector: Send + Sync {
    /// Fetch the pod
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod>;
    /// List events matching an equality-based field selector
    async fn list_events(&self, namespace: &str, field_selector: &str) -> Result<Vec<Event>>;
    /// Fetch the pod's current log output (no follow)
    async fn logs(&self, namespace: &str, name: &str) -> Result<Vec<u8>>;
}

/// Kubernetes-backed implementation of [`PodLister`] and [`PodInspector`]
pub struct KubePodApi {
    client: Client,
}

impl KubePodApi {
    /// Create a pod API over the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PodLister for KubePodApi {
    async fn list_pods(&self, namespace: &str, params: &ListParams) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let list = api.list(params).await?;
        Ok(list.items)
    }
}

#[async_trait]
impl PodInspector for KubePodApi {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get(name).await?)
    }

    async fn list_events(&self, namespace: &str, field_selector: &str) -> Result<Vec<Event>> {
        let api: Api<Event> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default().fields(field_selector);
        let list = api.list(&params).await?;
        Ok(list.items)
    }

    async fn logs(&self, namespace: &str, name: &str) -> Result<Vec<u8>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let text = api.logs(name, &LogParams::default()).await?;
        Ok(text.into_bytes())
    }
}

/// Immutable description of a pod list query.
///
/// Calling a narrowing method twice overwrites the earlier selector of that
/// kind (last writer wins, no union semantics).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodQuery {
    namespace: String,
    label_selector: Option<String>,
    field_selector: Option<String>,
}

impl PodQuery {
    /// Start a query over all pods in a namespace
    pub fn namespaced(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            label_selector: None,
            field_selector: None,
        }
    }

    /// Narrow by an equality-based label selector (comma-joined for AND)
    pub fn by_labels(&self, selector: impl Into<String>) -> Self {
        Self {
            label_selector: Some(selector.into()),
            ..self.clone()
        }
    }

    /// Narrow by an equality-based field selector (comma-joined for AND)
    pub fn by_fields(&self, selector: impl Into<String>) -> Self {
        Self {
            field_selector: Some(selector.into()),
            ..self.clone()
        }
    }

    /// Bind the descriptor to a lister. Executes nothing yet.
    pub fn bind(&self, lister: Arc<dyn PodLister>) -> PodList {
        PodList {
            lister,
            query: self.clone(),
        }
    }

    fn list_params(&self) -> ListParams {
        let mut params = ListParams::default();
        if let Some(labels) = &self.label_selector {
            params = params.labels(labels);
        }
        if let Some(fields) = &self.field_selector {
            params = params.fields(fields);
        }
        params
    }

    fn selector_summary(&self) -> String {
        format!(
            "namespace={}, labels={}, fields={}",
            self.namespace,
            self.label_selector.as_deref().unwrap_or("<none>"),
            self.field_selector.as_deref().unwrap_or("<none>"),
        )
    }
}

/// A query descriptor bound to a live cluster.
///
/// Every evaluator re-queries the cluster; results are never cached.
pub struct PodList {
    lister: Arc<dyn PodLister>,
    query: PodQuery,
}

impl PodList {
    /// Execute the query and return the matching pods as plain API objects
    pub async fn raw(&self) -> Result<Vec<Pod>> {
        self.lister
            .list_pods(&self.query.namespace, &self.query.list_params())
            .await
            .map_err(|e| {
                Error::query(format!(
                    "could not list pods for {}: {e}",
                    self.query.selector_summary()
                ))
            })
    }

    /// Check that exactly `expected` pods match right now
    pub async fn len(&self, expected: usize) -> Result<()> {
        let items = self.raw().await?;
        if items.len() != expected {
            return Err(Error::not_satisfied(format!(
                "did not find expected number of pods: expected: {expected}; actual: {}",
                items.len()
            )));
        }
        Ok(())
    }

    /// Check that every matching pod is currently in the given phase
    pub async fn status_phase(&self, expected: &str) -> Result<()> {
        let items = self.raw().await?;
        for pod in &items {
            let actual = pod
                .status
                .as_ref()
                .and_then(|s| s.phase.as_deref())
                .unwrap_or("<none>");
            if actual != expected {
                return Err(Error::not_satisfied(format!(
                    "pod {} is not in expected lifecycle phase: expected: {expected}; actual: {actual}",
                    pod.name_any()
                )));
            }
        }
        Ok(())
    }

    /// Check that every matching pod satisfies `predicate`, short-circuiting
    /// on the first one that does not. `what` names the expectation in the
    /// failure message.
    pub async fn all_match<F>(&self, what: &str, predicate: F) -> Result<()>
    where
        F: Fn(&Pod) -> bool + Send + Sync,
    {
        let items = self.raw().await?;
        for pod in &items {
            if !predicate(pod) {
                return Err(Error::not_satisfied(format!(
                    "pod {} does not match: {what}",
                    pod.name_any()
                )));
            }
        }
        Ok(())
    }
}

/// Single-pod variant: point queries for one named pod
pub struct PodHandle {
    inspector: Arc<dyn PodInspector>,
    namespace: String,
    name: String,
}

impl PodHandle {
    /// Create a handle for one pod
    pub fn new(
        inspector: Arc<dyn PodInspector>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            inspector,
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Fetch the pod as a plain API object
    pub async fn raw(&self) -> Result<Pod> {
        self.inspector.get_pod(&self.namespace, &self.name).await
    }

    /// List events involving this pod.
    ///
    /// Caller-supplied field selectors are joined with an implicit
    /// `involvedObject.name=<pod>` selector (comma-join, AND semantics).
    pub async fn events(&self, extra_field_selectors: &[&str]) -> Result<Vec<Event>> {
        let mut selectors: Vec<String> = extra_field_selectors
            .iter()
            .map(|s| s.to_string())
            .collect();
        selectors.push(format!("involvedObject.name={}", self.name));
        self.inspector
            .list_events(&self.namespace, &selectors.join(","))
            .await
    }

    /// Fetch the pod's current log output. One shot, no follow mode.
    pub async fn logs(&self) -> Result<Vec<u8>> {
        self.inspector.logs(&self.namespace, &self.name).await
    }
}
