//! Declarative manifest application.
//!
//! Raw multi-document YAML goes in, server-side apply reconciles it against
//! the live cluster. Conflict resolution is the apply machinery's problem:
//! patches are sent with a forced field manager, so re-applying the same
//! manifests is idempotent.

use async_trait::async_trait;
use kube::api::{Api, DynamicObject, Patch, PatchParams};
use kube::core::{GroupVersionKind, TypeMeta};
use kube::discovery::{Discovery, Scope};
use kube::Client;
#[cfg(test)]
use mockall::automock;
use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result};

/// Reconciles raw declarative manifests against the live cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ManifestApplier: Send + Sync {
    /// Apply every document in `manifests`, defaulting namespaced resources
    /// without an explicit namespace into `namespace`. Idempotent.
    async fn apply(&self, manifests: &[u8], namespace: &str) -> Result<()>;
}

/// [`ManifestApplier`] using Kubernetes server-side apply.
///
/// Each document's group/version/kind is resolved through API discovery, so
/// arbitrary resource kinds (including CRDs the cluster serves) work without
/// compiled-in types.
pub struct ServerSideApplier {
    client: Client,
    field_manager: String,
}

impl ServerSideApplier {
    /// Create an applier owning patches under the given field manager
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
        }
    }
}

/// Split multi-document YAML into dynamic objects, skipping empty documents
fn parse_documents(manifests: &[u8]) -> Result<Vec<DynamicObject>> {
    let mut documents = Vec::new();
    for doc in serde_yaml::Deserializer::from_slice(manifests) {
        let value = serde_yaml::Value::deserialize(doc)
            .map_err(|e| Error::apply(format!("invalid YAML: {e}")))?;
        if value.is_null() {
            continue;
        }
        let object: DynamicObject = serde_yaml::from_value(value)
            .map_err(|e| Error::apply(format!("invalid manifest document: {e}")))?;
        documents.push(object);
    }
    Ok(documents)
}

#[async_trait]
impl ManifestApplier for ServerSideApplier {
    async fn apply(&self, manifests: &[u8], namespace: &str) -> Result<()> {
        let documents = parse_documents(manifests)?;
        if documents.is_empty() {
            return Ok(());
        }

        let discovery = Discovery::new(self.client.clone())
            .run()
            .await
            .map_err(|e| Error::apply(format!("API discovery failed: {e}")))?;
        let params = PatchParams::apply(&self.field_manager).force();

        for object in documents {
            let types = object
                .types
                .clone()
                .ok_or_else(|| Error::apply("manifest document missing apiVersion/kind"))?;
            let gvk = gvk_of(&types)?;
            let name = object.metadata.name.clone().ok_or_else(|| {
                Error::apply(format!("{} manifest missing metadata.name", types.kind))
            })?;
            let (resource, capabilities) = discovery.resolve_gvk(&gvk).ok_or_else(|| {
                Error::apply(format!(
                    "cluster does not serve {}: {}",
                    types.api_version, types.kind
                ))
            })?;

            let api: Api<DynamicObject> = if capabilities.scope == Scope::Namespaced {
                let target = object.metadata.namespace.as_deref().unwrap_or(namespace);
                Api::namespaced_with(self.client.clone(), target, &resource)
            } else {
                Api::all_with(self.client.clone(), &resource)
            };

            debug!(kind = %types.kind, name = %name, "Applying manifest");
            api.patch(&name, &params, &Patch::Apply(&object))
                .await
                .map_err(|e| {
                    Error::apply(format!("could not apply {} {name}: {e}", types.kind))
                })?;
        }
        Ok(())
    }
}

fn gvk_of(types: &TypeMeta) -> Result<GroupVersionKind> {
    GroupVersionKind::try_from(types)
        .map_err(|e| Error::apply(format!("invalid apiVersion {}: {e}", types.api_version)))
}
