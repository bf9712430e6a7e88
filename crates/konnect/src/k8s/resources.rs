//! Reads of the reconciler's `InstrumentedApplication` resources.

use super::KubeBackend;
use crate::error::{Error, Result};
use async_trait::async_trait;
use kube::api::{DynamicObject, ListParams};
use kube::Api;
use serde_json::Value;
use tracing::{debug, instrument};

/// Read-only access to `InstrumentedApplication` documents
#[async_trait]
pub trait InstrumentationSource: Send + Sync {
    /// Fetches one resource; `None` when it does not exist.
    async fn fetch(&self, namespace: &str, name: &str) -> Result<Option<Value>>;

    /// Lists resources across all namespaces.
    async fn list(&self) -> Result<Vec<Value>>;
}

fn to_document(object: &DynamicObject) -> Result<Value> {
    serde_json::to_value(object).map_err(|e| Error::MalformedResourceDocument {
        path: format!("$ ({e})"),
        expected: "serializable",
    })
}

#[async_trait]
impl InstrumentationSource for KubeBackend {
    #[instrument(skip(self))]
    async fn fetch(&self, namespace: &str, name: &str) -> Result<Option<Value>> {
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client().clone(), namespace, self.resource());

        let object = api.get_opt(name).await.map_err(|e| Error::UpstreamRead {
            resource: format!("{} {namespace}/{name}", self.resource().kind),
            reason: e.to_string(),
        })?;

        debug!(found = object.is_some(), "Fetched instrumented application");
        object.as_ref().map(to_document).transpose()
    }

    #[instrument(skip(self))]
    async fn list(&self) -> Result<Vec<Value>> {
        let api: Api<DynamicObject> = Api::all_with(self.client().clone(), self.resource());

        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|e| Error::UpstreamList(e.to_string()))?;

        debug!(count = list.items.len(), "Listed instrumented applications");
        list.items.iter().map(to_document).collect()
    }
}
