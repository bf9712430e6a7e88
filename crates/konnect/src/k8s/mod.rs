//! Kubernetes-backed collaborators.
//!
//! [`KubeBackend`] wraps one long-lived [`kube::Client`] and implements the
//! workload store, the custom-resource source and the change feed the
//! coordinator is built from.

pub mod resources;
pub mod workload;

use crate::config::CredentialSource;
use crate::error::{Error, Result};
use kube::api::{ApiResource, GroupVersionKind};
use kube::config::KubeConfigOptions;
use kube::Client;
use tracing::info;

pub use resources::InstrumentationSource;
pub use workload::{PodTemplateWorkload, WorkloadStore};

/// API group of the reconciler's custom resource
pub const RESOURCE_GROUP: &str = "logz.io";
pub const RESOURCE_VERSION: &str = "v1alpha1";
pub const RESOURCE_KIND: &str = "InstrumentedApplication";
pub const RESOURCE_PLURAL: &str = "instrumentedapplications";

/// `ApiResource` for `instrumentedapplications.logz.io/v1alpha1`
pub fn instrumented_application_resource() -> ApiResource {
    let gvk = GroupVersionKind::gvk(RESOURCE_GROUP, RESOURCE_VERSION, RESOURCE_KIND);
    ApiResource::from_gvk_with_plural(&gvk, RESOURCE_PLURAL)
}

/// Shared Kubernetes access for all requests
#[derive(Clone)]
pub struct KubeBackend {
    client: Client,
    resource: ApiResource,
}

impl KubeBackend {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            resource: instrumented_application_resource(),
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub(crate) fn resource(&self) -> &ApiResource {
        &self.resource
    }
}

/// Builds a client from the configured credential source.
pub async fn connect(source: CredentialSource) -> Result<Client> {
    let config = match source {
        CredentialSource::Auto => kube::Config::infer()
            .await
            .map_err(|e| Error::Config(format!("failed to infer kubernetes config: {e}")))?,
        CredentialSource::InCluster => kube::Config::incluster()
            .map_err(|e| Error::Config(format!("failed to load in-cluster config: {e}")))?,
        CredentialSource::Kubeconfig => {
            kube::Config::from_kubeconfig(&KubeConfigOptions::default())
                .await
                .map_err(|e| Error::Config(format!("failed to load kubeconfig: {e}")))?
        }
    };

    info!(
        cluster_url = %config.cluster_url,
        default_namespace = %config.default_namespace,
        ?source,
        "Resolved Kubernetes configuration"
    );

    Client::try_from(config)
        .map_err(|e| Error::Config(format!("failed to create kubernetes client: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instrumented_application_resource() {
        let resource = instrumented_application_resource();
        assert_eq!(resource.group, "logz.io");
        assert_eq!(resource.version, "v1alpha1");
        assert_eq!(resource.api_version, "logz.io/v1alpha1");
        assert_eq!(resource.kind, "InstrumentedApplication");
        assert_eq!(resource.plural, "instrumentedapplications");
    }
}
