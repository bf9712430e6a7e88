//! Workload reads and annotation writes.

use super::KubeBackend;
use crate::annotations::{AnnotationPlan, SERVICE_NAME_ANNOTATION};
use crate::error::{Error, Result};
use crate::instrumentation::{ControllerKind, InstrumentationTarget};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use kube::api::PostParams;
use kube::{Api, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Debug;
use tracing::{debug, info, instrument};

/// Applies annotation plans to workloads.
///
/// One call reads the workload, edits its pod-template annotations and writes
/// it back. Read failures surface as [`Error::UpstreamRead`], write failures and
/// conflicts as [`Error::UpstreamWrite`]; nothing is retried.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WorkloadStore: Send + Sync {
    async fn apply_annotations(
        &self,
        target: &InstrumentationTarget,
        plan: &AnnotationPlan,
    ) -> Result<()>;
}

/// Workload objects that carry a pod template
pub trait PodTemplateWorkload {
    fn template_annotations(&self) -> Option<&BTreeMap<String, String>>;

    fn template_annotations_mut(&mut self) -> &mut BTreeMap<String, String>;

    /// Current value of the service-name annotation, if any
    fn service_name_annotation(&self) -> Option<&str> {
        self.template_annotations()
            .and_then(|annotations| annotations.get(SERVICE_NAME_ANNOTATION))
            .map(String::as_str)
    }
}

impl PodTemplateWorkload for Deployment {
    fn template_annotations(&self) -> Option<&BTreeMap<String, String>> {
        self.spec
            .as_ref()?
            .template
            .metadata
            .as_ref()?
            .annotations
            .as_ref()
    }

    fn template_annotations_mut(&mut self) -> &mut BTreeMap<String, String> {
        self.spec
            .get_or_insert_with(Default::default)
            .template
            .metadata
            .get_or_insert_with(Default::default)
            .annotations
            .get_or_insert_with(BTreeMap::new)
    }
}

impl PodTemplateWorkload for StatefulSet {
    fn template_annotations(&self) -> Option<&BTreeMap<String, String>> {
        self.spec
            .as_ref()?
            .template
            .metadata
            .as_ref()?
            .annotations
            .as_ref()
    }

    fn template_annotations_mut(&mut self) -> &mut BTreeMap<String, String> {
        self.spec
            .get_or_insert_with(Default::default)
            .template
            .metadata
            .get_or_insert_with(Default::default)
            .annotations
            .get_or_insert_with(BTreeMap::new)
    }
}

async fn annotate<K>(api: Api<K>, target: &InstrumentationTarget, plan: &AnnotationPlan) -> Result<()>
where
    K: PodTemplateWorkload + Resource + Clone + DeserializeOwned + Serialize + Debug,
{
    let mut workload = api
        .get_opt(&target.name)
        .await
        .map_err(|e| Error::UpstreamRead {
            resource: target.to_string(),
            reason: e.to_string(),
        })?
        .ok_or_else(|| Error::UpstreamRead {
            resource: target.to_string(),
            reason: "not found".to_string(),
        })?;

    plan.apply(workload.template_annotations_mut());
    debug!(annotations = ?workload.template_annotations(), "Annotations after plan");

    api.replace(&target.name, &PostParams::default(), &workload)
        .await
        .map_err(|e| Error::UpstreamWrite {
            resource: target.to_string(),
            reason: e.to_string(),
        })?;

    Ok(())
}

#[async_trait]
impl WorkloadStore for KubeBackend {
    #[instrument(skip(self, target, plan), fields(workload = %target))]
    async fn apply_annotations(
        &self,
        target: &InstrumentationTarget,
        plan: &AnnotationPlan,
    ) -> Result<()> {
        info!(action = plan.action, "Updating workload annotations");
        match target.kind {
            ControllerKind::Deployment => {
                let api: Api<Deployment> = Api::namespaced(self.client().clone(), &target.namespace);
                annotate(api, target, plan).await
            }
            ControllerKind::StatefulSet => {
                let api: Api<StatefulSet> =
                    Api::namespaced(self.client().clone(), &target.namespace);
                annotate(api, target, plan).await
            }
        }
    }
}
