//! In-memory cluster with a simulated reconciler.

#![allow(dead_code)]

use async_trait::async_trait;
use konnect::annotations::{AnnotationPlan, SERVICE_NAME_ANNOTATION};
use konnect::error::{Error, Result};
use konnect::instrumentation::{ControllerKind, InstrumentationTarget};
use konnect::k8s::{InstrumentationSource, WorkloadStore};
use konnect::watch::{ChangeFeed, ChangeSubscription, SignalSenders, WatchSignal};
use konnect::{build_router, AppState, ConfirmationMode, Coordinator};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

struct Workload {
    kind: ControllerKind,
    annotations: BTreeMap<String, String>,
}

struct Subscriber {
    key: Key,
    senders: SignalSenders,
    include_workload: bool,
    token: CancellationToken,
}

#[derive(Default)]
struct ClusterState {
    workloads: HashMap<Key, Workload>,
    resources: HashMap<Key, Value>,
    subscribers: Vec<Subscriber>,
    writes: usize,
    stalled: bool,
}

/// Workloads and `InstrumentedApplication`s held in memory.
///
/// Every annotation write is answered the way the reconciler would: the
/// resource is updated one field at a time, with a spec signal per changed
/// field and a status signal when instrumentation flips.
#[derive(Clone, Default)]
pub struct FakeCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_workload(self, namespace: &str, name: &str, kind: ControllerKind) -> Self {
        self.state.lock().unwrap().workloads.insert(
            key(namespace, name),
            Workload {
                kind,
                annotations: BTreeMap::new(),
            },
        );
        self
    }

    pub fn with_resource(self, document: Value) -> Self {
        let namespace = document["metadata"]["namespace"].as_str().unwrap().to_string();
        let name = document["metadata"]["name"].as_str().unwrap().to_string();
        self.state
            .lock()
            .unwrap()
            .resources
            .insert((namespace, name), document);
        self
    }

    /// Stops the reconciler from reacting to writes.
    pub fn stall(&self) {
        self.state.lock().unwrap().stalled = true;
    }

    pub fn writes(&self) -> usize {
        self.state.lock().unwrap().writes
    }

    pub fn annotations(&self, namespace: &str, name: &str) -> BTreeMap<String, String> {
        self.state.lock().unwrap().workloads[&key(namespace, name)]
            .annotations
            .clone()
    }

    pub fn resource(&self, namespace: &str, name: &str) -> Option<Value> {
        self.state
            .lock()
            .unwrap()
            .resources
            .get(&key(namespace, name))
            .cloned()
    }
}

/// A fresh `InstrumentedApplication` owned by `kind`.
pub fn instrumented_application(namespace: &str, name: &str, kind: &str) -> Value {
    json!({
        "apiVersion": "logz.io/v1alpha1",
        "kind": "InstrumentedApplication",
        "metadata": {
            "name": name,
            "namespace": namespace,
            "ownerReferences": [{"apiVersion": "apps/v1", "kind": kind, "name": name, "uid": "1"}]
        },
        "spec": {},
        "status": {}
    })
}

fn kind_name(kind: ControllerKind) -> &'static str {
    match kind {
        ControllerKind::Deployment => "Deployment",
        ControllerKind::StatefulSet => "StatefulSet",
    }
}

type Channel = fn(&SignalSenders) -> &mpsc::Sender<WatchSignal>;

fn notify(subscribers: &mut Vec<Subscriber>, target: &Key, channel: Channel) {
    subscribers.retain(|subscriber| !subscriber.token.is_cancelled());
    for subscriber in subscribers.iter().filter(|s| &s.key == target) {
        let _ = channel(&subscriber.senders).try_send(WatchSignal);
    }
}

/// Reconciles one container of `document` towards `plan`, signalling each step.
fn reconcile(
    document: &mut Value,
    container: &str,
    plan: &AnnotationPlan,
    subscribers: &mut Vec<Subscriber>,
    target: &Key,
) {
    let log_type = plan.log_type.clone().unwrap_or_default();
    let service_name = plan.service_name.clone().unwrap_or_default();

    if document["spec"]["logType"].as_str().unwrap_or_default() != log_type {
        document["spec"]["logType"] = json!(log_type);
        notify(subscribers, target, |s| &s.spec);
    }

    if document["spec"]["languages"].as_array().is_none() {
        document["spec"]["languages"] = json!([]);
    }
    let languages = document["spec"]["languages"].as_array_mut().unwrap();
    let position = languages
        .iter()
        .position(|entry| entry["containerName"] == container);
    let entry = match position {
        Some(index) => &mut languages[index],
        None => {
            languages.push(json!({"containerName": container, "language": "java"}));
            languages.last_mut().unwrap()
        }
    };

    let previous = entry["activeServiceName"].as_str().unwrap_or_default().to_string();
    if previous != service_name {
        entry["activeServiceName"] = json!(service_name);
        notify(subscribers, target, |s| &s.spec);
    }

    if previous.is_empty() != service_name.is_empty() {
        document["status"]["tracesInstrumented"] = json!(!service_name.is_empty());
        notify(subscribers, target, |s| &s.status);
    }
}

#[async_trait]
impl WorkloadStore for FakeCluster {
    async fn apply_annotations(
        &self,
        target: &InstrumentationTarget,
        plan: &AnnotationPlan,
    ) -> Result<()> {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        let workload_key = key(&target.namespace, &target.name);

        let workload = state
            .workloads
            .get_mut(&workload_key)
            .filter(|workload| workload.kind == target.kind)
            .ok_or_else(|| Error::UpstreamRead {
                resource: target.to_string(),
                reason: "not found".to_string(),
            })?;

        let before = workload.annotations.get(SERVICE_NAME_ANNOTATION).cloned();
        plan.apply(&mut workload.annotations);
        let after = workload.annotations.get(SERVICE_NAME_ANNOTATION).cloned();
        let kind = workload.kind;
        state.writes += 1;

        if before != after {
            state
                .subscribers
                .retain(|subscriber| !subscriber.token.is_cancelled());
            for subscriber in state
                .subscribers
                .iter()
                .filter(|s| s.key == workload_key && s.include_workload)
            {
                let _ = subscriber.senders.workload.try_send(WatchSignal);
            }
        }

        if state.stalled {
            return Ok(());
        }

        let document = state
            .resources
            .entry(workload_key.clone())
            .or_insert_with(|| {
                instrumented_application(&target.namespace, &target.name, kind_name(kind))
            });
        reconcile(
            document,
            &target.container_name,
            plan,
            &mut state.subscribers,
            &workload_key,
        );

        Ok(())
    }
}

#[async_trait]
impl InstrumentationSource for FakeCluster {
    async fn fetch(&self, namespace: &str, name: &str) -> Result<Option<Value>> {
        Ok(self.resource(namespace, name))
    }

    async fn list(&self) -> Result<Vec<Value>> {
        let state = self.state.lock().unwrap();
        let mut documents: Vec<_> = state.resources.iter().collect();
        documents.sort_by(|(a, _), (b, _)| a.cmp(b));
        Ok(documents.into_iter().map(|(_, doc)| doc.clone()).collect())
    }
}

#[async_trait]
impl ChangeFeed for FakeCluster {
    async fn subscribe(
        &self,
        target: &InstrumentationTarget,
        include_workload: bool,
        _deadline: Instant,
    ) -> Result<ChangeSubscription> {
        let token = CancellationToken::new();
        let (senders, subscription) = ChangeSubscription::channel();
        self.state.lock().unwrap().subscribers.push(Subscriber {
            key: key(&target.namespace, &target.name),
            senders,
            include_workload,
            token: token.clone(),
        });
        Ok(subscription.with_teardown(token.drop_guard()))
    }
}

/// Serves the router over the fake cluster on an ephemeral port.
pub async fn spawn_app(cluster: &FakeCluster, timeout: Duration, mode: ConfirmationMode) -> String {
    let shared = Arc::new(cluster.clone());
    let coordinator = Coordinator::new(shared.clone(), shared.clone(), shared.clone())
        .with_timeout(timeout)
        .with_mode(mode);
    let app = build_router(AppState {
        coordinator: Arc::new(coordinator),
        resources: shared,
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    format!("http://{address}")
}
