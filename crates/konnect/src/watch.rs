//! Change watcher.
//!
//! A subscription runs one watch on the target's `InstrumentedApplication` and,
//! when asked for, one on the workload itself, each on its own task. Every
//! update is compared against the previous version of the same object and each
//! region that differs structurally produces one [`WatchSignal`] on that
//! region's channel:
//!
//! - `spec` of the custom resource → spec channel
//! - `status` of the custom resource → status channel
//! - service-name pod-template annotation of the workload → workload channel
//!
//! Resyncs that reproduce identical content never signal. Dropping the
//! [`ChangeSubscription`] cancels the watch tasks.

use crate::error::{Error, Result};
use crate::instrumentation::{ControllerKind, InstrumentationTarget};
use crate::k8s::{KubeBackend, PodTemplateWorkload};
use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use kube::api::DynamicObject;
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Debug;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, instrument, warn};

/// Capacity of each signal channel
pub const SIGNAL_BUFFER: usize = 8;

/// "Something changed"; which region is implied by the channel it arrives on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchSignal;

/// Channel a signal arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalSource {
    Spec,
    Status,
    Workload,
}

/// Producer side of a subscription
#[derive(Debug, Clone)]
pub struct SignalSenders {
    pub spec: mpsc::Sender<WatchSignal>,
    pub status: mpsc::Sender<WatchSignal>,
    pub workload: mpsc::Sender<WatchSignal>,
}

impl SignalSenders {
    /// Delivers one signal; false once the subscription is gone.
    pub async fn deliver(&self, source: SignalSource, token: &CancellationToken) -> bool {
        let sender = match source {
            SignalSource::Spec => &self.spec,
            SignalSource::Status => &self.status,
            SignalSource::Workload => &self.workload,
        };

        tokio::select! {
            () = token.cancelled() => false,
            sent = sender.send(WatchSignal) => sent.is_ok(),
        }
    }
}

/// Consumer side of a subscription, owned by one request
#[derive(Debug)]
pub struct ChangeSubscription {
    spec: mpsc::Receiver<WatchSignal>,
    status: mpsc::Receiver<WatchSignal>,
    workload: mpsc::Receiver<WatchSignal>,
    _teardown: Option<DropGuard>,
}

impl ChangeSubscription {
    /// Creates the three signal channels.
    pub fn channel() -> (SignalSenders, ChangeSubscription) {
        let (spec_tx, spec) = mpsc::channel(SIGNAL_BUFFER);
        let (status_tx, status) = mpsc::channel(SIGNAL_BUFFER);
        let (workload_tx, workload) = mpsc::channel(SIGNAL_BUFFER);

        (
            SignalSenders {
                spec: spec_tx,
                status: status_tx,
                workload: workload_tx,
            },
            ChangeSubscription {
                spec,
                status,
                workload,
                _teardown: None,
            },
        )
    }

    /// Ties the lifetime of background producers to this subscription.
    pub fn with_teardown(self, guard: DropGuard) -> Self {
        Self {
            _teardown: Some(guard),
            ..self
        }
    }

    /// Waits for the next signal on any channel.
    ///
    /// The workload channel is only read when `include_workload` is set.
    /// Returns `None` once every channel being read is closed. Cancel safe.
    pub async fn recv(&mut self, include_workload: bool) -> Option<SignalSource> {
        tokio::select! {
            Some(WatchSignal) = self.spec.recv() => Some(SignalSource::Spec),
            Some(WatchSignal) = self.status.recv() => Some(SignalSource::Status),
            Some(WatchSignal) = self.workload.recv(), if include_workload => Some(SignalSource::Workload),
            else => None,
        }
    }
}

/// Source of per-request change subscriptions
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Starts watching `target` and returns once the watches have synced, so
    /// that any write issued afterwards is observed. Fails if the initial
    /// sync does not finish before `deadline`.
    ///
    /// The workload itself is only watched when `include_workload` is set.
    async fn subscribe(
        &self,
        target: &InstrumentationTarget,
        include_workload: bool,
        deadline: Instant,
    ) -> Result<ChangeSubscription>;
}

/// The parts of an object whose changes are signalled
pub trait Regions: PartialEq + Send + 'static {
    fn changed_regions(&self, previous: &Self) -> Vec<SignalSource>;
}

/// `spec` and `status` of a custom resource
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceRegions {
    pub spec: Value,
    pub status: Value,
}

impl ResourceRegions {
    pub fn of(object: &DynamicObject) -> Self {
        let region = |key: &str| object.data.get(key).cloned().unwrap_or(Value::Null);
        Self {
            spec: region("spec"),
            status: region("status"),
        }
    }
}

impl Regions for ResourceRegions {
    fn changed_regions(&self, previous: &Self) -> Vec<SignalSource> {
        let mut changed = Vec::new();
        if self.spec != previous.spec {
            changed.push(SignalSource::Spec);
        }
        if self.status != previous.status {
            changed.push(SignalSource::Status);
        }
        changed
    }
}

/// Service-name annotation of a workload's pod template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadRegions {
    pub service_name: Option<String>,
}

impl WorkloadRegions {
    pub fn of<K: PodTemplateWorkload>(workload: &K) -> Self {
        Self {
            service_name: workload.service_name_annotation().map(str::to_string),
        }
    }
}

impl Regions for WorkloadRegions {
    fn changed_regions(&self, previous: &Self) -> Vec<SignalSource> {
        if self.service_name == previous.service_name {
            Vec::new()
        } else {
            vec![SignalSource::Workload]
        }
    }
}

/// Last seen version of every watched object, keyed by name
#[derive(Debug)]
pub struct Snapshots<R> {
    entries: HashMap<String, R>,
}

impl<R> Default for Snapshots<R> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<R: Regions> Snapshots<R> {
    /// Records `current` and returns the regions that changed since the last
    /// version. The first version of an object is a baseline and never signals.
    pub fn observe(&mut self, key: &str, current: R) -> Vec<SignalSource> {
        let changed = self
            .entries
            .get(key)
            .map(|previous| current.changed_regions(previous))
            .unwrap_or_default();
        self.entries.insert(key.to_string(), current);
        changed
    }

    pub fn forget(&mut self, key: &str) {
        self.entries.remove(key);
    }
}

/// Drives one watch until cancelled, turning updates into signals.
async fn run_watch<K, R>(
    api: Api<K>,
    name: String,
    project: fn(&K) -> R,
    senders: SignalSenders,
    ready: oneshot::Sender<()>,
    token: CancellationToken,
) where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
    R: Regions,
{
    let config = watcher::Config::default().fields(&format!("metadata.name={name}"));
    let mut stream = watcher::watcher(api, config).default_backoff().boxed();
    let mut ready = Some(ready);
    let mut snapshots = Snapshots::default();

    loop {
        let event = tokio::select! {
            () = token.cancelled() => break,
            event = stream.next() => event,
        };

        match event {
            Some(Ok(Event::Apply(object) | Event::InitApply(object))) => {
                let key = object.name_any();
                for source in snapshots.observe(&key, project(&object)) {
                    debug!(%key, ?source, "Qualifying update observed");
                    if !senders.deliver(source, &token).await {
                        debug!(%key, "Subscription closed, stopping watch");
                        return;
                    }
                }
            }
            Some(Ok(Event::Delete(object))) => snapshots.forget(&object.name_any()),
            Some(Ok(Event::Init)) => {}
            Some(Ok(Event::InitDone)) => {
                if let Some(ready) = ready.take() {
                    debug!(%name, "Watch synced");
                    let _ = ready.send(());
                }
            }
            Some(Err(e)) => warn!(error = %e, %name, "Watch error, backing off"),
            None => break,
        }
    }

    debug!(%name, "Watch stopped");
}

#[async_trait]
impl ChangeFeed for KubeBackend {
    #[instrument(skip(self, target, deadline), fields(workload = %target))]
    async fn subscribe(
        &self,
        target: &InstrumentationTarget,
        include_workload: bool,
        deadline: Instant,
    ) -> Result<ChangeSubscription> {
        let token = CancellationToken::new();
        let (senders, subscription) = ChangeSubscription::channel();
        let (resource_ready, resource_synced) = oneshot::channel();

        let resources: Api<DynamicObject> =
            Api::namespaced_with(self.client().clone(), &target.namespace, self.resource());
        tokio::spawn(run_watch(
            resources,
            target.name.clone(),
            ResourceRegions::of,
            senders.clone(),
            resource_ready,
            token.clone(),
        ));

        let workload_synced = if include_workload {
            let (workload_ready, workload_synced) = oneshot::channel();
            match target.kind {
                ControllerKind::Deployment => {
                    let api: Api<Deployment> =
                        Api::namespaced(self.client().clone(), &target.namespace);
                    tokio::spawn(run_watch(
                        api,
                        target.name.clone(),
                        WorkloadRegions::of::<Deployment>,
                        senders,
                        workload_ready,
                        token.clone(),
                    ));
                }
                ControllerKind::StatefulSet => {
                    let api: Api<StatefulSet> =
                        Api::namespaced(self.client().clone(), &target.namespace);
                    tokio::spawn(run_watch(
                        api,
                        target.name.clone(),
                        WorkloadRegions::of::<StatefulSet>,
                        senders,
                        workload_ready,
                        token.clone(),
                    ));
                }
            }
            Some(workload_synced)
        } else {
            None
        };

        // from here on, returning early drops the guard and stops the watch tasks
        let subscription = subscription.with_teardown(token.drop_guard());

        let synced = async {
            let workload_ok = match workload_synced {
                Some(synced) => synced.await.is_ok(),
                None => true,
            };
            resource_synced.await.is_ok() && workload_ok
        };
        match tokio::time::timeout_at(deadline, synced).await {
            Ok(true) => {
                info!(include_workload, "Change subscription established");
                Ok(subscription)
            }
            Ok(false) => Err(Error::Watch {
                resource: target.to_string(),
                reason: "watch stopped before the initial sync".to_string(),
            }),
            Err(_) => Err(Error::Watch {
                resource: target.to_string(),
                reason: "initial sync did not complete before the deadline".to_string(),
            }),
        }
    }
}
