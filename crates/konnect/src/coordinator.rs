//! Confirmation coordinator.
//!
//! Drives one annotate request through `Idle → Mutating → Waiting` and ends in
//! `Succeeded`, `TimedOut` or `Failed`. The number of reconciler events to wait
//! for is computed from the custom resource before anything is written, the
//! change subscription is established before the workload write, and a single
//! deadline taken at request entry bounds every wait.

use crate::annotations::AnnotationPlan;
use crate::error::{Error, Result};
use crate::instrumentation::{
    classify_changes, compute_expected_changes, observed_state, DesiredState,
    ExpectedChangeCount, InstrumentationTarget, ObservedState,
};
use crate::k8s::{InstrumentationSource, WorkloadStore};
use crate::watch::{ChangeFeed, ChangeSubscription};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// Default request deadline
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// How many signals confirm a request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConfirmationMode {
    /// Wait for one spec or status signal per expected change
    #[default]
    Counted,
    /// Any single spec, status or workload signal confirms
    FirstSignal,
}

impl ConfirmationMode {
    /// Signals needed before a request with `expected` changes succeeds.
    pub fn required_signals(self, expected: ExpectedChangeCount) -> ExpectedChangeCount {
        match self {
            ConfirmationMode::Counted => expected,
            ConfirmationMode::FirstSignal => expected.min(1),
        }
    }

    pub fn watches_workload(self) -> bool {
        matches!(self, ConfirmationMode::FirstSignal)
    }
}

impl FromStr for ConfirmationMode {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "counted" => Ok(ConfirmationMode::Counted),
            "first-signal" | "first_signal" => Ok(ConfirmationMode::FirstSignal),
            other => Err(Error::Config(format!(
                "unknown confirmation mode '{other}', expected counted or first-signal"
            ))),
        }
    }
}

/// Request lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Mutating,
    Waiting,
    Succeeded,
    TimedOut,
    Failed,
}

impl Phase {
    pub fn can_advance_to(self, next: Phase) -> bool {
        matches!(
            (self, next),
            (Phase::Idle, Phase::Mutating | Phase::Failed)
                | (Phase::Mutating, Phase::Waiting | Phase::Failed)
                | (Phase::Waiting, Phase::Succeeded | Phase::TimedOut)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Succeeded | Phase::TimedOut | Phase::Failed)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug)]
struct PhaseTracker {
    current: Phase,
}

impl PhaseTracker {
    fn new() -> Self {
        Self {
            current: Phase::Idle,
        }
    }

    fn advance(&mut self, next: Phase) {
        debug_assert!(
            self.current.can_advance_to(next),
            "illegal transition {} -> {next}",
            self.current
        );
        debug!(
            from = %self.current,
            to = %next,
            terminal = next.is_terminal(),
            "Request phase"
        );
        self.current = next;
    }
}

/// Body of `POST /api/v1/annotate`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AnnotateRequest {
    pub name: String,
    pub namespace: String,
    pub controller_kind: String,
    #[serde(default)]
    pub log_type: Option<String>,
    pub container_name: String,
    #[serde(default)]
    pub service_name: Option<String>,
}

impl AnnotateRequest {
    /// Validates the controller kind and builds the target.
    pub fn target(&self) -> Result<InstrumentationTarget> {
        Ok(InstrumentationTarget {
            name: self.name.clone(),
            namespace: self.namespace.clone(),
            kind: self.controller_kind.parse()?,
            container_name: self.container_name.clone(),
        })
    }

    pub fn desired(&self) -> DesiredState {
        DesiredState::new(self.log_type.clone(), self.service_name.clone())
    }
}

/// Successful response, echoing the request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnotateResponse {
    pub name: String,
    pub namespace: String,
    pub controller_kind: String,
    pub container_name: String,
    pub log_type: String,
    pub service_name: String,
}

impl From<AnnotateRequest> for AnnotateResponse {
    fn from(request: AnnotateRequest) -> Self {
        Self {
            name: request.name,
            namespace: request.namespace,
            controller_kind: request.controller_kind,
            container_name: request.container_name,
            log_type: request.log_type.unwrap_or_default(),
            service_name: request.service_name.unwrap_or_default(),
        }
    }
}

/// Runs annotate requests against injected collaborators
pub struct Coordinator {
    workloads: Arc<dyn WorkloadStore>,
    resources: Arc<dyn InstrumentationSource>,
    feed: Arc<dyn ChangeFeed>,
    timeout: Duration,
    mode: ConfirmationMode,
}

impl Coordinator {
    pub fn new(
        workloads: Arc<dyn WorkloadStore>,
        resources: Arc<dyn InstrumentationSource>,
        feed: Arc<dyn ChangeFeed>,
    ) -> Self {
        Self {
            workloads,
            resources,
            feed,
            timeout: DEFAULT_TIMEOUT,
            mode: ConfirmationMode::default(),
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_mode(mut self, mode: ConfirmationMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn mode(&self) -> ConfirmationMode {
        self.mode
    }

    /// Applies the requested instrumentation and waits for the reconciler.
    ///
    /// A timeout leaves the annotations in place; the reconciler may still
    /// converge after the response.
    #[instrument(
        skip(self, request),
        fields(namespace = %request.namespace, name = %request.name, kind = %request.controller_kind)
    )]
    pub async fn annotate(&self, request: AnnotateRequest) -> Result<AnnotateResponse> {
        let mut phase = PhaseTracker::new();
        let outcome = self.run(&request, &mut phase).await;

        match &outcome {
            Ok(()) => {
                phase.advance(Phase::Succeeded);
                info!("Instrumentation change confirmed");
            }
            Err(e @ Error::ConfirmationTimeout { .. }) => {
                phase.advance(Phase::TimedOut);
                warn!(
                    error = %e,
                    mutation_applied = e.mutation_applied(),
                    "Reconciler did not confirm in time, annotations left in place"
                );
            }
            Err(e @ Error::MalformedResourceDocument { .. }) => {
                phase.advance(Phase::Failed);
                error!(error = %e, "Unexpected custom resource shape");
            }
            Err(e) => {
                phase.advance(Phase::Failed);
                warn!(
                    error = %e,
                    mutation_applied = e.mutation_applied(),
                    "Annotate request failed"
                );
            }
        }

        outcome.map(|()| AnnotateResponse::from(request))
    }

    async fn run(&self, request: &AnnotateRequest, phase: &mut PhaseTracker) -> Result<()> {
        let deadline = request_deadline(Instant::now(), self.timeout)?;
        let target = request.target()?;
        let desired = request.desired();
        phase.advance(Phase::Mutating);

        let observed = self.observed(&target).await?;
        let expected = compute_expected_changes(&desired, &observed);
        let required = self.mode.required_signals(expected);
        info!(
            expected,
            required,
            changes = ?classify_changes(&desired, &observed),
            "Computed expected changes"
        );

        let mut subscription = self
            .feed
            .subscribe(&target, self.mode.watches_workload(), deadline)
            .await?;

        let plan = AnnotationPlan::for_desired(&desired);
        tokio::time::timeout_at(deadline, self.workloads.apply_annotations(&target, &plan))
            .await
            .map_err(|_| Error::UpstreamWrite {
                resource: target.to_string(),
                reason: "deadline exceeded before the write completed".to_string(),
            })??;
        phase.advance(Phase::Waiting);

        let observed_signals = wait_for_signals(
            &mut subscription,
            required,
            self.mode.watches_workload(),
            deadline,
        )
        .await;

        if observed_signals < required {
            return Err(Error::ConfirmationTimeout {
                resource: target.to_string(),
                expected: required,
                observed: observed_signals,
            });
        }

        Ok(())
    }

    async fn observed(&self, target: &InstrumentationTarget) -> Result<ObservedState> {
        match self.resources.fetch(&target.namespace, &target.name).await? {
            Some(document) => observed_state(&document, &target.container_name),
            None => {
                debug!("No instrumented application yet, treating state as empty");
                Ok(ObservedState::default())
            }
        }
    }
}

/// Deadline `timeout` after `now`, or a config error when it is not representable.
pub(crate) fn request_deadline(now: Instant, timeout: Duration) -> Result<Instant> {
    now.checked_add(timeout).ok_or_else(|| {
        Error::Config(format!(
            "request timeout of {}s is too large",
            timeout.as_secs()
        ))
    })
}

/// Counts signals until `required` arrive or the deadline passes.
async fn wait_for_signals(
    subscription: &mut ChangeSubscription,
    required: ExpectedChangeCount,
    include_workload: bool,
    deadline: Instant,
) -> ExpectedChangeCount {
    let mut observed: ExpectedChangeCount = 0;
    let mut open = true;
    let sleep = tokio::time::sleep_until(deadline);
    tokio::pin!(sleep);

    while observed < required {
        tokio::select! {
            signal = subscription.recv(include_workload), if open => match signal {
                Some(source) => {
                    observed = observed.saturating_add(1);
                    debug!(?source, observed, required, "Confirmation signal");
                }
                None => {
                    warn!(observed, required, "Change feed closed before confirmation");
                    open = false;
                }
            },
            () = &mut sleep => break,
        }
    }

    observed
}
