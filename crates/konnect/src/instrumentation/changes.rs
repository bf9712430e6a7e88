//! Expected-change calculation.
//!
//! The reconciler reacts to one annotation update with a series of custom
//! resource updates: one spec update per changed field, plus a status update
//! when trace instrumentation is switched on or off. The count computed here
//! is the number of those updates a request has to wait for.

use super::{DesiredState, ObservedState};

/// Number of qualifying reconciliation events a request waits for (0..=4)
pub type ExpectedChangeCount = u8;

/// One reconciliation event a mutation is expected to cause
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    LogTypeChanged,
    ServiceNameChanged,
    /// Instrumentation goes from off to on; reported through status
    InstrumentationEnabled,
    /// Instrumentation goes from on to off; reported through status
    InstrumentationDisabled,
}

/// Lists the events moving from `observed` to `desired` should produce.
pub fn classify_changes(desired: &DesiredState, observed: &ObservedState) -> Vec<ChangeKind> {
    let mut changes = Vec::with_capacity(4);

    if desired.log_type() != observed.log_type {
        changes.push(ChangeKind::LogTypeChanged);
    }

    if desired.service_name() != observed.service_name() {
        changes.push(ChangeKind::ServiceNameChanged);
    }

    match (observed.is_instrumented(), desired.wants_instrumentation()) {
        (false, true) => changes.push(ChangeKind::InstrumentationEnabled),
        (true, false) => changes.push(ChangeKind::InstrumentationDisabled),
        _ => {}
    }

    changes
}

/// Number of qualifying events to wait for before the change counts as confirmed.
pub fn compute_expected_changes(
    desired: &DesiredState,
    observed: &ObservedState,
) -> ExpectedChangeCount {
    classify_changes(desired, observed).len() as ExpectedChangeCount
}
