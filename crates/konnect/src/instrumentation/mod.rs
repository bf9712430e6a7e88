//! Instrumentation state model.
//!
//! A request names one container of one workload ([`InstrumentationTarget`]) and
//! the state it should end up in ([`DesiredState`]). The custom resource kept by
//! the reconciler tells us where that container is today ([`ObservedState`]).

pub mod changes;
pub mod document;

use crate::error::{Error, Result};
use std::fmt;
use std::str::FromStr;

pub use changes::{classify_changes, compute_expected_changes, ChangeKind, ExpectedChangeCount};
pub use document::{observed_state, project_state, StateRecord};

/// Workload kinds whose pod templates can be annotated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControllerKind {
    Deployment,
    StatefulSet,
}

impl ControllerKind {
    /// Allow-list of supported kinds
    pub const ALL: [ControllerKind; 2] = [ControllerKind::Deployment, ControllerKind::StatefulSet];

    /// Lowercase name used on the wire
    pub fn as_str(self) -> &'static str {
        match self {
            ControllerKind::Deployment => "deployment",
            ControllerKind::StatefulSet => "statefulset",
        }
    }
}

impl fmt::Display for ControllerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ControllerKind {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        ControllerKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(value.trim()))
            .ok_or_else(|| {
                Error::InvalidInput(format!(
                    "unsupported controller kind '{value}', expected one of: deployment, statefulset"
                ))
            })
    }
}

/// The workload container a request is about
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentationTarget {
    pub name: String,
    pub namespace: String,
    pub kind: ControllerKind,
    pub container_name: String,
}

impl fmt::Display for InstrumentationTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

/// What the caller wants the container to look like
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DesiredState {
    pub log_type: Option<String>,
    pub service_name: Option<String>,
}

impl DesiredState {
    pub fn new(log_type: Option<String>, service_name: Option<String>) -> Self {
        Self {
            log_type,
            service_name,
        }
    }

    /// Log type, with absent read as ""
    pub fn log_type(&self) -> &str {
        self.log_type.as_deref().unwrap_or_default()
    }

    /// Service name, with absent read as ""
    pub fn service_name(&self) -> &str {
        self.service_name.as_deref().unwrap_or_default()
    }

    /// A non-empty service name turns trace instrumentation on
    pub fn wants_instrumentation(&self) -> bool {
        !self.service_name().is_empty()
    }
}

/// Where the reconciler says the container is
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObservedState {
    pub log_type: String,
    pub service_name: Option<String>,
}

impl ObservedState {
    /// Service name, with absent read as ""
    pub fn service_name(&self) -> &str {
        self.service_name.as_deref().unwrap_or_default()
    }

    pub fn is_instrumented(&self) -> bool {
        !self.service_name().is_empty()
    }
}

#[cfg(test)]
impl From<&DesiredState> for ObservedState {
    /// The state the reconciler converges to once it has applied `desired`.
    fn from(desired: &DesiredState) -> Self {
        Self {
            log_type: desired.log_type().to_string(),
            service_name: desired.service_name.clone().filter(|name| !name.is_empty()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_controller_kind_is_case_insensitive() {
        assert_eq!(
            "Deployment".parse::<ControllerKind>().unwrap(),
            ControllerKind::Deployment
        );
        assert_eq!(
            "STATEFULSET".parse::<ControllerKind>().unwrap(),
            ControllerKind::StatefulSet
        );
        assert_eq!(
            "deployment".parse::<ControllerKind>().unwrap(),
            ControllerKind::Deployment
        );
    }

    #[test]
    fn test_unsupported_kind_is_invalid_input() {
        let err = "CronJob".parse::<ControllerKind>().unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert!(err.to_string().contains("CronJob"));
        assert!("".parse::<ControllerKind>().is_err());
    }

    #[test]
    fn test_target_display() {
        let target = InstrumentationTarget {
            name: "svcA".to_string(),
            namespace: "ns1".to_string(),
            kind: ControllerKind::StatefulSet,
            container_name: "c1".to_string(),
        };
        assert_eq!(target.to_string(), "statefulset ns1/svcA");
    }

    #[test]
    fn test_absent_and_empty_service_name_are_equivalent() {
        let absent = DesiredState::new(None, None);
        let empty = DesiredState::new(Some(String::new()), Some(String::new()));
        assert_eq!(absent.service_name(), empty.service_name());
        assert!(!absent.wants_instrumentation());
        assert!(!empty.wants_instrumentation());
        assert_eq!(ObservedState::from(&empty), ObservedState::default());
    }
}
