//! Pod-template annotations read by the reconciler.

use crate::instrumentation::DesiredState;
use std::collections::BTreeMap;

/// Log type the log shipper should parse the container output as
pub const LOG_TYPE_ANNOTATION: &str = "logz.io/application_type";
/// Instrumentation action, `"true"` or `"rollback"`
pub const INSTRUMENTATION_ANNOTATION: &str = "logz.io/traces_instrument";
/// Service name reported with the container's traces
pub const SERVICE_NAME_ANNOTATION: &str = "logz.io/service-name";

pub const ACTION_INSTRUMENT: &str = "true";
pub const ACTION_ROLLBACK: &str = "rollback";

/// The annotation edits one request makes to a workload's pod template.
///
/// `None` entries are deleted rather than written as empty strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotationPlan {
    pub log_type: Option<String>,
    pub action: &'static str,
    pub service_name: Option<String>,
}

impl AnnotationPlan {
    pub fn for_desired(desired: &DesiredState) -> Self {
        let non_empty = |value: &str| (!value.is_empty()).then(|| value.to_string());

        Self {
            log_type: non_empty(desired.log_type()),
            action: if desired.wants_instrumentation() {
                ACTION_INSTRUMENT
            } else {
                ACTION_ROLLBACK
            },
            service_name: non_empty(desired.service_name()),
        }
    }

    /// Applies the plan in place, leaving unrelated annotations untouched.
    pub fn apply(&self, annotations: &mut BTreeMap<String, String>) {
        set_or_remove(annotations, LOG_TYPE_ANNOTATION, self.log_type.as_deref());
        annotations.insert(
            INSTRUMENTATION_ANNOTATION.to_string(),
            self.action.to_string(),
        );
        set_or_remove(
            annotations,
            SERVICE_NAME_ANNOTATION,
            self.service_name.as_deref(),
        );
    }
}

fn set_or_remove(annotations: &mut BTreeMap<String, String>, key: &str, value: Option<&str>) {
    match value {
        Some(value) => {
            annotations.insert(key.to_string(), value.to_string());
        }
        None => {
            annotations.remove(key);
        }
    }
}
