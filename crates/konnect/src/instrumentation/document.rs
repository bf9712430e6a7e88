//! Typed projections over `InstrumentedApplication` documents.
//!
//! The custom resource is read as an untyped JSON tree because its schema is
//! owned by the reconciler. Absent fields are absent; fields of the wrong type
//! are reported as [`Error::MalformedResourceDocument`] instead of coerced.
//!
//! ```text
//! spec:
//!   logType: string
//!   languages:    [{containerName, language, activeServiceName}]
//!   applications: [{containerName, application, activeServiceName}]
//! status:
//!   tracesInstrumented: bool
//!   metricsInstrumented: bool
//!   opentelemetryPreconfigured: bool
//!   instrumentationDetection: {phase}
//! ```

use super::ObservedState;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

type Object = Map<String, Value>;

fn as_object<'a>(value: &'a Value, path: &str) -> Result<&'a Object> {
    value
        .as_object()
        .ok_or_else(|| Error::malformed(path, "an object"))
}

/// Looks up `key`, reading JSON `null` as absent.
fn field<'a>(parent: &'a Object, key: &str) -> Option<&'a Value> {
    parent.get(key).filter(|value| !value.is_null())
}

fn optional_object<'a>(parent: &'a Object, key: &str, path: &str) -> Result<Option<&'a Object>> {
    field(parent, key)
        .map(|value| as_object(value, &format!("{path}.{key}")))
        .transpose()
}

fn optional_array<'a>(parent: &'a Object, key: &str, path: &str) -> Result<Option<&'a [Value]>> {
    field(parent, key)
        .map(|value| {
            value
                .as_array()
                .map(Vec::as_slice)
                .ok_or_else(|| Error::malformed(format!("{path}.{key}"), "an array"))
        })
        .transpose()
}

fn optional_str<'a>(parent: &'a Object, key: &str, path: &str) -> Result<Option<&'a str>> {
    field(parent, key)
        .map(|value| {
            value
                .as_str()
                .ok_or_else(|| Error::malformed(format!("{path}.{key}"), "a string"))
        })
        .transpose()
}

fn optional_bool(parent: &Object, key: &str, path: &str) -> Result<Option<bool>> {
    field(parent, key)
        .map(|value| {
            value
                .as_bool()
                .ok_or_else(|| Error::malformed(format!("{path}.{key}"), "a boolean"))
        })
        .transpose()
}

fn required_str<'a>(parent: &'a Object, key: &str, path: &str) -> Result<&'a str> {
    optional_str(parent, key, path)?.ok_or_else(|| Error::malformed(format!("{path}.{key}"), "a string"))
}

/// Which spec list a container entry came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryList {
    Languages,
    Applications,
}

impl EntryList {
    fn key(self) -> &'static str {
        match self {
            EntryList::Languages => "languages",
            EntryList::Applications => "applications",
        }
    }

    fn label_key(self) -> &'static str {
        match self {
            EntryList::Languages => "language",
            EntryList::Applications => "application",
        }
    }
}

/// One per-container entry of `spec.languages` or `spec.applications`
#[derive(Debug, Clone, PartialEq, Eq)]
struct ContainerEntry<'a> {
    list: EntryList,
    container_name: &'a str,
    label: Option<&'a str>,
    active_service_name: Option<&'a str>,
}

/// Spec lists, `None` when the list is not present at all
struct SpecView<'a> {
    log_type: &'a str,
    languages: Option<Vec<ContainerEntry<'a>>>,
    applications: Option<Vec<ContainerEntry<'a>>>,
}

fn entries<'a>(spec: &'a Object, list: EntryList) -> Result<Option<Vec<ContainerEntry<'a>>>> {
    let Some(items) = optional_array(spec, list.key(), "spec")? else {
        return Ok(None);
    };

    items
        .iter()
        .enumerate()
        .map(|(index, item)| {
            let path = format!("spec.{}[{index}]", list.key());
            let entry = as_object(item, &path)?;
            Ok(ContainerEntry {
                list,
                container_name: required_str(entry, "containerName", &path)?,
                label: optional_str(entry, list.label_key(), &path)?,
                active_service_name: optional_str(entry, "activeServiceName", &path)?,
            })
        })
        .collect::<Result<Vec<_>>>()
        .map(Some)
}

fn spec_view(document: &Value) -> Result<SpecView<'_>> {
    let root = as_object(document, "$")?;
    let Some(spec) = optional_object(root, "spec", "$")? else {
        return Ok(SpecView {
            log_type: "",
            languages: None,
            applications: None,
        });
    };

    Ok(SpecView {
        log_type: optional_str(spec, "logType", "spec")?.unwrap_or_default(),
        languages: entries(spec, EntryList::Languages)?,
        applications: entries(spec, EntryList::Applications)?,
    })
}

/// Reads the current state of `container_name` from an `InstrumentedApplication`.
///
/// Languages are searched before applications and the first entry naming the
/// container wins. A document without a matching entry describes a container
/// that was never instrumented.
pub fn observed_state(document: &Value, container_name: &str) -> Result<ObservedState> {
    let view = spec_view(document)?;

    let active_service_name = view
        .languages
        .iter()
        .chain(view.applications.iter())
        .flatten()
        .find(|entry| entry.container_name == container_name)
        .and_then(|entry| entry.active_service_name)
        .filter(|name| !name.is_empty())
        .map(str::to_string);

    Ok(ObservedState {
        log_type: view.log_type.to_string(),
        service_name: active_service_name,
    })
}

/// One row of `GET /api/v1/state`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateRecord {
    pub name: String,
    pub namespace: String,
    pub controller_kind: String,
    pub container_name: Option<String>,
    pub traces_instrumented: bool,
    pub metrics_instrumented: bool,
    pub traces_instrumentable: bool,
    pub application: Option<String>,
    pub language: Option<String>,
    pub service_name: Option<String>,
    pub log_type: Option<String>,
    pub opentelemetry_preconfigured: bool,
    pub detection_status: Option<String>,
}

struct StatusView<'a> {
    traces_instrumented: bool,
    metrics_instrumented: bool,
    opentelemetry_preconfigured: bool,
    detection_status: Option<&'a str>,
}

fn status_view(root: &Object) -> Result<StatusView<'_>> {
    let Some(status) = optional_object(root, "status", "$")? else {
        return Ok(StatusView {
            traces_instrumented: false,
            metrics_instrumented: false,
            opentelemetry_preconfigured: false,
            detection_status: None,
        });
    };

    let detection_status = match optional_object(status, "instrumentationDetection", "status")? {
        Some(detection) => optional_str(detection, "phase", "status.instrumentationDetection")?,
        None => None,
    };

    Ok(StatusView {
        traces_instrumented: optional_bool(status, "tracesInstrumented", "status")?
            .unwrap_or(false),
        metrics_instrumented: optional_bool(status, "metricsInstrumented", "status")?
            .unwrap_or(false),
        opentelemetry_preconfigured: optional_bool(status, "opentelemetryPreconfigured", "status")?
            .unwrap_or(false),
        detection_status,
    })
}

/// Lowercased kind of the first owner reference, i.e. the workload kind.
fn owner_kind(metadata: &Object) -> Result<String> {
    let owners = optional_array(metadata, "ownerReferences", "metadata")?
        .filter(|owners| !owners.is_empty())
        .ok_or_else(|| Error::malformed("metadata.ownerReferences", "a non-empty array"))?;
    let owner = as_object(&owners[0], "metadata.ownerReferences[0]")?;
    Ok(required_str(owner, "kind", "metadata.ownerReferences[0]")?.to_lowercase())
}

/// Flattens one `InstrumentedApplication` into a record per container entry.
///
/// A document with neither list still yields one record describing the
/// workload without container details.
pub fn project_state(document: &Value) -> Result<Vec<StateRecord>> {
    let root = as_object(document, "$")?;
    let metadata = optional_object(root, "metadata", "$")?
        .ok_or_else(|| Error::malformed("metadata", "an object"))?;
    let view = spec_view(document)?;
    let status = status_view(root)?;

    let base = StateRecord {
        name: required_str(metadata, "name", "metadata")?.to_string(),
        namespace: required_str(metadata, "namespace", "metadata")?.to_string(),
        controller_kind: owner_kind(metadata)?,
        traces_instrumented: status.traces_instrumented,
        metrics_instrumented: status.metrics_instrumented,
        log_type: Some(view.log_type.to_string()),
        opentelemetry_preconfigured: status.opentelemetry_preconfigured,
        detection_status: status.detection_status.map(str::to_string),
        ..StateRecord::default()
    };

    if view.languages.is_none() && view.applications.is_none() {
        return Ok(vec![base]);
    }

    let records = view
        .languages
        .iter()
        .chain(view.applications.iter())
        .flatten()
        .map(|entry| {
            let label = entry.label.map(str::to_string);
            let (language, application) = match entry.list {
                EntryList::Languages => (label, None),
                EntryList::Applications => (None, label),
            };
            StateRecord {
                container_name: Some(entry.container_name.to_string()),
                traces_instrumentable: entry.list == EntryList::Languages,
                language,
                application,
                service_name: entry.active_service_name.map(str::to_string),
                ..base.clone()
            }
        })
        .collect();

    Ok(records)
}
