//! konnect - instrumentation control surface for Kubernetes workloads.
//!
//! A request asks for a container to be instrumented (or rolled back). konnect
//! writes the pod-template annotations the instrumentation reconciler watches,
//! then holds the request open until the reconciler's `InstrumentedApplication`
//! resource has changed as many times as the request implies:
//!
//! 1. [`instrumentation`] reads the current state out of the custom resource and
//!    counts the expected reconciler events.
//! 2. [`watch`] subscribes to the custom resource and, in first-signal mode,
//!    the workload.
//! 3. [`k8s`] writes the annotations.
//! 4. [`coordinator`] waits for the events or the deadline.

pub mod annotations;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod instrumentation;
pub mod k8s;
pub mod server;
pub mod telemetry;
pub mod watch;

pub use config::Config;
pub use coordinator::{AnnotateRequest, AnnotateResponse, ConfirmationMode, Coordinator};
pub use error::{Error, Result};
pub use server::{build_router, AppState};
