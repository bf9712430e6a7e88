//! HTTP surface.
//!
//! - `POST /api/v1/annotate` runs one confirmation request
//! - `GET /api/v1/state` flattens every `InstrumentedApplication` in the cluster
//! - `GET /health`, `GET /ready` for probes

use crate::coordinator::{AnnotateRequest, AnnotateResponse, Coordinator};
use crate::error::{Error, Result};
use crate::instrumentation::{project_state, StateRecord};
use crate::k8s::InstrumentationSource;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{debug, error, Level};

pub const SERVICE_NAME: &str = "konnect";

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    pub resources: Arc<dyn InstrumentationSource>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/annotate", post(annotate))
        .route("/api/v1/state", get(instrumentation_state))
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .layer(
            ServiceBuilder::new()
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                        .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                        .on_response(DefaultOnResponse::new().level(Level::INFO)),
                )
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

async fn annotate(
    State(state): State<AppState>,
    body: std::result::Result<Json<AnnotateRequest>, JsonRejection>,
) -> Result<Json<AnnotateResponse>> {
    let Json(request) = body.map_err(|rejection| Error::InvalidInput(rejection.body_text()))?;
    debug!(?request, "Annotate request received");

    state.coordinator.annotate(request).await.map(Json)
}

async fn instrumentation_state(State(state): State<AppState>) -> Result<Json<Vec<StateRecord>>> {
    let documents = state.resources.list().await?;

    let mut records = Vec::with_capacity(documents.len());
    for document in &documents {
        let projected = project_state(document).inspect_err(|e| {
            error!(error = %e, "Failed to project instrumented application");
        })?;
        records.extend(projected);
    }

    debug!(count = records.len(), "Projected instrumentation state");
    Ok(Json(records))
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn readiness_check(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ready",
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "timeout_ms": u64::try_from(state.coordinator.timeout().as_millis()).unwrap_or(u64::MAX),
    }))
}
