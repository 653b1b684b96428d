// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP routers.
//!
//! The public router accepts webhooks on every registered mount path and
//! forwards them. The internal router (loopback only) serves the same mount
//! paths with workflow-start handlers, which is where the forwarder delivers,
//! plus run management under `/_internal`.

pub mod events;
pub mod ingress;
pub mod runs;
pub mod start;

use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{any, get, post};
use serde_json::{Value, json};
use switchyard_core::{CronSource, DeliveryQueue, EventDispatcher, StepRuntime, TriggerRegistry};
use tower_http::trace::TraceLayer;
use tracing::warn;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    /// Step runtime.
    pub runtime: Arc<StepRuntime>,
    /// Registered routes and triggers.
    pub registry: Arc<TriggerRegistry>,
    /// Forwards webhooks to the internal listener.
    pub dispatcher: Arc<EventDispatcher>,
    /// Delivery queue for injected events.
    pub queue: DeliveryQueue,
    /// Cron source, for the manual test event.
    pub cron: Arc<CronSource>,
}

const PUBLIC_HEALTH_PATH: &str = "/health";

/// Router for the public listener.
pub fn build_public_router(state: AppState) -> Router {
    let mut router = Router::new().route(PUBLIC_HEALTH_PATH, get(public_health));
    for route in state.registry.routes() {
        if route.mount_path == PUBLIC_HEALTH_PATH {
            warn!(mount_path = %route.mount_path, "Mount path shadowed by health check, skipping");
            continue;
        }
        router = router.route(&route.mount_path, any(ingress::accept_webhook));
    }
    router.layer(TraceLayer::new_for_http()).with_state(state)
}

/// Router for the loopback listener.
pub fn build_internal_router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/_internal/health", get(internal_health))
        .route(
            "/_internal/workflows/{workflow_id}/start",
            post(start::start_workflow),
        )
        .route("/_internal/runs", get(runs::list_runs))
        .route("/_internal/runs/{run_id}", get(runs::get_run))
        .route("/_internal/runs/{run_id}/events", get(runs::list_events))
        .route("/_internal/runs/{run_id}/advance", post(runs::advance_run))
        .route("/_internal/runs/{run_id}/resume", post(runs::resume_run))
        .route("/_internal/runs/{run_id}/cancel", post(runs::cancel_run))
        .route("/_internal/events", post(events::inject_event));
    for route in state.registry.routes() {
        router = router.route(&route.mount_path, any(start::start_from_route));
    }
    router.layer(TraceLayer::new_for_http()).with_state(state)
}

async fn public_health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn internal_health(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    match state.runtime.persistence().health_check_db().await {
        Ok(true) => (
            StatusCode::OK,
            Json(json!({ "status": "ok", "database": "ok" })),
        ),
        Ok(false) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "degraded", "database": "unavailable" })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "degraded", "database": e.to_string() })),
        ),
    }
}
