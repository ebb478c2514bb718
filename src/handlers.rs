use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{
    controller::{Controller, TriggerHandle},
    domain_filter::DomainFilter,
};

// ─────────────────────────────────────────────────────────────────────────────
// Shared application state
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct AppState {
    pub controller: Controller,
    pub trigger: TriggerHandle,
    pub domain_filter: DomainFilter,
}

impl AppState {
    pub fn new(controller: Controller, domain_filter: DomainFilter) -> Self {
        let trigger = controller.trigger_handle();
        Self {
            controller,
            trigger,
            domain_filter,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/",        get(domain_filter))
        .route("/healthz", get(healthz))
        .route("/changes", get(last_changes))
        .route("/trigger", post(trigger))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ── GET /healthz ──────────────────────────────────────────────────────────────

pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({"status": "ok"})))
}

// ── GET / ─────────────────────────────────────────────────────────────────────
// Which domains this instance manages.

pub async fn domain_filter(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "filter": state.domain_filter,
        "zones": state.controller.zones(),
    }))
}

// ── GET /changes ──────────────────────────────────────────────────────────────
// Report of the last finished cycle, including the planned changes per zone.

pub async fn last_changes(State(state): State<AppState>) -> Response {
    match state.controller.last_report() {
        Some(report) => Json(report).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "no cycle has finished yet"})),
        )
            .into_response(),
    }
}

// ── POST /trigger ─────────────────────────────────────────────────────────────
// External change notification; the scheduler debounces it.

pub async fn trigger(State(state): State<AppState>) -> impl IntoResponse {
    info!("POST /trigger → reconcile requested");
    state.trigger.trigger();
    StatusCode::ACCEPTED
}
