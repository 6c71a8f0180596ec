//! REST endpoints for onboarding panels.
//!
//! The acting tenant comes from the `x-tenant-id` header.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tracing::error;

use crate::error::OnboardingError;

use super::manager::OnboardingEngine;
use super::model::TenantId;

pub const TENANT_HEADER: &str = "x-tenant-id";

/// Shared state for onboarding routes.
#[derive(Clone)]
pub struct OnboardingRouteState {
    pub engine: Arc<OnboardingEngine>,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({"error": message.into()}))).into_response()
}

fn tenant_from(headers: &HeaderMap) -> Result<TenantId, Response> {
    let raw = headers
        .get(TENANT_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| error_response(StatusCode::BAD_REQUEST, "Missing x-tenant-id header"))?;
    raw.trim()
        .parse()
        .map_err(|_| error_response(StatusCode::BAD_REQUEST, "Invalid x-tenant-id header"))
}

fn onboarding_error(err: OnboardingError) -> Response {
    let status = match &err {
        OnboardingError::StepNotFound(_)
        | OnboardingError::OnboardingNotFound(_)
        | OnboardingError::ProgressNotFound { .. } => StatusCode::NOT_FOUND,
        OnboardingError::MissingAction { .. } => StatusCode::BAD_REQUEST,
        OnboardingError::DuplicateRoute { .. } | OnboardingError::DuplicateStepKey { .. } => {
            StatusCode::CONFLICT
        }
        OnboardingError::Database(e) => {
            error!("Onboarding request failed: {e}");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    error_response(status, err.to_string())
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// GET /api/onboarding/{route}
///
/// Renders the panel for the acting tenant. Consolidates just-done steps.
async fn get_panel(
    State(state): State<OnboardingRouteState>,
    Path(route): Path<String>,
    headers: HeaderMap,
) -> Response {
    let tenant = match tenant_from(&headers) {
        Ok(t) => t,
        Err(resp) => return resp,
    };
    match state.engine.prepare_rendering_values_by_route(&route, tenant).await {
        Ok(values) => Json(values).into_response(),
        Err(e) => onboarding_error(e),
    }
}

/// POST /api/onboarding/{route}/close
async fn close_panel(
    State(state): State<OnboardingRouteState>,
    Path(route): Path<String>,
    headers: HeaderMap,
) -> Response {
    let tenant = match tenant_from(&headers) {
        Ok(t) => t,
        Err(resp) => return resp,
    };
    match state.engine.action_close_panel(&route, tenant).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => onboarding_error(e),
    }
}

/// POST /api/onboarding/{route}/toggle
async fn toggle_panel(
    State(state): State<OnboardingRouteState>,
    Path(route): Path<String>,
    headers: HeaderMap,
) -> Response {
    let tenant = match tenant_from(&headers) {
        Ok(t) => t,
        Err(resp) => return resp,
    };
    let onboarding = match state.engine.get_onboarding_by_route(&route).await {
        Ok(Some(o)) => o,
        Ok(None) => return onboarding_error(OnboardingError::OnboardingNotFound(route)),
        Err(e) => return onboarding_error(e),
    };
    match state.engine.action_toggle_visibility(onboarding.id, tenant).await {
        Ok(closed) => Json(serde_json::json!({"closed": closed})).into_response(),
        Err(e) => onboarding_error(e),
    }
}

/// POST /api/onboarding/steps/{key}/done
///
/// Always 200 for a valid tenant; unknown keys report `NOT_FOUND`.
async fn validate_step(
    State(state): State<OnboardingRouteState>,
    Path(key): Path<String>,
    headers: HeaderMap,
) -> Response {
    let tenant = match tenant_from(&headers) {
        Ok(t) => t,
        Err(resp) => return resp,
    };
    match state.engine.action_validate_step(&key, tenant).await {
        Ok(result) => Json(serde_json::json!({"result": result})).into_response(),
        Err(e) => onboarding_error(e),
    }
}

/// Build the onboarding REST routes.
pub fn onboarding_routes(state: OnboardingRouteState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/onboarding/steps/{key}/done", post(validate_step))
        .route("/api/onboarding/{route}", get(get_panel))
        .route("/api/onboarding/{route}/close", post(close_panel))
        .route("/api/onboarding/{route}/toggle", post(toggle_panel))
        .with_state(state)
}
