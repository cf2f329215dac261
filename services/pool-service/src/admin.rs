//! Admin API for pool operators
//!
//! Endpoints:
//! - GET    /admin/pool                   — pool status summary
//! - GET    /admin/accounts               — list accounts (no secrets)
//! - POST   /admin/accounts               — add an account by hand, queued for login
//! - DELETE /admin/accounts/{id}          — remove an account
//! - POST   /admin/accounts/{id}/disable  — take an account out of rotation
//! - POST   /admin/accounts/{id}/enable   — return it to rotation via a fresh login
//! - POST   /admin/accounts/{id}/refresh  — queue a session refresh
//! - GET    /admin/registrations          — recent registration tasks, newest first
//! - POST   /admin/registrations          — register `count` accounts, or run
//!   a low-water check when no count is given
//! - GET    /admin/registrations/{id}     — one registration task
//! - POST   /admin/registrations/{id}/cancel — abort a running registration

use std::sync::Arc;

use account_pool::{RegistrationOrchestrator, Scheduler};
use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use serde::Deserialize;
use tracing::info;

use crate::error::{ApiError, parse_body, parse_optional_body};

/// Shared state for admin API handlers.
#[derive(Clone)]
pub struct AdminState {
    scheduler: Arc<Scheduler>,
    orchestrator: Arc<RegistrationOrchestrator>,
}

impl AdminState {
    pub fn new(scheduler: Arc<Scheduler>, orchestrator: Arc<RegistrationOrchestrator>) -> Self {
        Self {
            scheduler,
            orchestrator,
        }
    }
}

pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/pool", get(pool_status))
        .route("/admin/accounts", get(list_accounts).post(add_account))
        .route("/admin/accounts/{id}", delete(delete_account))
        .route("/admin/accounts/{id}/disable", post(disable_account))
        .route("/admin/accounts/{id}/enable", post(enable_account))
        .route("/admin/accounts/{id}/refresh", post(refresh_account))
        .route(
            "/admin/registrations",
            get(list_registrations).post(start_registrations),
        )
        .route("/admin/registrations/{id}", get(registration_task))
        .route("/admin/registrations/{id}/cancel", post(cancel_registration))
        .with_state(state)
}

fn json_ok(body: serde_json::Value) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

async fn pool_status(State(state): State<AdminState>) -> impl IntoResponse {
    let status = state.scheduler.pool_status().await;
    json_ok(serde_json::json!(status))
}

async fn list_accounts(State(state): State<AdminState>) -> impl IntoResponse {
    let accounts = state.scheduler.accounts().await;
    json_ok(serde_json::json!({ "accounts": accounts }))
}

#[derive(Deserialize)]
struct AddAccountRequest {
    email: String,
    credential: String,
}

async fn add_account(
    State(state): State<AdminState>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let request: AddAccountRequest = parse_body(&body)?;
    let email = request.email.trim();
    if email.is_empty() || request.credential.is_empty() {
        return Err(ApiError::BadRequest(
            "email and credential must not be empty".into(),
        ));
    }

    let account = state
        .scheduler
        .add_account(email, &request.credential)
        .await?;
    Ok((
        StatusCode::CREATED,
        [(CONTENT_TYPE, "application/json")],
        serde_json::json!({
            "account_id": account.id,
            "email": account.email,
            "status": account.status,
        })
        .to_string(),
    ))
}

async fn delete_account(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.scheduler.remove_account(&id).await?;
    Ok(json_ok(serde_json::json!({
        "account_id": id,
        "status": "removed",
    })))
}

#[derive(Deserialize, Default)]
struct DisableRequest {
    reason: Option<String>,
}

async fn disable_account(
    State(state): State<AdminState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let request: DisableRequest = parse_optional_body(&body)?;
    let account = state.scheduler.disable_account(&id, request.reason).await?;
    Ok(json_ok(serde_json::json!({
        "account_id": account.id,
        "status": account.status,
        "disabled_reason": account.disabled_reason,
    })))
}

async fn enable_account(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let account = state.scheduler.enable_account(&id).await?;
    Ok(json_ok(serde_json::json!({
        "account_id": account.id,
        "status": account.status,
    })))
}

async fn refresh_account(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let queued = state.scheduler.request_refresh(&id).await?;
    Ok(json_ok(serde_json::json!({
        "account_id": id,
        "queued": queued,
    })))
}

#[derive(Deserialize, Default)]
struct RegistrationRequest {
    count: Option<usize>,
}

async fn start_registrations(
    State(state): State<AdminState>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let request: RegistrationRequest = parse_optional_body(&body)?;
    let task_ids = match request.count {
        Some(0) => return Err(ApiError::BadRequest("count must be greater than 0".into())),
        Some(count) => state.orchestrator.register_batch(count),
        None => state.orchestrator.check_low_water().await,
    };
    info!(
        requested = ?request.count,
        started = task_ids.len(),
        "registrations requested via admin API"
    );

    Ok(json_ok(serde_json::json!({
        "started": task_ids.len(),
        "task_ids": task_ids,
        "in_flight": state.orchestrator.in_flight(),
    })))
}

async fn list_registrations(State(state): State<AdminState>) -> impl IntoResponse {
    json_ok(serde_json::json!({
        "tasks": state.orchestrator.tasks(),
        "in_flight": state.orchestrator.in_flight(),
    }))
}

async fn registration_task(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let task = state.orchestrator.task(&id)?;
    Ok(json_ok(serde_json::json!(task)))
}

async fn cancel_registration(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let task = state.orchestrator.cancel(&id)?;
    info!(task_id = %id, "registration cancelled via admin API");
    Ok(json_ok(serde_json::json!(task)))
}
