//! Lease and dispatch endpoints for pool clients
//!
//! Endpoints:
//! - POST /leases                    — lease an account for one capability
//! - POST /leases/{lease_id}/release — report the outcome and free the account
//! - POST /v1/execute                — run one AI request with account switching
//!
//! A lease response carries the account's session token. Callers hold it only
//! for the lifetime of the lease.

use std::sync::Arc;

use account_pool::{Dispatcher, Outcome, Scheduler};
use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::IntoResponse;
use axum::routing::post;
use common::Capability;
use serde::Deserialize;
use tracing::debug;

use crate::error::{ApiError, parse_body};

#[derive(Clone)]
pub struct LeaseState {
    scheduler: Arc<Scheduler>,
    dispatcher: Arc<Dispatcher>,
}

impl LeaseState {
    pub fn new(scheduler: Arc<Scheduler>, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            scheduler,
            dispatcher,
        }
    }
}

pub fn build_lease_router(state: LeaseState) -> Router {
    Router::new()
        .route("/leases", post(acquire_lease))
        .route("/leases/{lease_id}/release", post(release_lease))
        .route("/v1/execute", post(execute))
        .with_state(state)
}

#[derive(Deserialize)]
struct LeaseRequest {
    capability: Capability,
}

#[derive(Deserialize)]
struct ReleaseRequest {
    outcome: Outcome,
}

#[derive(Deserialize)]
struct ExecuteRequest {
    capability: Capability,
    prompt: String,
    #[serde(default)]
    params: serde_json::Value,
}

/// POST /leases — 503 with `retry_after_secs` when the pool is exhausted.
async fn acquire_lease(
    State(state): State<LeaseState>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let request: LeaseRequest = parse_body(&body)?;
    let lease = state.scheduler.acquire(request.capability).await?;

    Ok((
        StatusCode::OK,
        [(CONTENT_TYPE, "application/json")],
        serde_json::json!({
            "lease_id": lease.lease_id,
            "account_id": lease.account_id,
            "email": lease.email,
            "capability": lease.capability,
            "session": lease.session.expose(),
        })
        .to_string(),
    ))
}

/// POST /leases/{lease_id}/release — 409 if the lease was already released
/// or reclaimed.
async fn release_lease(
    State(state): State<LeaseState>,
    Path(lease_id): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let request: ReleaseRequest = parse_body(&body)?;
    state
        .scheduler
        .release_by_id(&lease_id, request.outcome)
        .await?;
    debug!(lease_id = %lease_id, outcome = request.outcome.label(), "lease released via API");

    Ok((
        StatusCode::OK,
        [(CONTENT_TYPE, "application/json")],
        serde_json::json!({
            "lease_id": lease_id,
            "outcome": request.outcome,
            "status": "released",
        })
        .to_string(),
    ))
}

/// POST /v1/execute
async fn execute(
    State(state): State<LeaseState>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let request: ExecuteRequest = parse_body(&body)?;
    let artifact = state
        .dispatcher
        .execute(request.capability, &request.prompt, &request.params)
        .await?;

    Ok((
        StatusCode::OK,
        [(CONTENT_TYPE, "application/json")],
        serde_json::json!({
            "capability": artifact.capability,
            "content": artifact.content,
        })
        .to_string(),
    ))
}
