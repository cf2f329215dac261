//! API key check for the lease and admin routes
//!
//! Clients send `Authorization: Bearer <key>`; a bare key without the
//! `Bearer ` prefix is accepted too. Several keys may be configured. With no
//! key configured every request passes.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use common::Secret;
use tracing::debug;

use crate::error::ApiError;

#[derive(Clone, Default)]
pub struct ApiKeys(Arc<Vec<Secret<String>>>);

impl ApiKeys {
    pub fn new(keys: Vec<Secret<String>>) -> Self {
        Self(Arc::new(keys))
    }

    pub fn is_enabled(&self) -> bool {
        !self.0.is_empty()
    }

    fn accepts(&self, presented: &str) -> bool {
        // No early exit: every key is compared
        self.0.iter().fold(false, |matched, key| {
            constant_time_eq(key.expose().as_bytes(), presented.as_bytes()) | matched
        })
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Split a comma-separated key list, dropping blanks.
pub fn parse_key_list(raw: &str) -> Vec<Secret<String>> {
    raw.split(',')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(|k| Secret::new(k.to_owned()))
        .collect()
}

/// Reject requests without a configured API key with 401.
pub async fn require_api_key(
    State(keys): State<ApiKeys>,
    request: Request,
    next: Next,
) -> Response {
    if !keys.is_enabled() {
        return next.run(request).await;
    }

    let Some(header) = request.headers().get(AUTHORIZATION) else {
        return ApiError::Unauthorized("missing Authorization header".into()).into_response();
    };
    let presented = header.to_str().unwrap_or_default();
    let token = presented.strip_prefix("Bearer ").unwrap_or(presented).trim();
    if !keys.accepts(token) {
        debug!(path = %request.uri().path(), "rejected request with invalid API key");
        return ApiError::Unauthorized("invalid API key".into()).into_response();
    }

    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::body::Body;
    use axum::http::StatusCode;
    use axum::routing::get;
    use tower::ServiceExt;

    fn guarded(keys: ApiKeys) -> Router {
        Router::new()
            .route("/admin/pool", get(|| async { "ok" }))
            .layer(axum::middleware::from_fn_with_state(keys, require_api_key))
    }

    fn get_with_auth(auth: Option<&str>) -> Request {
        let mut builder = axum::http::Request::builder().uri("/admin/pool");
        if let Some(value) = auth {
            builder = builder.header("authorization", value);
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn error_type(response: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        json["error"]["type"].clone()
    }

    #[tokio::test]
    async fn missing_header_is_401() {
        let app = guarded(ApiKeys::new(parse_key_list("k1")));
        let response = app.oneshot(get_with_auth(None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(error_type(response).await, "unauthorized");
    }

    #[tokio::test]
    async fn wrong_key_is_401() {
        let app = guarded(ApiKeys::new(parse_key_list("k1")));
        let response = app.oneshot(get_with_auth(Some("Bearer k2"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn any_configured_key_is_accepted() {
        let app = guarded(ApiKeys::new(parse_key_list("k1, k2")));
        for auth in ["Bearer k1", "Bearer k2", "k2"] {
            let response = app.clone().oneshot(get_with_auth(Some(auth))).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK, "auth header: {auth}");
        }
    }

    #[tokio::test]
    async fn no_configured_key_disables_the_check() {
        let app = guarded(ApiKeys::default());
        let response = app.oneshot(get_with_auth(None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn key_list_drops_blanks() {
        let keys = parse_key_list(" a ,, b ,");
        let exposed: Vec<_> = keys.iter().map(|k| k.expose().as_str()).collect();
        assert_eq!(exposed, vec!["a", "b"]);
        assert!(parse_key_list(" , ").is_empty());
    }

    #[test]
    fn prefix_of_a_key_is_rejected() {
        let keys = ApiKeys::new(parse_key_list("secret-key"));
        assert!(keys.accepts("secret-key"));
        assert!(!keys.accepts("secret"));
        assert!(!keys.accepts(""));
    }
}
