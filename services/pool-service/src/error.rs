//! HTTP error mapping
//!
//! Every handler error renders as `{"error": {"type", "message"}}` with a
//! status code picked from the pool error kind.

use axum::http::header::{CONTENT_TYPE, RETRY_AFTER};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Pool(#[from] account_pool::Error),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unauthorized(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        use account_pool::Error as E;
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Pool(e) => match e {
                E::NoEligibleAccount { .. } => StatusCode::SERVICE_UNAVAILABLE,
                E::StaleLease(_)
                | E::AlreadyExists(_)
                | E::Ineligible { .. }
                | E::TaskNotRunning(_) => StatusCode::CONFLICT,
                E::NotFound(_) | E::TaskNotFound(_) => StatusCode::NOT_FOUND,
                E::AttemptsExhausted { .. } | E::Registration(_) => StatusCode::BAD_GATEWAY,
                E::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    /// Machine-readable error type for the JSON body.
    pub fn kind(&self) -> &'static str {
        use account_pool::Error as E;
        match self {
            ApiError::BadRequest(_) => "invalid_request",
            ApiError::Unauthorized(_) => "unauthorized",
            ApiError::Pool(e) => match e {
                E::NoEligibleAccount { .. } => "no_eligible_account",
                E::StaleLease(_) => "stale_lease",
                E::NotFound(_) | E::TaskNotFound(_) => "not_found",
                E::AlreadyExists(_) => "already_exists",
                E::Ineligible { .. } => "ineligible",
                E::Store(_) => "store_error",
                E::Registration(_) => "registration_failed",
                E::TaskNotRunning(_) => "task_not_running",
                E::AttemptsExhausted { .. } => "attempts_exhausted",
            },
        }
    }

    /// Whole seconds until an account frees up, rounded up.
    fn retry_after_secs(&self) -> Option<u64> {
        match self {
            ApiError::Pool(account_pool::Error::NoEligibleAccount {
                retry_after: Some(d),
                ..
            }) => Some(d.as_millis().div_ceil(1000) as u64),
            _ => None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() && status != StatusCode::SERVICE_UNAVAILABLE {
            warn!(status = status.as_u16(), error = %self, "request failed");
        }

        let mut error = serde_json::json!({
            "type": self.kind(),
            "message": self.to_string(),
        });
        let retry_after = self.retry_after_secs();
        if let Some(secs) = retry_after {
            error["retry_after_secs"] = secs.into();
        }

        let mut response = (
            status,
            [(CONTENT_TYPE, "application/json")],
            serde_json::json!({ "error": error }).to_string(),
        )
            .into_response();
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

/// Decode a JSON request body.
pub fn parse_body<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(format!("invalid body: {e}")))
}

/// Decode an optional JSON request body. An empty body yields `T::default()`.
pub fn parse_optional_body<T>(body: &[u8]) -> Result<T, ApiError>
where
    T: serde::de::DeserializeOwned + Default,
{
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    parse_body(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::Capability;
    use std::time::Duration;

    async fn render(err: ApiError) -> (StatusCode, Option<String>, serde_json::Value) {
        let response = err.into_response();
        let status = response.status();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .map(|v| v.to_str().unwrap().to_string());
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        (status, retry_after, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn no_eligible_account_is_503_with_retry_hint() {
        let err = ApiError::from(account_pool::Error::NoEligibleAccount {
            capability: Capability::Video,
            retry_after: Some(Duration::from_millis(90_500)),
        });
        let (status, retry_after, json) = render(err).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(retry_after.as_deref(), Some("91"));
        assert_eq!(json["error"]["type"], "no_eligible_account");
        assert_eq!(json["error"]["retry_after_secs"], 91);
        assert!(
            json["error"]["message"]
                .as_str()
                .unwrap()
                .contains("video")
        );
    }

    #[tokio::test]
    async fn no_eligible_account_without_hint_omits_retry_after() {
        let err = ApiError::from(account_pool::Error::NoEligibleAccount {
            capability: Capability::Chat,
            retry_after: None,
        });
        let (status, retry_after, json) = render(err).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(retry_after.is_none());
        assert!(json["error"].get("retry_after_secs").is_none());
    }

    #[tokio::test]
    async fn status_codes_follow_error_kind() {
        let cases = [
            (
                ApiError::from(account_pool::Error::StaleLease("l1".into())),
                StatusCode::CONFLICT,
                "stale_lease",
            ),
            (
                ApiError::from(account_pool::Error::NotFound("a1".into())),
                StatusCode::NOT_FOUND,
                "not_found",
            ),
            (
                ApiError::from(account_pool::Error::AlreadyExists("x@example.com".into())),
                StatusCode::CONFLICT,
                "already_exists",
            ),
            (
                ApiError::from(account_pool::Error::AttemptsExhausted {
                    attempts: 5,
                    last_error: "502".into(),
                }),
                StatusCode::BAD_GATEWAY,
                "attempts_exhausted",
            ),
            (
                ApiError::from(account_pool::Error::TaskNotRunning("t1".into())),
                StatusCode::CONFLICT,
                "task_not_running",
            ),
            (
                ApiError::BadRequest("missing capability".into()),
                StatusCode::BAD_REQUEST,
                "invalid_request",
            ),
        ];

        for (err, expected_status, expected_type) in cases {
            let (status, _, json) = render(err).await;
            assert_eq!(status, expected_status);
            assert_eq!(json["error"]["type"], expected_type);
        }
    }

    #[test]
    fn optional_body_defaults_when_empty() {
        #[derive(serde::Deserialize, Default, Debug, PartialEq)]
        struct Body {
            count: Option<usize>,
        }
        assert_eq!(parse_optional_body::<Body>(b"").unwrap(), Body::default());
        assert_eq!(parse_optional_body::<Body>(b"  \n").unwrap(), Body::default());
        assert_eq!(
            parse_optional_body::<Body>(br#"{"count": 2}"#).unwrap(),
            Body { count: Some(2) }
        );
        assert!(matches!(
            parse_optional_body::<Body>(b"{not json"),
            Err(ApiError::BadRequest(_))
        ));
    }
}
