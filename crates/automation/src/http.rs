//! JSON-over-HTTP client for the automation backend
//!
//! The backend wraps the browser driver and the temp-mail clients. Every
//! operation is a POST with a JSON body:
//! - `/login`     `{email, credential}`              → `SessionToken`
//! - `/mailboxes` `{}`                                → `Mailbox`
//! - `/register`  `{mailbox}`                         → `RegisteredAccount`
//! - `/execute`   `{session, capability, prompt, params}` → `{content}`
//!
//! An optional API key is sent as a Bearer token.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use common::{Capability, Secret};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::classify::classify_status;
use crate::error::{AutomationError, RequestError, Result};
use crate::{
    AiExecutor, Artifact, LoginAutomation, Mailbox, MailboxProvider, RegisteredAccount,
    RegistrationAutomation, SessionToken,
};

#[derive(Deserialize)]
struct ExecuteResponse {
    content: serde_json::Value,
}

/// Client for the automation backend.
pub struct HttpAutomation {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
    api_key: Option<Secret<String>>,
}

impl HttpAutomation {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, timeout: Duration) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            client,
            base_url,
            timeout,
            api_key: None,
        }
    }

    pub fn with_api_key(mut self, api_key: Secret<String>) -> Self {
        self.api_key = Some(api_key);
        self
    }

    fn request(&self, path: &str, body: &serde_json::Value) -> reqwest::RequestBuilder {
        let mut request = self
            .client
            .post(format!("{}{path}", self.base_url))
            .timeout(self.timeout)
            .json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key.expose());
        }
        request
    }

    /// POST a JSON body and decode a JSON reply. Non-2xx is `Rejected`.
    async fn post_json<R: DeserializeOwned>(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<R> {
        let response = self
            .request(path, &body)
            .send()
            .await
            .map_err(|e| AutomationError::Http(format!("{path}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<no body>"));
            return Err(AutomationError::Rejected(format!(
                "{path} returned {status}: {body}"
            )));
        }

        response
            .json::<R>()
            .await
            .map_err(|e| AutomationError::InvalidResponse(format!("{path}: {e}")))
    }
}

impl LoginAutomation for HttpAutomation {
    fn login<'a>(
        &'a self,
        email: &'a str,
        credential: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<SessionToken>> + Send + 'a>> {
        Box::pin(async move {
            debug!(email, "requesting login automation");
            self.post_json(
                "/login",
                serde_json::json!({ "email": email, "credential": credential }),
            )
            .await
        })
    }
}

impl MailboxProvider for HttpAutomation {
    fn provision_mailbox(&self) -> Pin<Box<dyn Future<Output = Result<Mailbox>> + Send + '_>> {
        Box::pin(async move { self.post_json("/mailboxes", serde_json::json!({})).await })
    }
}

impl RegistrationAutomation for HttpAutomation {
    fn register_account<'a>(
        &'a self,
        mailbox: &'a Mailbox,
    ) -> Pin<Box<dyn Future<Output = Result<RegisteredAccount>> + Send + 'a>> {
        Box::pin(async move {
            debug!(mailbox = %mailbox.address, "requesting registration automation");
            self.post_json("/register", serde_json::json!({ "mailbox": mailbox }))
                .await
        })
    }
}

impl AiExecutor for HttpAutomation {
    fn perform<'a>(
        &'a self,
        session: &'a str,
        capability: Capability,
        prompt: &'a str,
        params: &'a serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = std::result::Result<Artifact, RequestError>> + Send + 'a>>
    {
        Box::pin(async move {
            let body = serde_json::json!({
                "session": session,
                "capability": capability,
                "prompt": prompt,
                "params": params,
            });

            let response = self
                .request("/execute", &body)
                .send()
                .await
                .map_err(|e| {
                    warn!(%capability, error = %e, "execute request failed");
                    RequestError::Transient(format!("execute request failed: {e}"))
                })?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(classify_status(status.as_u16(), &body));
            }

            let reply = response
                .json::<ExecuteResponse>()
                .await
                .map_err(|e| RequestError::Transient(format!("invalid execute response: {e}")))?;

            Ok(Artifact {
                capability,
                content: reply.content,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Json;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use tokio::net::TcpListener;

    /// Start a mock automation backend and return its base URL.
    async fn start_backend(app: axum::Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn client(base_url: &str) -> HttpAutomation {
        HttpAutomation::new(reqwest::Client::new(), base_url, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn login_returns_session_token() {
        let app = axum::Router::new().route(
            "/login",
            post(|Json(body): Json<serde_json::Value>| async move {
                assert_eq!(body["email"], "a@example.com");
                assert_eq!(body["credential"], "cred-a");
                Json(serde_json::json!({ "token": "sess-a", "expires_at": 42 }))
            }),
        );
        let url = start_backend(app).await;

        let token = client(&url).login("a@example.com", "cred-a").await.unwrap();
        assert_eq!(token.token, "sess-a");
        assert_eq!(token.expires_at, Some(42));
    }

    #[tokio::test]
    async fn login_rejection_is_reported() {
        let app = axum::Router::new().route(
            "/login",
            post(|| async { (StatusCode::UNPROCESSABLE_ENTITY, "captcha required") }),
        );
        let url = start_backend(app).await;

        let err = client(&url).login("a@example.com", "cred").await.unwrap_err();
        match err {
            AutomationError::Rejected(msg) => assert!(msg.contains("captcha"), "got: {msg}"),
            other => panic!("expected Rejected, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn api_key_is_sent_as_bearer() {
        let app = axum::Router::new().route(
            "/mailboxes",
            post(|headers: HeaderMap| async move {
                let auth = headers
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                if auth != "Bearer backend-key" {
                    return Err(StatusCode::UNAUTHORIZED);
                }
                Ok(Json(serde_json::json!({ "address": "box@tmp.example" })))
            }),
        );
        let url = start_backend(app).await;

        let automation = client(&url).with_api_key(Secret::new("backend-key".to_string()));
        let mailbox = automation.provision_mailbox().await.unwrap();
        assert_eq!(mailbox.address, "box@tmp.example");
        assert!(mailbox.provider.is_none());
    }

    #[tokio::test]
    async fn register_posts_mailbox() {
        let app = axum::Router::new().route(
            "/register",
            post(|Json(body): Json<serde_json::Value>| async move {
                let address = body["mailbox"]["address"].as_str().unwrap().to_string();
                Json(serde_json::json!({ "email": address, "credential": "cred-new" }))
            }),
        );
        let url = start_backend(app).await;

        let mailbox = Mailbox {
            address: "new@tmp.example".into(),
            provider: Some("generator".into()),
        };
        let registered = client(&url).register_account(&mailbox).await.unwrap();
        assert_eq!(registered.email, "new@tmp.example");
        assert_eq!(registered.credential, "cred-new");
    }

    #[tokio::test]
    async fn execute_returns_artifact() {
        let app = axum::Router::new().route(
            "/execute",
            post(|Json(body): Json<serde_json::Value>| async move {
                assert_eq!(body["capability"], "image");
                assert_eq!(body["session"], "sess-1");
                Json(serde_json::json!({ "content": { "url": "https://cdn.example/1.png" } }))
            }),
        );
        let url = start_backend(app).await;

        let params = serde_json::json!({ "size": "1024x1024" });
        let artifact = client(&url)
            .perform("sess-1", Capability::Image, "a cat", &params)
            .await
            .unwrap();
        assert_eq!(artifact.capability, Capability::Image);
        assert_eq!(artifact.content["url"], "https://cdn.example/1.png");
    }

    #[tokio::test]
    async fn execute_classifies_upstream_failures() {
        let app = axum::Router::new()
            .route(
                "/execute",
                post(|Json(body): Json<serde_json::Value>| async move {
                    match body["prompt"].as_str().unwrap_or_default() {
                        "limit" => (StatusCode::TOO_MANY_REQUESTS, "slow down"),
                        "auth" => (StatusCode::UNAUTHORIZED, "session expired"),
                        _ => (StatusCode::BAD_GATEWAY, "upstream hiccup"),
                    }
                }),
            );
        let url = start_backend(app).await;
        let automation = client(&url);
        let params = serde_json::Value::Null;

        let err = automation
            .perform("s", Capability::Chat, "limit", &params)
            .await
            .unwrap_err();
        assert!(matches!(err, RequestError::RateLimited(_)), "got {err:?}");

        let err = automation
            .perform("s", Capability::Chat, "auth", &params)
            .await
            .unwrap_err();
        assert!(matches!(err, RequestError::AuthExpired(_)), "got {err:?}");

        let err = automation
            .perform("s", Capability::Chat, "other", &params)
            .await
            .unwrap_err();
        assert!(matches!(err, RequestError::Transient(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn unreachable_backend_is_transient_for_execute() {
        let automation = client("http://127.0.0.1:1");
        let err = automation
            .perform("s", Capability::Video, "p", &serde_json::Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, RequestError::Transient(_)), "got {err:?}");

        let err = automation.provision_mailbox().await.unwrap_err();
        assert!(matches!(err, AutomationError::Http(_)), "got {err:?}");
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let automation = client("http://backend.local/");
        assert_eq!(automation.base_url, "http://backend.local");
    }
}
