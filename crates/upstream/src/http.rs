//! reqwest-backed adapter for a generic JSON publishing API
//!
//! Endpoints, relative to the configured base URL:
//! - `POST /media` (bearer auth, JSON `Content`) → `{"id": "..."}`
//! - `GET  /me/capabilities` (bearer auth) → `{"capabilities": ["publish_photo", ...]}`
//! - `POST /oauth/token` (form, `grant_type=refresh_token`) →
//!   `{"access_token", "refresh_token"?, "expires_in"?}`
//!
//! Error responses are read as `{"error": {"message", "code"?}}` when they
//! parse, otherwise the raw body becomes the message. A 401 carrying code 190
//! is the platform's explicit invalid-token signal.

use reqwest::header::RETRY_AFTER;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::content::{CapabilitySet, Content};
use crate::error::UpstreamError;
use crate::{BoxFuture, TokenGrant, Upstream};

/// Error code the platform uses for expired or revoked access tokens.
const INVALID_TOKEN_CODE: i64 = 190;

#[derive(Deserialize)]
struct PublishResponse {
    id: String,
}

#[derive(Deserialize)]
struct CapabilitiesResponse {
    capabilities: CapabilitySet,
}

#[derive(Deserialize)]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
    #[serde(default)]
    code: Option<i64>,
}

/// HTTP client for the publishing API.
pub struct HttpUpstream {
    client: reqwest::Client,
    base_url: String,
}

impl HttpUpstream {
    /// `client` carries timeouts and TLS settings; `base_url` is stripped of
    /// any trailing slash.
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

impl Upstream for HttpUpstream {
    fn id(&self) -> &str {
        "http"
    }

    fn publish<'a>(
        &'a self,
        token: &'a str,
        content: &'a Content,
    ) -> BoxFuture<'a, Result<String, UpstreamError>> {
        Box::pin(async move {
            let response = self
                .client
                .post(self.url("/media"))
                .bearer_auth(token)
                .json(content)
                .send()
                .await
                .map_err(|e| UpstreamError::network(format!("publish request failed: {e}")))?;

            if !response.status().is_success() {
                return Err(error_from_response(response).await);
            }

            let body: PublishResponse = response
                .json()
                .await
                .map_err(|e| UpstreamError::network(format!("invalid publish response: {e}")))?;
            debug!(content_id = %body.id, kind = content.media_kind.label(), "upstream accepted publish");
            Ok(body.id)
        })
    }

    fn check_capabilities<'a>(
        &'a self,
        token: &'a str,
    ) -> BoxFuture<'a, Result<CapabilitySet, UpstreamError>> {
        Box::pin(async move {
            let response = self
                .client
                .get(self.url("/me/capabilities"))
                .bearer_auth(token)
                .send()
                .await
                .map_err(|e| UpstreamError::network(format!("capability request failed: {e}")))?;

            if !response.status().is_success() {
                return Err(error_from_response(response).await);
            }

            let body: CapabilitiesResponse = response.json().await.map_err(|e| {
                UpstreamError::network(format!("invalid capability response: {e}"))
            })?;
            Ok(body.capabilities)
        })
    }

    fn refresh_token<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> BoxFuture<'a, Result<TokenGrant, UpstreamError>> {
        Box::pin(async move {
            let response = self
                .client
                .post(self.url("/oauth/token"))
                .form(&[
                    ("grant_type", "refresh_token"),
                    ("refresh_token", refresh_token),
                ])
                .send()
                .await
                .map_err(|e| UpstreamError::network(format!("token refresh request failed: {e}")))?;

            if !response.status().is_success() {
                let err = error_from_response(response).await;
                warn!(status = ?err.http_status, "token refresh rejected by upstream");
                return Err(err);
            }

            let body: RefreshResponse = response
                .json()
                .await
                .map_err(|e| UpstreamError::network(format!("invalid refresh response: {e}")))?;
            Ok(TokenGrant {
                access_token: body.access_token.into(),
                refresh_token: body.refresh_token.map(Into::into),
                expires_in: body.expires_in,
            })
        })
    }
}

/// Build an `UpstreamError` from a non-success response.
///
/// Reads `Retry-After` as delta-seconds; the HTTP-date form is ignored and the
/// classifier's default applies.
pub(crate) async fn error_from_response(response: reqwest::Response) -> UpstreamError {
    let status = response.status().as_u16();
    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| String::from("<no body>"));

    let (message, code) = parse_error_body(&body);
    let mut err = UpstreamError::http(status, message);
    if let Some(secs) = retry_after {
        err = err.with_retry_after(secs);
    }
    if status == 401 && code == Some(INVALID_TOKEN_CODE) {
        err = err.rejecting_credential();
    }
    err
}

fn parse_error_body(body: &str) -> (String, Option<i64>) {
    match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(envelope) => (envelope.error.message, envelope.error.code),
        Err(_) => (body.trim().to_string(), None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::MediaKind;
    use axum::Router;
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::IntoResponse;
    use axum::routing::{get, post};

    /// Serve `router` on an ephemeral port and return its base URL.
    async fn start_mock(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn bearer(headers: &HeaderMap) -> String {
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    }

    #[test]
    fn parse_error_body_reads_envelope() {
        let (message, code) =
            parse_error_body(r#"{"error":{"message":"Invalid OAuth access token","code":190}}"#);
        assert_eq!(message, "Invalid OAuth access token");
        assert_eq!(code, Some(190));
    }

    #[test]
    fn parse_error_body_falls_back_to_raw_text() {
        let (message, code) = parse_error_body("  Bad Gateway\n");
        assert_eq!(message, "Bad Gateway");
        assert_eq!(code, None);
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let upstream = HttpUpstream::new(reqwest::Client::new(), "https://graph.example.com/v1/");
        assert_eq!(upstream.url("/media"), "https://graph.example.com/v1/media");
    }

    #[tokio::test]
    async fn publish_returns_content_id_and_sends_bearer() {
        let router = Router::new().route(
            "/media",
            post(|headers: HeaderMap, body: String| async move {
                assert_eq!(bearer(&headers), "Bearer at_page_1");
                let json: serde_json::Value = serde_json::from_str(&body).unwrap();
                assert_eq!(json["media_kind"], "video");
                assert_eq!(json["caption"], "launch day");
                axum::Json(serde_json::json!({"id": "17890001"}))
            }),
        );
        let base = start_mock(router).await;
        let upstream = HttpUpstream::new(reqwest::Client::new(), base);

        let content = Content::new(MediaKind::Video, "https://cdn.example.com/v.mp4", "launch day");
        let id = upstream.publish("at_page_1", &content).await.unwrap();
        assert_eq!(id, "17890001");
    }

    #[tokio::test]
    async fn publish_429_carries_retry_after() {
        let router = Router::new().route(
            "/media",
            post(|| async {
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    [(axum::http::header::RETRY_AFTER, "120")],
                    r#"{"error":{"message":"Application request limit reached"}}"#,
                )
                    .into_response()
            }),
        );
        let base = start_mock(router).await;
        let upstream = HttpUpstream::new(reqwest::Client::new(), base);

        let content = Content::new(MediaKind::Photo, "https://cdn.example.com/p.jpg", "");
        let err = upstream.publish("at", &content).await.unwrap_err();
        assert_eq!(err.http_status, Some(429));
        assert_eq!(err.retry_after_secs, Some(120));
        assert_eq!(err.message, "Application request limit reached");
        assert!(!err.credential_rejected);
    }

    #[tokio::test]
    async fn publish_401_with_invalid_token_code_rejects_credential() {
        let router = Router::new().route(
            "/media",
            post(|| async {
                (
                    StatusCode::UNAUTHORIZED,
                    r#"{"error":{"message":"Error validating access token","code":190}}"#,
                )
                    .into_response()
            }),
        );
        let base = start_mock(router).await;
        let upstream = HttpUpstream::new(reqwest::Client::new(), base);

        let content = Content::new(MediaKind::Photo, "https://cdn.example.com/p.jpg", "");
        let err = upstream.publish("at", &content).await.unwrap_err();
        assert!(err.credential_rejected);
    }

    #[tokio::test]
    async fn publish_403_permission_error_does_not_reject_credential() {
        let router = Router::new().route(
            "/media",
            post(|| async {
                (
                    StatusCode::FORBIDDEN,
                    r#"{"error":{"message":"(#10) Application does not have permission for this action","code":10}}"#,
                )
                    .into_response()
            }),
        );
        let base = start_mock(router).await;
        let upstream = HttpUpstream::new(reqwest::Client::new(), base);

        let content = Content::new(MediaKind::Reel, "https://cdn.example.com/r.mp4", "");
        let err = upstream.publish("at", &content).await.unwrap_err();
        assert_eq!(err.http_status, Some(403));
        assert!(!err.credential_rejected);
    }

    #[tokio::test]
    async fn check_capabilities_parses_list() {
        let router = Router::new().route(
            "/me/capabilities",
            get(|| async { axum::Json(serde_json::json!({"capabilities": ["publish_photo"]})) }),
        );
        let base = start_mock(router).await;
        let upstream = HttpUpstream::new(reqwest::Client::new(), base);

        let caps = upstream.check_capabilities("at").await.unwrap();
        assert_eq!(caps, CapabilitySet::photo_only());
    }

    #[tokio::test]
    async fn refresh_token_returns_grant() {
        let router = Router::new().route(
            "/oauth/token",
            post(|body: String| async move {
                assert!(body.contains("grant_type=refresh_token"));
                assert!(body.contains("refresh_token=rt_old"));
                axum::Json(serde_json::json!({
                    "access_token": "at_new",
                    "refresh_token": "rt_new",
                    "expires_in": 5_184_000
                }))
            }),
        );
        let base = start_mock(router).await;
        let upstream = HttpUpstream::new(reqwest::Client::new(), base);

        let grant = upstream.refresh_token("rt_old").await.unwrap();
        assert_eq!(grant.access_token.expose(), "at_new");
        assert_eq!(grant.refresh_token.unwrap().expose(), "rt_new");
        assert_eq!(grant.expires_in, Some(5_184_000));
    }

    #[tokio::test]
    async fn refresh_token_rejection_is_flagged() {
        let router = Router::new().route(
            "/oauth/token",
            post(|| async {
                (
                    StatusCode::UNAUTHORIZED,
                    r#"{"error":{"message":"refresh token revoked"}}"#,
                )
                    .into_response()
            }),
        );
        let base = start_mock(router).await;
        let upstream = HttpUpstream::new(reqwest::Client::new(), base);

        let err = upstream.refresh_token("rt_revoked").await.unwrap_err();
        assert!(err.is_refresh_rejection());
    }

    #[tokio::test]
    async fn unreachable_upstream_is_network_error() {
        // Bind and immediately drop a listener so the port is closed.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let upstream = HttpUpstream::new(reqwest::Client::new(), format!("http://{addr}"));
        let content = Content::new(MediaKind::Photo, "https://cdn.example.com/p.jpg", "");
        let err = upstream.publish("at", &content).await.unwrap_err();
        assert_eq!(err.http_status, None);
        assert!(err.message.contains("publish request failed"));
    }
}
