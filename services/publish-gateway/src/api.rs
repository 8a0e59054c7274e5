//! HTTP routes over the publishing core
//!
//! Endpoints:
//! - POST   /workspaces/{workspace_id}/publish                      : publish content, returns the report
//! - POST   /workspaces/{workspace_id}/credentials                  : register a connected account
//! - DELETE /workspaces/{workspace_id}/credentials/{credential_id}  : revoke a credential
//! - GET    /workspaces/{workspace_id}/pool                         : pool stats (never tokens)
//! - GET    /health
//! - GET    /metrics

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use common::Secret;
use credential_pool::{CredentialPools, NewCredential};
use metrics_exporter_prometheus::PrometheusHandle;
use publisher::{PublishFailure, PublishReport, Publisher};
use serde::Deserialize;
use tracing::{info, warn};
use upstream::Content;

use crate::error::ApiError;

/// Shared application state accessible from all handlers
#[derive(Clone)]
pub struct AppState {
    pub pools: Arc<CredentialPools>,
    pub publisher: Arc<Publisher>,
    pub prometheus: PrometheusHandle,
    pub started_at: Instant,
    /// How often the background sweep reactivates expired rate limits.
    pub sweep_interval: Duration,
}

/// Build the axum router with all routes and shared state.
///
/// Applies a concurrency limit layer based on `max_connections`.
pub fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_text))
        .route("/workspaces/{workspace_id}/publish", post(publish))
        .route("/workspaces/{workspace_id}/credentials", post(register_credential))
        .route(
            "/workspaces/{workspace_id}/credentials/{credential_id}",
            delete(revoke_credential),
        )
        .route("/workspaces/{workspace_id}/pool", get(pool_stats))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

fn new_request_id() -> String {
    format!("req_{}", uuid::Uuid::new_v4().as_simple())
}

fn json_response(status: StatusCode, body: String) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response()
}

fn finish(route: &'static str, started: Instant, response: Response) -> Response {
    crate::metrics::record_request(
        route,
        response.status().as_u16(),
        started.elapsed().as_secs_f64(),
    );
    response
}

/// Status code for a publish report.
///
/// - published → 200
/// - no capacity, rate limited → 503 (retry later)
/// - invalid credential → 409
/// - exhausted → 422 (do not resubmit unchanged)
/// - timeout → 504
fn publish_status(report: &PublishReport) -> StatusCode {
    match report.failure() {
        None => StatusCode::OK,
        Some(PublishFailure::NoCapacity | PublishFailure::RateLimited { .. }) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        Some(PublishFailure::InvalidCredential) => StatusCode::CONFLICT,
        Some(PublishFailure::Exhausted { .. }) => StatusCode::UNPROCESSABLE_ENTITY,
        Some(PublishFailure::Timeout) => StatusCode::GATEWAY_TIMEOUT,
    }
}

/// POST /workspaces/{workspace_id}/publish
async fn publish(
    State(state): State<AppState>,
    Path(workspace_id): Path<String>,
    body: Result<axum::Json<Content>, JsonRejection>,
) -> Response {
    let started = Instant::now();
    let request_id = new_request_id();

    let content = match body {
        Ok(axum::Json(content)) => content,
        Err(rejection) => {
            let err = ApiError::BadRequest(rejection.body_text());
            return finish("publish", started, err.with_request_id(&request_id));
        }
    };

    let report = match state.publisher.publish(&workspace_id, &content).await {
        Ok(report) => report,
        Err(e) => {
            warn!(request_id, workspace_id, error = %e, "publish rejected");
            return finish("publish", started, ApiError::from(e).with_request_id(&request_id));
        }
    };

    let status = publish_status(&report);
    info!(
        request_id,
        workspace_id,
        status = status.as_u16(),
        trace = %report.trace,
        "publish request completed"
    );

    let retry_after = match report.failure() {
        Some(PublishFailure::RateLimited { retry_after_secs }) => Some(retry_after_secs),
        Some(PublishFailure::NoCapacity) => {
            earliest_reset_secs(&state.pools, &workspace_id, state.sweep_interval).await
        }
        _ => None,
    };

    let body = serde_json::json!({
        "request_id": request_id,
        "report": report,
    });
    let mut response = json_response(status, body.to_string());
    if let Some(secs) = retry_after {
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from(secs));
    }
    finish("publish", started, response)
}

/// Seconds until the first rate-limited credential of the workspace is
/// usable again. A credential whose reset already passed comes back only with
/// the next sweep, so it is reported as one sweep interval away.
async fn earliest_reset_secs(
    pools: &CredentialPools,
    workspace_id: &str,
    sweep_interval: Duration,
) -> Option<u64> {
    let pending_sweep = sweep_interval.as_secs().max(1);
    pools
        .stats(workspace_id)
        .await
        .credentials
        .iter()
        .filter_map(|c| c.rate_limit_remaining_secs)
        .map(|secs| if secs == 0 { pending_sweep } else { secs })
        .min()
}

/// Request body for credential registration.
#[derive(Deserialize)]
struct RegisterRequest {
    account_id: String,
    token: Secret<String>,
    #[serde(default)]
    refresh_token: Option<Secret<String>>,
    /// Unix timestamp in milliseconds.
    #[serde(default)]
    expires_at: Option<u64>,
}

/// POST /workspaces/{workspace_id}/credentials
async fn register_credential(
    State(state): State<AppState>,
    Path(workspace_id): Path<String>,
    body: Result<axum::Json<RegisterRequest>, JsonRejection>,
) -> Response {
    let started = Instant::now();
    let request_id = new_request_id();

    let body = match body {
        Ok(axum::Json(body)) => body,
        Err(rejection) => {
            let err = ApiError::BadRequest(rejection.body_text());
            return finish("register_credential", started, err.with_request_id(&request_id));
        }
    };

    let new = NewCredential {
        workspace_id: workspace_id.clone(),
        account_id: body.account_id,
        token: body.token,
        refresh_token: body.refresh_token,
        expires_at: body.expires_at,
    };

    let response = match state.pools.register_credential(new).await {
        Ok(credential_id) => {
            info!(request_id, workspace_id, credential_id, "credential registered via API");
            json_response(
                StatusCode::CREATED,
                serde_json::json!({ "credential_id": credential_id }).to_string(),
            )
        }
        Err(e) => {
            warn!(request_id, workspace_id, error = %e, "credential registration failed");
            ApiError::from(e).with_request_id(&request_id)
        }
    };
    finish("register_credential", started, response)
}

/// DELETE /workspaces/{workspace_id}/credentials/{credential_id}
async fn revoke_credential(
    State(state): State<AppState>,
    Path((workspace_id, credential_id)): Path<(String, String)>,
) -> Response {
    let started = Instant::now();
    let request_id = new_request_id();

    let response = match state
        .pools
        .revoke_credential(&workspace_id, &credential_id)
        .await
    {
        Ok(()) => {
            info!(request_id, workspace_id, credential_id, "credential revoked");
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => ApiError::from(e).with_request_id(&request_id),
    };
    finish("revoke_credential", started, response)
}

/// GET /workspaces/{workspace_id}/pool
async fn pool_stats(
    State(state): State<AppState>,
    Path(workspace_id): Path<String>,
) -> Response {
    let started = Instant::now();
    let stats = state.pools.stats(&workspace_id).await;
    let response = match serde_json::to_string(&stats) {
        Ok(body) => json_response(StatusCode::OK, body),
        Err(e) => ApiError::Internal(format!("serializing pool stats: {e}"))
            .with_request_id(&new_request_id()),
    };
    finish("pool_stats", started, response)
}

/// GET /health
async fn health(State(state): State<AppState>) -> Response {
    let body = serde_json::json!({
        "status": "healthy",
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "workspaces": state.pools.workspace_ids().await.len(),
    });
    json_response(StatusCode::OK, body.to_string())
}

/// Prometheus metrics endpoint, text exposition format.
async fn metrics_text(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}
