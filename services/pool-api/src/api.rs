//! Internal pool routes: get-key, log-usage, stats
//!
//! Each handler authenticates the caller (when an API key is configured),
//! decodes the camelCase body, calls the engine, and records the request in
//! Prometheus and the service counters.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Json;
use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use common::Secret;
use key_pool::{
    AssignmentDecision, AssignmentEngine, AssignmentRequest, DEVICE_LIMIT_MESSAGE, UsageRequest,
    client_ip, derive_device_id,
};
use metrics_exporter_prometheus::PrometheusHandle;
use pool_client::{GetKeyRequest, GetKeyResponse, LogUsageRequest, LogUsageResponse};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{error, instrument, warn};

use crate::error::ApiError;
use crate::metrics::record_request;
use crate::service::ServiceMetrics;

/// Message returned with a grant.
const GRANT_MESSAGE: &str = "Pool key assigned successfully";

/// Request bodies are a handful of short strings.
const MAX_BODY_BYTES: usize = 64 * 1024;

/// Shared application state accessible from all handlers
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<AssignmentEngine>,
    pub metrics: ServiceMetrics,
    pub prometheus: PrometheusHandle,
    /// Bearer token required on internal routes; `None` leaves them open.
    pub api_key: Option<Arc<Secret<String>>>,
    pub derive_device_id: bool,
}

pub async fn get_key_handler(State(state): State<AppState>, request: Request<Body>) -> Response {
    let request_id = new_request_id();
    let started = Instant::now();
    let _in_flight = state.metrics.begin_request();
    let result = get_key(&state, request, &request_id).await;
    finish("get-key", &state, started, &request_id, result)
}

pub async fn log_usage_handler(State(state): State<AppState>, request: Request<Body>) -> Response {
    let request_id = new_request_id();
    let started = Instant::now();
    let _in_flight = state.metrics.begin_request();
    let result = log_usage(&state, request, &request_id).await;
    finish("log-usage", &state, started, &request_id, result)
}

pub async fn stats_handler(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let request_id = new_request_id();
    let started = Instant::now();
    let _in_flight = state.metrics.begin_request();
    let result = match authorize(&state, &headers) {
        Ok(()) => state.engine.stats().await.map_err(ApiError::from),
        Err(e) => Err(e),
    };
    finish("stats", &state, started, &request_id, result)
}

#[instrument(skip_all, fields(request_id = %request_id))]
async fn get_key(
    state: &AppState,
    request: Request<Body>,
    request_id: &str,
) -> Result<GetKeyResponse, ApiError> {
    authorize(state, request.headers())?;

    let remote_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_default();
    let headers = request.headers().clone();
    let body: GetKeyRequest = read_json(request).await?;

    let mut device_id = body.device_id;
    if device_id.is_empty() && state.derive_device_id {
        let ip = client_ip(
            header_str(&headers, "x-forwarded-for"),
            header_str(&headers, "x-real-ip"),
            &remote_addr,
        );
        let user_agent = header_str(&headers, "user-agent").unwrap_or("");
        device_id = derive_device_id(&ip, user_agent);
    }

    let decision = state
        .engine
        .request_assignment(AssignmentRequest {
            user_id: body.user_id,
            device_id,
            action: body.action,
            hash: body.hash,
        })
        .await?;

    Ok(match decision {
        AssignmentDecision::Granted(grant) => GetKeyResponse {
            allowed: true,
            pool_key: Some(grant.credential.expose().clone()),
            pool_key_id: Some(grant.pool_key_id),
            device_count: grant.device_count,
            message: Some(GRANT_MESSAGE.to_string()),
        },
        AssignmentDecision::Denied { device_count } => GetKeyResponse {
            allowed: false,
            pool_key: None,
            pool_key_id: None,
            device_count,
            message: Some(DEVICE_LIMIT_MESSAGE.to_string()),
        },
    })
}

#[instrument(skip_all, fields(request_id = %request_id))]
async fn log_usage(
    state: &AppState,
    request: Request<Body>,
    request_id: &str,
) -> Result<LogUsageResponse, ApiError> {
    authorize(state, request.headers())?;
    let body: LogUsageRequest = read_json(request).await?;

    let result = state
        .engine
        .record_usage(UsageRequest {
            user_id: body.user_id,
            pool_key_id: body.pool_key_id,
            action: body.action,
            hash: body.hash,
            cached: body.cached,
            bytes: body.bytes,
        })
        .await?;

    Ok(LogUsageResponse {
        success: result.success,
        message: Some("Usage logged successfully".to_string()),
    })
}

/// Serialize the outcome, count it, and log failures at a level matching
/// who is at fault.
fn finish<T: Serialize>(
    route: &'static str,
    state: &AppState,
    started: Instant,
    request_id: &str,
    result: Result<T, ApiError>,
) -> Response {
    let response = match result {
        Ok(body) => (StatusCode::OK, Json(body)).into_response(),
        Err(err) => {
            state.metrics.record_error();
            let status = err.status();
            if status.is_server_error() {
                error!(route, request_id, status = status.as_u16(), error = %err, "request failed");
            } else {
                warn!(route, request_id, status = status.as_u16(), error = %err, "request rejected");
            }
            err.into_response(request_id)
        }
    };
    record_request(route, response.status().as_u16(), started.elapsed().as_secs_f64());
    response
}

/// Check `Authorization: Bearer <key>` when an API key is configured.
fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = state.api_key.as_deref() else {
        return Ok(());
    };
    let presented = header_str(headers, "authorization")
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(ApiError::Unauthorized)?;
    if constant_time_eq(presented.as_bytes(), expected.expose().as_bytes()) {
        Ok(())
    } else {
        Err(ApiError::Unauthorized)
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

async fn read_json<T: DeserializeOwned>(request: Request<Body>) -> Result<T, ApiError> {
    let bytes = axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES)
        .await
        .map_err(|e| key_pool::Error::InvalidRequest(format!("unreadable body: {e}")))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| key_pool::Error::InvalidRequest(format!("invalid JSON body: {e}")).into())
}

fn header_str<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn new_request_id() -> String {
    format!("req_{}", uuid::Uuid::new_v4().as_simple())
}
