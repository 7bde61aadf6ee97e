//! HTTP error mapping
//!
//! Per-request failures become JSON error responses here and never propagate
//! as Rust errors past the handler.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Everything a request handler can fail with.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("missing or invalid bearer token")]
    Unauthorized,

    #[error(transparent)]
    Pool(#[from] key_pool::Error),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Pool(key_pool::Error::InvalidRequest(_)) => StatusCode::BAD_REQUEST,
            ApiError::Pool(key_pool::Error::StoreUnavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Pool(key_pool::Error::NoActiveKey | key_pool::Error::DuplicateKey(_)) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Stable `error.type` value for the JSON body.
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::Unauthorized => "unauthorized",
            ApiError::Pool(key_pool::Error::InvalidRequest(_)) => "invalid_request",
            ApiError::Pool(key_pool::Error::StoreUnavailable(_)) => "store_unavailable",
            ApiError::Pool(key_pool::Error::NoActiveKey) => "no_active_key",
            ApiError::Pool(key_pool::Error::DuplicateKey(_)) => "internal_error",
        }
    }

    /// Client-facing message. `InvalidRequest` detail is safe to echo; store
    /// internals are not.
    fn public_message(&self) -> String {
        match self {
            ApiError::Pool(key_pool::Error::InvalidRequest(msg)) => msg.clone(),
            ApiError::Pool(key_pool::Error::StoreUnavailable(_)) => {
                "assignment store unavailable".to_string()
            }
            other => other.to_string(),
        }
    }

    pub fn into_response(self, request_id: &str) -> Response {
        error_response(self.status(), self.kind(), &self.public_message(), request_id)
    }
}

/// JSON error body: `{"error":{"type","message","request_id"}}`.
pub fn error_response(status: StatusCode, kind: &str, message: &str, request_id: &str) -> Response {
    let body = serde_json::json!({
        "error": {
            "type": kind,
            "message": message,
            "request_id": request_id,
        }
    });
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_errors_map_to_status_codes() {
        let cases = [
            (
                ApiError::Pool(key_pool::Error::InvalidRequest("Missing required fields: userId".into())),
                StatusCode::BAD_REQUEST,
                "invalid_request",
            ),
            (
                ApiError::Pool(key_pool::Error::StoreUnavailable("disk full".into())),
                StatusCode::SERVICE_UNAVAILABLE,
                "store_unavailable",
            ),
            (
                ApiError::Pool(key_pool::Error::NoActiveKey),
                StatusCode::INTERNAL_SERVER_ERROR,
                "no_active_key",
            ),
            (ApiError::Unauthorized, StatusCode::UNAUTHORIZED, "unauthorized"),
        ];
        for (err, status, kind) in cases {
            assert_eq!(err.status(), status, "{err}");
            assert_eq!(err.kind(), kind, "{err}");
        }
    }

    #[tokio::test]
    async fn error_body_has_type_message_and_request_id() {
        let response = ApiError::Pool(key_pool::Error::InvalidRequest(
            "Missing required fields: deviceId".into(),
        ))
        .into_response("req_abc");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"]["type"], "invalid_request");
        assert_eq!(json["error"]["message"], "Missing required fields: deviceId");
        assert_eq!(json["error"]["request_id"], "req_abc");
    }

    #[tokio::test]
    async fn store_detail_not_echoed_to_client() {
        let response = ApiError::Pool(key_pool::Error::StoreUnavailable(
            "writing /var/lib/pool-api/state.json: permission denied".into(),
        ))
        .into_response("req_abc");

        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let text = String::from_utf8_lossy(&body);
        assert!(!text.contains("/var/lib"), "got: {text}");
    }
}
