//! Pool service client
//!
//! Both calls POST JSON with `Authorization: Bearer <api key>`. Any non-200
//! status is an error; a quota denial is a 200 with `allowed: false`.

use std::time::Duration;

use common::Secret;
use tracing::debug;

use crate::error::{Error, Result};
use crate::types::{GetKeyRequest, GetKeyResponse, LogUsageRequest, LogUsageResponse};

pub const GET_KEY_PATH: &str = "/api/v1/internal/pool/get-key";
pub const LOG_USAGE_PATH: &str = "/api/v1/internal/pool/log-usage";
pub const STATS_PATH: &str = "/api/v1/internal/pool/stats";

/// Per-request timeout applied to every call.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Client {
    base_url: String,
    api_key: Secret<String>,
    http: reqwest::Client,
}

impl Client {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<Secret<String>>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Http(format!("building HTTP client: {e}")))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Ask which pool key this user's device may use.
    pub async fn get_pool_key(&self, request: &GetKeyRequest) -> Result<GetKeyResponse> {
        let response = self.post(GET_KEY_PATH, request).await?;
        let decision = response
            .json::<GetKeyResponse>()
            .await
            .map_err(|e| Error::Decode(format!("get-key response: {e}")))?;
        debug!(
            user_id = %request.user_id,
            allowed = decision.allowed,
            device_count = decision.device_count,
            "pool key requested"
        );
        Ok(decision)
    }

    /// Append a usage record for a completed stream.
    pub async fn log_usage(&self, request: &LogUsageRequest) -> Result<LogUsageResponse> {
        let response = self.post(LOG_USAGE_PATH, request).await?;
        response
            .json::<LogUsageResponse>()
            .await
            .map_err(|e| Error::Decode(format!("log-usage response: {e}")))
    }

    /// Fetch the aggregate pool stats document.
    pub async fn stats(&self) -> Result<serde_json::Value> {
        let request = self
            .http
            .get(format!("{}{STATS_PATH}", self.base_url))
            .bearer_auth(self.api_key.expose());
        let response = self.send(STATS_PATH, request).await?;
        response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| Error::Decode(format!("stats response: {e}")))
    }

    async fn post<T: serde::Serialize + ?Sized>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<reqwest::Response> {
        let request = self
            .http
            .post(format!("{}{path}", self.base_url))
            .bearer_auth(self.api_key.expose())
            .json(body);
        self.send(path, request).await
    }

    async fn send(&self, path: &str, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let response = request
            .send()
            .await
            .map_err(|e| Error::Http(format!("{path}: {e}")))?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<no body>"));
            return Err(Error::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}
