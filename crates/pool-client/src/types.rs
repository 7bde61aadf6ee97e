//! Wire types for get-key and log-usage
//!
//! Field names are camelCase on the wire. Every request field defaults when
//! absent so the service can report precisely which required field is
//! missing instead of failing deserialization.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GetKeyRequest {
    pub user_id: String,
    pub device_id: String,
    pub action: String,
    pub hash: String,
}

/// Admission decision. Denials are `allowed: false` with a message, not an
/// HTTP error.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetKeyResponse {
    pub allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool_key_id: Option<String>,
    #[serde(default)]
    pub device_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl fmt::Debug for GetKeyResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GetKeyResponse")
            .field("allowed", &self.allowed)
            .field("pool_key", &self.pool_key.as_ref().map(|_| "[REDACTED]"))
            .field("pool_key_id", &self.pool_key_id)
            .field("device_count", &self.device_count)
            .field("message", &self.message)
            .finish()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LogUsageRequest {
    pub user_id: String,
    pub pool_key_id: String,
    pub action: String,
    pub hash: String,
    pub cached: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogUsageResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}
