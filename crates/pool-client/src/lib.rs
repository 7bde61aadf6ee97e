//! HTTP client for the pool key service
//!
//! Downstream proxies call the service twice per stream:
//! 1. `get_pool_key` before touching the upstream, to learn which shared
//!    credential this user's device may use (or that it is over quota)
//! 2. `log_usage` after serving, to append an accounting record
//!
//! The request/response types are the wire format shared with the service.

pub mod client;
pub mod error;
pub mod types;

pub use client::{Client, GET_KEY_PATH, LOG_USAGE_PATH, STATS_PATH};
pub use error::{Error, Result};
pub use types::{GetKeyRequest, GetKeyResponse, LogUsageRequest, LogUsageResponse};
