//! Pool key assignment engine
//!
//! Hands a small set of shared upstream credentials ("pool keys") out to many
//! client devices. Each user may bind at most `max_devices_per_user` distinct
//! devices; a device that already holds an assignment gets the same key back
//! on every call without re-evaluating the quota.
//!
//! Request lifecycle:
//! 1. Caller asks for a key with `(user_id, device_id)` → `AssignmentEngine::request_assignment`
//! 2. Known pair → same key returned, `last_used_at` refreshed
//! 3. New pair under quota → `Registry::select_key` picks a key, assignment stored
//! 4. New pair at quota → denied, nothing mutated
//! 5. Caller finishes using the key → `AssignmentEngine::record_usage` appends to the log
//!
//! State lives behind the `AssignmentStore` trait: `MemoryStore` for transient
//! process memory, `FileStore` for a durable JSON document.

pub mod device;
pub mod engine;
pub mod error;
pub mod registry;
pub mod store;

pub use device::{client_ip, derive_device_id};
pub use engine::{
    AssignmentDecision, AssignmentEngine, AssignmentRequest, DEVICE_LIMIT_MESSAGE, EngineConfig,
    Grant, KeyStats, PoolStats, UsageRequest, UsageResult,
};
pub use error::{Error, Result};
pub use registry::{FirstActive, PoolKey, Registry, RoundRobin, SelectionKind, SelectionStrategy};
pub use store::{
    AssignmentStore, DeviceAssignment, FileStore, InsertOutcome, MemoryStore, StoreSnapshot,
    UsageRecord,
};
