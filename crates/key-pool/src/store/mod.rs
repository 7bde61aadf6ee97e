//! Storage interface for device assignments and the usage log
//!
//! The engine only talks to `AssignmentStore`, so the transient in-memory
//! store and the durable file store are interchangeable. Futures are boxed
//! so the trait stays dyn-compatible (`Arc<dyn AssignmentStore>`).

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Binding of one `(user_id, device_id)` pair to a pool key.
///
/// At most one exists per pair. `last_used_at` is unix milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceAssignment {
    pub user_id: String,
    pub device_id: String,
    pub pool_key_id: String,
    pub last_used_at: u64,
}

/// One completed use of a pool key. Append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub user_id: String,
    pub pool_key_id: String,
    pub action: String,
    pub hash: String,
    pub cached: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes: Option<u64>,
    pub timestamp: u64,
}

/// Result of an insert-if-absent on the assignment map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// The pair was already bound; the stored assignment is returned untouched.
    Existing(DeviceAssignment),
}

/// Read-only view used by `stats`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreSnapshot {
    pub assignment_count: usize,
    pub usage_record_count: usize,
    /// Most recent usage records, oldest first.
    pub recent_usage: Vec<UsageRecord>,
}

/// Boxed future returned by store operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Narrow persistence interface for assignments and usage accounting.
///
/// Every failure is reported as `Error::StoreUnavailable`. A failed mutation
/// must leave no partial state behind.
pub trait AssignmentStore: Send + Sync {
    /// Backend name for logging and health ("memory", "file")
    fn backend(&self) -> &'static str;

    fn find_assignment<'a>(
        &'a self,
        user_id: &'a str,
        device_id: &'a str,
    ) -> StoreFuture<'a, Option<DeviceAssignment>>;

    /// Atomically bind the pair unless it is already bound.
    fn insert_assignment_if_absent(
        &self,
        assignment: DeviceAssignment,
    ) -> StoreFuture<'_, InsertOutcome>;

    /// Overwrite the stored record for the assignment's pair.
    fn touch_assignment(&self, assignment: DeviceAssignment) -> StoreFuture<'_, ()>;

    /// Number of distinct devices bound for the user.
    fn count_devices<'a>(&'a self, user_id: &'a str) -> StoreFuture<'a, usize>;

    /// Number of bound devices per pool key id.
    fn count_devices_per_key(&self) -> StoreFuture<'_, HashMap<String, usize>>;

    fn append_usage(&self, record: UsageRecord) -> StoreFuture<'_, ()>;

    /// Counts plus the last `recent` usage records.
    fn snapshot(&self, recent: usize) -> StoreFuture<'_, StoreSnapshot>;
}

/// `user_id -> device_id -> assignment`. Device counts fall out of the inner
/// map length, so they are never stored separately.
pub(crate) type AssignmentMap = HashMap<String, HashMap<String, DeviceAssignment>>;

pub(crate) fn count_all(map: &AssignmentMap) -> usize {
    map.values().map(HashMap::len).sum()
}

pub(crate) fn tally_by_key(map: &AssignmentMap) -> HashMap<String, usize> {
    let mut counts = HashMap::new();
    for assignment in map.values().flat_map(HashMap::values) {
        *counts.entry(assignment.pool_key_id.clone()).or_insert(0) += 1;
    }
    counts
}

pub(crate) fn tail(log: &[UsageRecord], recent: usize) -> Vec<UsageRecord> {
    log[log.len().saturating_sub(recent)..].to_vec()
}

/// Current wall-clock time as unix milliseconds.
pub fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
