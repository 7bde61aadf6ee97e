//! Admission control, key reuse, and usage accounting
//!
//! `request_assignment` decides whether a `(user_id, device_id)` pair gets a
//! pool key. A known pair always gets its existing key back without a quota
//! check; a new pair is admitted only while the user is under
//! `max_devices_per_user`. A denial mutates nothing.
//!
//! Admissions run one at a time behind an async mutex so the
//! lookup → quota check → insert sequence is atomic for every pair and every
//! user. Usage appends never take that mutex.

use std::sync::Arc;

use common::Secret;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::registry::{PoolKey, Registry};
use crate::store::{AssignmentStore, DeviceAssignment, InsertOutcome, UsageRecord, unix_millis};

/// Message returned with a quota denial.
pub const DEVICE_LIMIT_MESSAGE: &str = "Maximum device limit reached";

/// Tunables for the engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_devices_per_user: usize,
    /// How many usage records `stats` returns.
    pub recent_usage_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_devices_per_user: 3,
            recent_usage_limit: 10,
        }
    }
}

/// A get-key request. `action` and `hash` are carried for logging only.
#[derive(Debug, Clone, Default)]
pub struct AssignmentRequest {
    pub user_id: String,
    pub device_id: String,
    pub action: String,
    pub hash: String,
}

/// A usage-completion event.
#[derive(Debug, Clone, Default)]
pub struct UsageRequest {
    pub user_id: String,
    pub pool_key_id: String,
    pub action: String,
    pub hash: String,
    pub cached: bool,
    pub bytes: Option<u64>,
}

/// An admitted request: which key the device uses from now on.
#[derive(Debug, Clone)]
pub struct Grant {
    pub pool_key_id: String,
    pub credential: Secret<String>,
    /// Devices bound for the user after this admission.
    pub device_count: usize,
    /// True when the pair already held an assignment.
    pub reused: bool,
}

#[derive(Debug, Clone)]
pub enum AssignmentDecision {
    Granted(Grant),
    /// Quota reached. Nothing was written.
    Denied { device_count: usize },
}

impl AssignmentDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, AssignmentDecision::Granted(_))
    }

    pub fn device_count(&self) -> usize {
        match self {
            AssignmentDecision::Granted(grant) => grant.device_count,
            AssignmentDecision::Denied { device_count } => *device_count,
        }
    }

    pub fn pool_key_id(&self) -> Option<&str> {
        match self {
            AssignmentDecision::Granted(grant) => Some(&grant.pool_key_id),
            AssignmentDecision::Denied { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UsageResult {
    pub success: bool,
}

/// Per-key view in `PoolStats`. Never includes the credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyStats {
    pub id: String,
    pub active: bool,
    pub capacity: u32,
    pub assigned_devices: usize,
}

/// Read-only snapshot of the pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub pool_key_count: usize,
    pub assignment_count: usize,
    pub usage_record_count: usize,
    /// Most recent usage records, oldest first.
    pub recent_usage: Vec<UsageRecord>,
    pub keys: Vec<KeyStats>,
}

/// Applies the quota and reuse rules over a registry and a store.
pub struct AssignmentEngine {
    registry: Arc<Registry>,
    store: Arc<dyn AssignmentStore>,
    config: EngineConfig,
    admission: Mutex<()>,
}

impl AssignmentEngine {
    pub fn new(
        registry: Arc<Registry>,
        store: Arc<dyn AssignmentStore>,
        config: EngineConfig,
    ) -> Self {
        info!(
            max_devices_per_user = config.max_devices_per_user,
            store = store.backend(),
            pool_keys = registry.keys().len(),
            selection = registry.strategy_name(),
            "assignment engine ready"
        );
        Self {
            registry,
            store,
            config,
            admission: Mutex::new(()),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store_backend(&self) -> &'static str {
        self.store.backend()
    }

    /// Decide whether the pair may use a pool key, and which one.
    ///
    /// Fails with `InvalidRequest` when `user_id` or `device_id` is empty,
    /// before any state is read. `NoActiveKey` and `StoreUnavailable` abort
    /// the admission with nothing written.
    pub async fn request_assignment(&self, request: AssignmentRequest) -> Result<AssignmentDecision> {
        require_fields(&[
            ("userId", &request.user_id),
            ("deviceId", &request.device_id),
        ])?;

        let _admission = self.admission.lock().await;

        if let Some(existing) = self
            .store
            .find_assignment(&request.user_id, &request.device_id)
            .await?
        {
            return self.reuse(existing, &request).await;
        }

        let device_count = self.store.count_devices(&request.user_id).await?;
        if device_count >= self.config.max_devices_per_user {
            warn!(
                user_id = %request.user_id,
                device = short_id(&request.device_id),
                device_count,
                limit = self.config.max_devices_per_user,
                "device limit reached"
            );
            metrics::counter!("pool_admissions_total", "outcome" => "denied").increment(1);
            return Ok(AssignmentDecision::Denied { device_count });
        }

        let key = self.registry.select_key()?;
        let assignment = DeviceAssignment {
            user_id: request.user_id.clone(),
            device_id: request.device_id.clone(),
            pool_key_id: key.id.clone(),
            last_used_at: unix_millis(),
        };

        match self.store.insert_assignment_if_absent(assignment).await? {
            InsertOutcome::Inserted => {
                info!(
                    user_id = %request.user_id,
                    device = short_id(&request.device_id),
                    pool_key_id = %key.id,
                    device_count = device_count + 1,
                    action = %request.action,
                    "pool key assigned"
                );
                metrics::counter!("pool_admissions_total", "outcome" => "assigned").increment(1);
                Ok(AssignmentDecision::Granted(grant(key, device_count + 1, false)))
            }
            // Another writer sharing the store bound the pair first.
            InsertOutcome::Existing(existing) => self.reuse(existing, &request).await,
        }
    }

    /// Hand a known pair its existing key and refresh `last_used_at`.
    ///
    /// If the bound key has been removed from the registry or deactivated,
    /// the same assignment is moved to a freshly selected key; the device
    /// keeps its slot.
    async fn reuse(
        &self,
        mut assignment: DeviceAssignment,
        request: &AssignmentRequest,
    ) -> Result<AssignmentDecision> {
        let key = match self.registry.get(&assignment.pool_key_id) {
            Some(key) if key.active => key,
            _ => {
                let replacement = self.registry.select_key()?;
                warn!(
                    user_id = %assignment.user_id,
                    device = short_id(&assignment.device_id),
                    from = %assignment.pool_key_id,
                    to = %replacement.id,
                    "bound pool key no longer active, rebinding"
                );
                assignment.pool_key_id = replacement.id.clone();
                replacement
            }
        };

        assignment.last_used_at = unix_millis();
        self.store.touch_assignment(assignment).await?;
        let device_count = self.store.count_devices(&request.user_id).await?;

        debug!(
            user_id = %request.user_id,
            device = short_id(&request.device_id),
            pool_key_id = %key.id,
            device_count,
            action = %request.action,
            "pool key reused"
        );
        metrics::counter!("pool_admissions_total", "outcome" => "reused").increment(1);
        Ok(AssignmentDecision::Granted(grant(key, device_count, true)))
    }

    /// Append one usage record. No quota applies; no deduplication happens.
    pub async fn record_usage(&self, request: UsageRequest) -> Result<UsageResult> {
        require_fields(&[("userId", &request.user_id), ("action", &request.action)])?;

        let record = UsageRecord {
            user_id: request.user_id,
            pool_key_id: request.pool_key_id,
            action: request.action,
            hash: request.hash,
            cached: request.cached,
            bytes: request.bytes,
            timestamp: unix_millis(),
        };

        debug!(
            user_id = %record.user_id,
            pool_key_id = %record.pool_key_id,
            action = %record.action,
            cached = record.cached,
            bytes = record.bytes,
            "usage recorded"
        );
        self.store.append_usage(record).await?;
        metrics::counter!("pool_usage_records_total").increment(1);
        Ok(UsageResult { success: true })
    }

    /// Counts, per-key load, and the most recent usage records.
    pub async fn stats(&self) -> Result<PoolStats> {
        let snapshot = self.store.snapshot(self.config.recent_usage_limit).await?;
        let per_key = self.store.count_devices_per_key().await?;

        let keys = self
            .registry
            .keys()
            .iter()
            .map(|key| KeyStats {
                id: key.id.clone(),
                active: key.active,
                capacity: key.capacity,
                assigned_devices: per_key.get(&key.id).copied().unwrap_or(0),
            })
            .collect();

        Ok(PoolStats {
            pool_key_count: self.registry.keys().len(),
            assignment_count: snapshot.assignment_count,
            usage_record_count: snapshot.usage_record_count,
            recent_usage: snapshot.recent_usage,
            keys,
        })
    }
}

fn grant(key: &PoolKey, device_count: usize, reused: bool) -> Grant {
    Grant {
        pool_key_id: key.id.clone(),
        credential: key.credential.clone(),
        device_count,
        reused,
    }
}

fn require_fields(fields: &[(&str, &String)]) -> Result<()> {
    let missing: Vec<&str> = fields
        .iter()
        .filter(|(_, value)| value.is_empty())
        .map(|(name, _)| *name)
        .collect();
    if missing.is_empty() {
        return Ok(());
    }
    Err(Error::InvalidRequest(format!(
        "Missing required fields: {}",
        missing.join(", ")
    )))
}

/// First 8 characters of a device id, for log fields.
fn short_id(id: &str) -> &str {
    id.char_indices().nth(8).map_or(id, |(idx, _)| &id[..idx])
}
