//! Transient in-process store

use std::collections::HashMap;

use tokio::sync::{Mutex, RwLock};

use super::{
    AssignmentMap, AssignmentStore, DeviceAssignment, InsertOutcome, StoreFuture, StoreSnapshot,
    UsageRecord, count_all, tally_by_key, tail,
};

/// Keeps everything in process memory; state is lost on restart.
///
/// The assignment map and the usage log sit behind separate locks, so a
/// usage append never waits on an admission.
#[derive(Default)]
pub struct MemoryStore {
    assignments: RwLock<AssignmentMap>,
    usage: Mutex<Vec<UsageRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AssignmentStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    fn find_assignment<'a>(
        &'a self,
        user_id: &'a str,
        device_id: &'a str,
    ) -> StoreFuture<'a, Option<DeviceAssignment>> {
        Box::pin(async move {
            let assignments = self.assignments.read().await;
            Ok(assignments
                .get(user_id)
                .and_then(|devices| devices.get(device_id))
                .cloned())
        })
    }

    fn insert_assignment_if_absent(
        &self,
        assignment: DeviceAssignment,
    ) -> StoreFuture<'_, InsertOutcome> {
        Box::pin(async move {
            let mut assignments = self.assignments.write().await;
            let devices = assignments.entry(assignment.user_id.clone()).or_default();
            if let Some(existing) = devices.get(&assignment.device_id) {
                return Ok(InsertOutcome::Existing(existing.clone()));
            }
            devices.insert(assignment.device_id.clone(), assignment);
            Ok(InsertOutcome::Inserted)
        })
    }

    fn touch_assignment(&self, assignment: DeviceAssignment) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut assignments = self.assignments.write().await;
            assignments
                .entry(assignment.user_id.clone())
                .or_default()
                .insert(assignment.device_id.clone(), assignment);
            Ok(())
        })
    }

    fn count_devices<'a>(&'a self, user_id: &'a str) -> StoreFuture<'a, usize> {
        Box::pin(async move {
            let assignments = self.assignments.read().await;
            Ok(assignments.get(user_id).map_or(0, HashMap::len))
        })
    }

    fn count_devices_per_key(&self) -> StoreFuture<'_, HashMap<String, usize>> {
        Box::pin(async move { Ok(tally_by_key(&*self.assignments.read().await)) })
    }

    fn append_usage(&self, record: UsageRecord) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.usage.lock().await.push(record);
            Ok(())
        })
    }

    fn snapshot(&self, recent: usize) -> StoreFuture<'_, StoreSnapshot> {
        Box::pin(async move {
            let assignment_count = count_all(&*self.assignments.read().await);
            let usage = self.usage.lock().await;
            Ok(StoreSnapshot {
                assignment_count,
                usage_record_count: usage.len(),
                recent_usage: tail(&usage, recent),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assignment(user: &str, device: &str, key: &str) -> DeviceAssignment {
        DeviceAssignment {
            user_id: user.into(),
            device_id: device.into(),
            pool_key_id: key.into(),
            last_used_at: 1,
        }
    }

    #[tokio::test]
    async fn insert_if_absent_keeps_first_binding() {
        let store = MemoryStore::new();
        let first = store
            .insert_assignment_if_absent(assignment("u", "d1", "k1"))
            .await
            .unwrap();
        assert_eq!(first, InsertOutcome::Inserted);

        let second = store
            .insert_assignment_if_absent(assignment("u", "d1", "k2"))
            .await
            .unwrap();
        assert_eq!(second, InsertOutcome::Existing(assignment("u", "d1", "k1")));

        let found = store.find_assignment("u", "d1").await.unwrap().unwrap();
        assert_eq!(found.pool_key_id, "k1");
    }

    #[tokio::test]
    async fn count_devices_matches_user_exactly() {
        let store = MemoryStore::new();
        for (user, device) in [("userA", "d1"), ("userA", "d2"), ("userAB", "d1")] {
            store
                .insert_assignment_if_absent(assignment(user, device, "k1"))
                .await
                .unwrap();
        }

        assert_eq!(store.count_devices("userA").await.unwrap(), 2);
        assert_eq!(store.count_devices("userAB").await.unwrap(), 1);
        assert_eq!(store.count_devices("nobody").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn touch_overwrites_existing_pair() {
        let store = MemoryStore::new();
        store
            .insert_assignment_if_absent(assignment("u", "d1", "k1"))
            .await
            .unwrap();

        let mut updated = assignment("u", "d1", "k2");
        updated.last_used_at = 99;
        store.touch_assignment(updated.clone()).await.unwrap();

        assert_eq!(store.find_assignment("u", "d1").await.unwrap(), Some(updated));
        assert_eq!(store.count_devices("u").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn snapshot_and_per_key_counts() {
        let store = MemoryStore::new();
        store
            .insert_assignment_if_absent(assignment("u1", "d1", "k1"))
            .await
            .unwrap();
        store
            .insert_assignment_if_absent(assignment("u2", "d1", "k1"))
            .await
            .unwrap();
        store
            .insert_assignment_if_absent(assignment("u2", "d2", "k2"))
            .await
            .unwrap();
        store
            .append_usage(UsageRecord {
                user_id: "u1".into(),
                pool_key_id: "k1".into(),
                action: "stream-served".into(),
                hash: "abc".into(),
                cached: true,
                bytes: Some(1024),
                timestamp: 5,
            })
            .await
            .unwrap();

        let snapshot = store.snapshot(10).await.unwrap();
        assert_eq!(snapshot.assignment_count, 3);
        assert_eq!(snapshot.usage_record_count, 1);
        assert_eq!(snapshot.recent_usage[0].hash, "abc");

        let per_key = store.count_devices_per_key().await.unwrap();
        assert_eq!(per_key.get("k1"), Some(&2));
        assert_eq!(per_key.get("k2"), Some(&1));
    }
}
