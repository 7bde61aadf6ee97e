//! Pool registry and key selection strategies
//!
//! The registry holds the fixed set of shared keys loaded at startup. Which
//! active key serves the next new device is decided by a pluggable
//! `SelectionStrategy`; the quota and reuse rules in the engine do not depend
//! on the choice.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};

use common::Secret;
use serde::Deserialize;
use tracing::info;

use crate::error::{Error, Result};

/// A shared upstream credential handed out to admitted devices.
#[derive(Debug, Clone)]
pub struct PoolKey {
    pub id: String,
    pub credential: Secret<String>,
    /// Device slots the upstream account supports. Reported, not enforced.
    pub capacity: u32,
    /// Inactive keys are never assigned to a new device.
    pub active: bool,
}

impl PoolKey {
    /// Create an active key.
    pub fn new(id: impl Into<String>, credential: impl Into<Secret<String>>, capacity: u32) -> Self {
        Self {
            id: id.into(),
            credential: credential.into(),
            capacity,
            active: true,
        }
    }

    /// Set the active flag.
    pub fn with_active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }
}

/// Picks one key out of the currently active keys.
///
/// `active` is never empty when `pick` is called and preserves configuration
/// order.
pub trait SelectionStrategy: Send + Sync {
    /// Identifier for logging (e.g. "first-active", "round-robin")
    fn name(&self) -> &'static str;

    fn pick<'k>(&self, active: &[&'k PoolKey]) -> Option<&'k PoolKey>;
}

/// Always the first configured active key.
#[derive(Debug, Default)]
pub struct FirstActive;

impl SelectionStrategy for FirstActive {
    fn name(&self) -> &'static str {
        "first-active"
    }

    fn pick<'k>(&self, active: &[&'k PoolKey]) -> Option<&'k PoolKey> {
        active.first().copied()
    }
}

/// Rotates through the active keys with an atomic cursor.
#[derive(Debug, Default)]
pub struct RoundRobin {
    next_index: AtomicUsize,
}

impl SelectionStrategy for RoundRobin {
    fn name(&self) -> &'static str {
        "round-robin"
    }

    fn pick<'k>(&self, active: &[&'k PoolKey]) -> Option<&'k PoolKey> {
        if active.is_empty() {
            return None;
        }
        let idx = self.next_index.fetch_add(1, Ordering::Relaxed) % active.len();
        Some(active[idx])
    }
}

/// Strategy name as written in configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionKind {
    #[default]
    FirstActive,
    RoundRobin,
}

impl SelectionKind {
    pub fn build(self) -> Box<dyn SelectionStrategy> {
        match self {
            SelectionKind::FirstActive => Box::new(FirstActive),
            SelectionKind::RoundRobin => Box::new(RoundRobin::default()),
        }
    }
}

/// Immutable set of pool keys plus the strategy that chooses among them.
pub struct Registry {
    keys: Vec<PoolKey>,
    strategy: Box<dyn SelectionStrategy>,
}

impl Registry {
    /// Build a registry, rejecting configurations that can never admit anyone.
    ///
    /// Fails with `NoActiveKey` when no key is active and `DuplicateKey` when
    /// two keys share an id.
    pub fn new(keys: Vec<PoolKey>, strategy: Box<dyn SelectionStrategy>) -> Result<Self> {
        let mut seen = HashSet::new();
        for key in &keys {
            if !seen.insert(key.id.as_str()) {
                return Err(Error::DuplicateKey(key.id.clone()));
            }
        }

        let active = keys.iter().filter(|k| k.active).count();
        if active == 0 {
            return Err(Error::NoActiveKey);
        }

        info!(
            keys = keys.len(),
            active,
            strategy = strategy.name(),
            "pool registry initialized"
        );
        Ok(Self { keys, strategy })
    }

    /// Key that should serve the next new device.
    pub fn select_key(&self) -> Result<&PoolKey> {
        let active: Vec<&PoolKey> = self.keys.iter().filter(|k| k.active).collect();
        if active.is_empty() {
            return Err(Error::NoActiveKey);
        }
        self.strategy.pick(&active).ok_or(Error::NoActiveKey)
    }

    /// Look up a key by id, active or not.
    pub fn get(&self, id: &str) -> Option<&PoolKey> {
        self.keys.iter().find(|k| k.id == id)
    }

    /// All configured keys in configuration order.
    pub fn keys(&self) -> &[PoolKey] {
        &self.keys
    }

    /// Name of the selection strategy, for logs and health.
    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: &str) -> PoolKey {
        PoolKey::new(id, format!("cred_{id}"), 35)
    }

    #[test]
    fn first_active_always_returns_first_active_key() {
        let registry = Registry::new(
            vec![key("a").with_active(false), key("b"), key("c")],
            Box::new(FirstActive),
        )
        .unwrap();

        for _ in 0..5 {
            assert_eq!(registry.select_key().unwrap().id, "b");
        }
    }

    #[test]
    fn round_robin_cycles_through_active_keys() {
        let registry = Registry::new(
            vec![key("a"), key("b").with_active(false), key("c")],
            SelectionKind::RoundRobin.build(),
        )
        .unwrap();

        let picks: Vec<String> = (0..4)
            .map(|_| registry.select_key().unwrap().id.clone())
            .collect();
        assert_eq!(picks, vec!["a", "c", "a", "c"]);
    }

    #[test]
    fn no_active_key_rejected_at_construction() {
        let err = Registry::new(vec![key("a").with_active(false)], Box::new(FirstActive))
            .err()
            .unwrap();
        assert!(matches!(err, Error::NoActiveKey));
    }

    #[test]
    fn empty_registry_rejected_at_construction() {
        let err = Registry::new(vec![], Box::new(FirstActive)).err().unwrap();
        assert!(matches!(err, Error::NoActiveKey));
    }

    #[test]
    fn duplicate_ids_rejected() {
        let err = Registry::new(vec![key("a"), key("a")], Box::new(FirstActive))
            .err()
            .unwrap();
        assert!(matches!(err, Error::DuplicateKey(id) if id == "a"));
    }

    #[test]
    fn get_finds_inactive_keys_too() {
        let registry =
            Registry::new(vec![key("a"), key("b").with_active(false)], Box::new(FirstActive))
                .unwrap();
        let b = registry.get("b").unwrap();
        assert!(!b.active);
        assert_eq!(b.credential.expose(), "cred_b");
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.keys().len(), 2);
    }

    #[test]
    fn selection_kind_parses_kebab_case() {
        #[derive(Deserialize)]
        struct Wrapper {
            selection: SelectionKind,
        }
        let parsed: Wrapper = serde_json::from_str(r#"{"selection":"round-robin"}"#).unwrap();
        assert_eq!(parsed.selection, SelectionKind::RoundRobin);
        assert_eq!(SelectionKind::default().build().name(), "first-active");
    }
}
