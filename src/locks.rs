//! Per-key async gates.
//!
//! Critical sections over in-memory state never await and use
//! `parking_lot` locks directly. Work that must await while holding
//! exclusivity (persisting an alert transition) goes through `KeyedGates`.

use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;

/// One async mutex per key, created on first use.
///
/// Holders of the same key serialize; different keys only share a map shard
/// for the duration of the lookup.
pub(crate) struct KeyedGates<K: Eq + Hash> {
    gates: DashMap<K, Arc<tokio::sync::Mutex<()>>>,
}

impl<K: Eq + Hash + Clone> KeyedGates<K> {
    pub(crate) fn new() -> Self {
        Self {
            gates: DashMap::new(),
        }
    }

    pub(crate) fn gate(&self, key: &K) -> Arc<tokio::sync::Mutex<()>> {
        // ---
        if let Some(gate) = self.gates.get(key) {
            return gate.value().clone();
        }
        self.gates.entry(key.clone()).or_default().value().clone()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[tokio::test]
    async fn test_same_key_shares_gate() {
        // ---
        let gates: KeyedGates<String> = KeyedGates::new();
        let a = gates.gate(&"s1".to_string());
        let b = gates.gate(&"s1".to_string());
        let other = gates.gate(&"s2".to_string());

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &other));

        let _held = a.lock().await;
        assert!(b.try_lock().is_err(), "same key must serialize");
        assert!(other.try_lock().is_ok(), "unrelated key must not block");
    }

    #[tokio::test]
    async fn test_gates_from_many_tasks_converge() {
        // ---
        let gates: Arc<KeyedGates<u32>> = Arc::new(KeyedGates::new());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let gates = gates.clone();
                tokio::spawn(async move { gates.gate(&7) })
            })
            .collect();

        let first = gates.gate(&7);
        for handle in handles {
            let gate = handle.await.unwrap();
            assert!(Arc::ptr_eq(&first, &gate));
        }
    }
}
