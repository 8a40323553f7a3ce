//! Side-channel key/value storage.
//!
//! Requests and persistent connections each carry a [`DataMap`] so handlers can
//! annotate them (for example with an authenticated user name) without touching
//! protocol headers or body. Clones share the same underlying map.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

type Value = Arc<dyn Any + Send + Sync>;

/// Shared, typed key/value store.
#[derive(Clone, Default)]
pub struct DataMap {
    entries: Arc<Mutex<HashMap<String, Value>>>,
}

impl DataMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value` under `key`, replacing any previous value.
    pub fn insert<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.lock().insert(key.into(), Arc::new(value));
    }

    /// Returns a clone of the value under `key` if it exists and has type `T`.
    pub fn get<T: Any + Send + Sync + Clone>(&self, key: &str) -> Option<T> {
        self.lock()
            .get(key)
            .and_then(|v| v.downcast_ref::<T>())
            .cloned()
    }

    pub fn remove(&self, key: &str) -> bool {
        self.lock().remove(key).is_some()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    /// Snapshot of the keys currently stored, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Value>> {
        // a panicking writer cannot leave the map half-updated
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for DataMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataMap").field("keys", &self.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_lookup() {
        let data = DataMap::new();
        data.insert("user", "alice".to_string());
        data.insert("attempts", 3u32);

        assert_eq!(data.get::<String>("user").as_deref(), Some("alice"));
        assert_eq!(data.get::<u32>("attempts"), Some(3));
        // wrong type reads as absent
        assert_eq!(data.get::<u64>("attempts"), None);
        assert_eq!(data.keys(), vec!["attempts".to_string(), "user".to_string()]);
    }

    #[test]
    fn clones_share_entries() {
        let a = DataMap::new();
        let b = a.clone();
        b.insert("k", 1i32);
        assert!(a.contains_key("k"));
        assert!(a.remove("k"));
        assert!(b.is_empty());
    }
}
