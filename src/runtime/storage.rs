//! Per-instance key/value storage.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::Value;

/// JSON values shared by a script's callbacks.
#[derive(Debug, Default)]
pub struct Storage {
    values: Mutex<FxHashMap<String, Value>>,
}

impl Storage {
    /// Creates empty storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value` under `key`, returning the previous value.
    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.values.lock().insert(key.into(), value.into())
    }

    /// Returns a copy of the value under `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        self.values.lock().get(key).cloned()
    }

    /// Removes `key`.
    pub fn remove(&self, key: &str) -> Option<Value> {
        self.values.lock().remove(key)
    }

    /// Returns the stored keys, sorted.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.values.lock().keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    #[test]
    fn test_set_get_remove() {
        let storage = Storage::new();
        assert_eq!(storage.set("id", 3), None);
        assert_eq!(storage.set("id", 4), Some(json!(3)));
        storage.set("url", "ws://localhost:3000");

        assert_eq!(storage.get("id"), Some(json!(4)));
        assert_eq!(storage.keys(), vec!["id", "url"]);
        assert_eq!(storage.remove("id"), Some(json!(4)));
        assert!(storage.get("id").is_none());
    }
}
