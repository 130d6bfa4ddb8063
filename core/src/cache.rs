use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Memoises decoded GET payloads for the lifetime of a session.
#[derive(Clone, Default)]
pub struct ResponseCache {
    entries: Arc<Mutex<HashMap<String, Value>>>,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key(method: &str, path: &str, params: Option<&Value>) -> String {
        let params = params.map(Value::to_string).unwrap_or_else(|| "{}".to_string());
        format!("{method}-{path}-{params}")
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let hit = self.entries.lock().get(key).cloned();
        if hit.is_some() {
            debug!(key, "response cache hit");
        }
        hit
    }

    pub fn insert(&self, key: impl Into<String>, value: Value) {
        self.entries.lock().insert(key.into(), value);
    }

    pub fn invalidate(&self, key: &str) {
        self.entries.lock().remove(key);
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keys_include_method_path_and_params() {
        assert_eq!(ResponseCache::key("GET", "/ai/models", None), "GET-/ai/models-{}");
        assert_eq!(
            ResponseCache::key("GET", "/x", Some(&json!({ "a": 1 }))),
            r#"GET-/x-{"a":1}"#
        );
    }

    #[test]
    fn stores_and_invalidates() {
        let cache = ResponseCache::new();
        cache.insert("k", json!([1, 2]));
        assert_eq!(cache.get("k"), Some(json!([1, 2])));
        cache.invalidate("k");
        assert!(cache.get("k").is_none());
        assert!(cache.is_empty());
    }
}
