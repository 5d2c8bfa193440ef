//! JSON key-value state machine used by the harness clusters.

use keel_core::machine::{Commit, StateMachine};
use std::collections::HashMap;

/// Build a put command payload
pub fn put(key: &str, value: impl Into<serde_json::Value>) -> Vec<u8> {
    serde_json::json!({ "op": "put", "key": key, "value": value.into() })
        .to_string()
        .into_bytes()
}

/// Build an incr command payload
pub fn incr(key: &str) -> Vec<u8> {
    serde_json::json!({ "op": "incr", "key": key })
        .to_string()
        .into_bytes()
}

/// Build a watch command payload; the submitting session receives change
/// events
pub fn watch() -> Vec<u8> {
    serde_json::json!({ "op": "watch" }).to_string().into_bytes()
}

/// Build a get query payload
pub fn get(key: &str) -> Vec<u8> {
    serde_json::json!({ "op": "get", "key": key })
        .to_string()
        .into_bytes()
}

/// Replicated key-value store with change events
pub struct KvMachine {
    data: HashMap<String, serde_json::Value>,
    watchers: Vec<u64>,
}

impl KvMachine {
    pub fn new() -> Self {
        Self {
            data: HashMap::new(),
            watchers: Vec::new(),
        }
    }

    fn notify(&self, commit: &mut Commit<'_>, key: &str, value: &serde_json::Value) {
        let event = serde_json::json!({ "key": key, "value": value });
        for watcher in &self.watchers {
            commit.publish(*watcher, event.to_string().into_bytes());
        }
    }
}

impl Default for KvMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine for KvMachine {
    fn apply(&mut self, commit: &mut Commit<'_>) -> Result<Vec<u8>, String> {
        let op: serde_json::Value =
            serde_json::from_slice(commit.operation).map_err(|e| format!("bad command: {e}"))?;

        match op["op"].as_str().unwrap_or_default() {
            "put" => {
                let key = op["key"].as_str().ok_or("put requires a key")?.to_string();
                let value = op["value"].clone();
                self.data.insert(key.clone(), value.clone());
                self.notify(commit, &key, &value);
                Ok(b"ok".to_vec())
            }
            "incr" => {
                let key = op["key"].as_str().ok_or("incr requires a key")?.to_string();
                let next = self.data.get(&key).and_then(|v| v.as_i64()).unwrap_or(0) + 1;
                let value = serde_json::json!(next);
                self.data.insert(key.clone(), value.clone());
                self.notify(commit, &key, &value);
                Ok(next.to_string().into_bytes())
            }
            "watch" => {
                self.watchers.push(commit.session);
                Ok(b"ok".to_vec())
            }
            other => Err(format!("unknown command {other}")),
        }
    }

    fn query(&self, operation: &[u8]) -> Result<Vec<u8>, String> {
        let op: serde_json::Value =
            serde_json::from_slice(operation).map_err(|e| format!("bad query: {e}"))?;
        match op["op"].as_str().unwrap_or_default() {
            "get" => {
                let key = op["key"].as_str().ok_or("get requires a key")?;
                let value = self.data.get(key).cloned().unwrap_or(serde_json::Value::Null);
                Ok(value.to_string().into_bytes())
            }
            other => Err(format!("unknown query {other}")),
        }
    }

    fn snapshot(&self) -> Result<Vec<u8>, String> {
        serde_json::to_vec(&serde_json::json!({
            "data": self.data,
            "watchers": self.watchers,
        }))
        .map_err(|e| e.to_string())
    }

    fn restore(&mut self, data: &[u8]) -> Result<(), String> {
        let image: serde_json::Value =
            serde_json::from_slice(data).map_err(|e| e.to_string())?;
        self.data = serde_json::from_value(image["data"].clone()).map_err(|e| e.to_string())?;
        self.watchers =
            serde_json::from_value(image["watchers"].clone()).map_err(|e| e.to_string())?;
        Ok(())
    }
}
