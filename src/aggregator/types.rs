use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const GLOBAL_NODE: &str = "global";

/// Normalizes a `(plugin, node)` pair to the shared map key, substituting
/// `global` for an empty node. Used by every type below so the substitution
/// rule lives in one place.
pub fn key(plugin: &str, node: &str) -> String {
    let node = if node.is_empty() { GLOBAL_NODE } else { node };
    format!("{plugin}/{node}")
}

/// An entry the Expected-Result Registry commits to waiting for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExpectedResult {
    pub plugin: String,
    pub node: String,
}

impl ExpectedResult {
    pub fn new(plugin: impl Into<String>, node: impl Into<String>) -> Self {
        let node = node.into();
        let node = if node.is_empty() {
            GLOBAL_NODE.to_string()
        } else {
            node
        };
        Self {
            plugin: plugin.into(),
            node,
        }
    }

    pub fn key(&self) -> String {
        key(&self.plugin, &self.node)
    }
}

/// A result artifact: uploaded via PUT, or synthesized by a Supervisor on
/// pod failure. Its `body` is drained to disk exactly once.
#[derive(Debug, Clone)]
pub struct ResultPayload {
    pub plugin: String,
    pub node: String,
    pub mime_type: String,
    pub filename: Option<String>,
    pub body: Bytes,
    pub error_message: Option<String>,
}

impl ResultPayload {
    pub fn key(&self) -> String {
        key(&self.plugin, &self.node)
    }

    /// A synthetic failure result, as emitted by a Supervisor.
    pub fn synthetic_error(plugin: impl Into<String>, node: impl Into<String>, error: impl Into<String>) -> Self {
        let error_message = error.into();
        let body = serde_json::json!({ "error": error_message }).to_string();
        Self {
            plugin: plugin.into(),
            node: node.into(),
            mime_type: "application/json".to_string(),
            filename: None,
            body: Bytes::from(body),
            error_message: Some(error_message),
        }
    }

    pub fn is_synthetic_failure(&self) -> bool {
        self.error_message.is_some()
    }
}

/// Latest progress for a `(plugin, node)` key; older values are overwritten.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    pub plugin: String,
    pub node: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub total: i64,
    #[serde(default)]
    pub completed: i64,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub failures: Vec<String>,
}

impl ProgressUpdate {
    pub fn key(&self) -> String {
        key(&self.plugin, &self.node)
    }
}

/// A failed-map entry: the key stays outstanding until a retry succeeds.
#[derive(Debug, Clone)]
pub struct FailedEntry {
    pub recorded_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_substitutes_global_for_empty_node() {
        assert_eq!(key("systemd_logs", ""), "systemd_logs/global");
        assert_eq!(key("systemd_logs", "node1"), "systemd_logs/node1");
    }

    #[test]
    fn expected_result_normalizes_node() {
        let e = ExpectedResult::new("e2e", "");
        assert_eq!(e.node, "global");
        assert_eq!(e.key(), "e2e/global");
    }
}
