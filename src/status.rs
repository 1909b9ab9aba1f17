use crate::aggregator::ProgressUpdate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunState {
    Running,
    Complete,
    Failed,
}

/// Per-expected-key status line, derived by the annotator from received
/// results and the latest progress update each cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginStatus {
    pub plugin: String,
    pub node: String,
    pub status: RunState,
    #[serde(rename = "result-status")]
    pub result_status: String,
    #[serde(rename = "result-counts")]
    pub result_status_counts: HashMap<String, u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<ProgressUpdate>,
}

/// The serialized annotation payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    pub plugins: Vec<PluginStatus>,
    pub status: String,
    #[serde(rename = "tar-info", skip_serializing_if = "Option::is_none")]
    pub tar_info: Option<serde_json::Value>,
}

/// Pure function: overall status is `failed` if any plugin is failed, else
/// `running` if any is running, else `post-processing`. Transitioning to
/// `complete` is the responsibility of a post-processing stage outside this
/// core and never produced here.
pub fn derive_overall_status(plugins: &[PluginStatus]) -> &'static str {
    if plugins.iter().any(|p| p.status == RunState::Failed) {
        "failed"
    } else if plugins.iter().any(|p| p.status == RunState::Running) {
        "running"
    } else {
        "post-processing"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plugin_with(status: RunState) -> PluginStatus {
        PluginStatus {
            plugin: "p".into(),
            node: "global".into(),
            status,
            result_status: String::new(),
            result_status_counts: HashMap::new(),
            progress: None,
        }
    }

    #[test]
    fn failed_dominates_running_and_complete() {
        let plugins = vec![
            plugin_with(RunState::Complete),
            plugin_with(RunState::Failed),
            plugin_with(RunState::Running),
        ];
        assert_eq!(derive_overall_status(&plugins), "failed");
    }

    #[test]
    fn running_dominates_complete_when_not_failed() {
        let plugins = vec![plugin_with(RunState::Complete), plugin_with(RunState::Running)];
        assert_eq!(derive_overall_status(&plugins), "running");
    }

    #[test]
    fn all_complete_yields_post_processing() {
        let plugins = vec![plugin_with(RunState::Complete), plugin_with(RunState::Complete)];
        assert_eq!(derive_overall_status(&plugins), "post-processing");
    }

    #[test]
    fn exhaustive_multiset_property() {
        let states = [RunState::Running, RunState::Complete, RunState::Failed];
        for a in states {
            for b in states {
                for c in states {
                    let plugins = vec![plugin_with(a), plugin_with(b), plugin_with(c)];
                    let expected = if [a, b, c].contains(&RunState::Failed) {
                        "failed"
                    } else if [a, b, c].contains(&RunState::Running) {
                        "running"
                    } else {
                        "post-processing"
                    };
                    assert_eq!(derive_overall_status(&plugins), expected);
                }
            }
        }
    }
}
