use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Top-level run configuration (spec §6).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_bind_port")]
    pub bind_port: u16,
    /// Address (optionally host:port) plugins are told to reach the aggregator on.
    /// A trailing port is stripped before it is used as a certificate SAN.
    pub advertise_address: String,

    /// Overall run deadline; 0 disables the timeout.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_graceful_shutdown_seconds")]
    pub graceful_shutdown_seconds: u64,

    pub output_dir: std::path::PathBuf,
    #[serde(default = "default_namespace")]
    pub namespace: String,

    #[serde(default = "default_progress_port")]
    pub progress_port: u16,
    #[serde(default = "default_plugin_results_dir")]
    pub plugin_results_dir: String,

    #[serde(default)]
    pub aggregator_pod_name: Option<String>,
    #[serde(default = "default_status_annotation_name")]
    pub status_annotation_name: String,

    #[serde(default = "default_retry_window_seconds")]
    pub retry_window_seconds: u64,

    pub plugins: Vec<PluginDefinition>,
}

impl Config {
    pub fn timeout(&self) -> Option<Duration> {
        if self.timeout_seconds == 0 {
            None
        } else {
            Some(Duration::from_secs(self.timeout_seconds))
        }
    }

    pub fn graceful_shutdown_period(&self) -> Duration {
        Duration::from_secs(self.graceful_shutdown_seconds)
    }

    pub fn retry_window(&self) -> Duration {
        Duration::from_secs(self.retry_window_seconds)
    }

    /// The advertised address with any port stripped, suitable as a certificate SAN.
    pub fn advertise_host(&self) -> &str {
        self.advertise_address
            .rsplit_once(':')
            .map(|(host, _port)| host)
            .unwrap_or(&self.advertise_address)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Driver {
    Job,
    DaemonSet,
}

/// Per-plugin configuration (spec §6, §9).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginDefinition {
    pub plugin_name: String,
    pub driver: Driver,
    pub image: String,
    #[serde(default = "default_image_pull_policy")]
    pub image_pull_policy: String,
    #[serde(default)]
    pub image_pull_secrets: Vec<String>,
    #[serde(default)]
    pub service_account_name: Option<String>,
    #[serde(default)]
    pub skip_cleanup: bool,
    #[serde(default)]
    pub extra_volumes: Vec<serde_json::Value>,
    #[serde(default)]
    pub pod_spec_overrides: Option<serde_json::Value>,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
    /// Per-plugin deadline; falls back to the run's overall timeout when unset.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

impl PluginDefinition {
    pub fn effective_timeout(&self, overall: Option<Duration>) -> Option<Duration> {
        self.timeout_seconds
            .map(Duration::from_secs)
            .or(overall)
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_bind_port() -> u16 {
    8443
}

fn default_timeout_seconds() -> u64 {
    10800
}

fn default_graceful_shutdown_seconds() -> u64 {
    60
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_progress_port() -> u16 {
    8099
}

fn default_plugin_results_dir() -> String {
    "/tmp/results".to_string()
}

fn default_status_annotation_name() -> String {
    "sonobuoy.hept.io/status".to_string()
}

fn default_retry_window_seconds() -> u64 {
    120
}

fn default_image_pull_policy() -> String {
    "IfNotPresent".to_string()
}
