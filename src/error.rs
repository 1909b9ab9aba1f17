use std::io;
use thiserror::Error;

/// Top-level error taxonomy for the aggregation core (spec §7).
#[derive(Error, Debug)]
pub enum AggregatorError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("persistence error: {0}")]
    Persist(#[from] PersistError),

    #[error("supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),

    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("result for {key} is not in the expected set")]
    Forbidden { key: String },

    #[error("result for {key} was already received")]
    Duplicate { key: String },

    #[error("progress update body was not valid JSON: {0}")]
    MalformedProgress(String),

    #[error("plugin timeout while waiting for results of plugin {plugin}")]
    Timeout { plugin: String },

    #[error("fatal startup error: {0}")]
    FatalStartup(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("missing required field: {0}")]
    MissingField(String),
}

#[derive(Error, Debug)]
pub enum PersistError {
    #[error("IO error writing result: {0}")]
    Io(#[from] io::Error),

    #[error("tar extraction failed: {0}")]
    TarExtract(String),
}

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("failed to launch plugin {plugin}: {reason}")]
    LaunchFailed { plugin: String, reason: String },

    #[error("pod query failed for plugin {plugin}: {reason}")]
    QueryFailed { plugin: String, reason: String },

    #[error("cleanup failed for plugin {plugin}: {reason}")]
    CleanupFailed { plugin: String, reason: String },
}

/// The sentinel message a timed-out run stamps into its synthetic error
/// result, so a reader scanning `errors/<node>/error.json` after the fact
/// can tell a deadline-triggered failure apart from a pod-level one.
pub const TIMEOUT_SENTINEL: &str = "plugin timeout while waiting for results";

pub type Result<T> = std::result::Result<T, AggregatorError>;
