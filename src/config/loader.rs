use crate::error::{ConfigError, Result};
use figment::providers::{Env, Format, Json, Toml, Yaml};
use figment::Figment;
use std::path::Path;

use super::schema::Config;

pub fn load_from_path(path: &Path) -> Result<Config> {
    let config: Config = Figment::new()
        .merge(Toml::file(path))
        .merge(Json::file(path))
        .merge(Yaml::file(path))
        .merge(Env::prefixed("AGGREGATOR_").split("_"))
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    validate(&config)?;
    Ok(config)
}

pub fn load_from_env_or_file() -> Result<Config> {
    let config: Config = Figment::new()
        .merge(Toml::file("aggregator.toml"))
        .merge(Json::file("aggregator.json"))
        .merge(Yaml::file("aggregator.yaml"))
        .merge(Yaml::file("aggregator.yml"))
        .merge(Env::prefixed("AGGREGATOR_").split("_"))
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.plugins.is_empty() {
        return Err(ConfigError::Validation("no plugins configured".into()).into());
    }

    let mut seen = std::collections::HashSet::new();
    for plugin in &config.plugins {
        if plugin.plugin_name.is_empty() {
            return Err(ConfigError::Validation("plugin has empty name".into()).into());
        }
        if !seen.insert(plugin.plugin_name.clone()) {
            return Err(ConfigError::Validation(format!(
                "duplicate plugin name: {}",
                plugin.plugin_name
            ))
            .into());
        }
        if plugin.image.is_empty() {
            return Err(ConfigError::Validation(format!(
                "plugin '{}' has empty image",
                plugin.plugin_name
            ))
            .into());
        }
    }

    if config.bind_port == 0 {
        return Err(ConfigError::Validation("bindPort must be nonzero".into()).into());
    }

    Ok(())
}
