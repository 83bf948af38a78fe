//! Typed TOML configuration with env-var expansion, startup validation and
//! hot reload. Invalid configuration is rejected at load; an invalid reload
//! is discarded and the previous configuration stays in effect.

pub mod manager;

pub use manager::ConfigManager;

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{ShoalError, ShoalResult};
use crate::model::RegistrationInput;

const VALID_STRATEGIES: &[&str] = &["round_robin", "weight_round_robin", "least_conn", "ip_hash"];
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];
const VALID_LOG_FORMATS: &[&str] = &["json", "text"];

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub load_balancer: StrategyConfig,
    #[serde(default)]
    pub backends: Vec<BackendSeed>,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    pub routing: RoutingFileConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub port: u16,
    #[serde(default = "default_check_interval")]
    pub health_check_interval: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StrategyConfig {
    pub strategy: String,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            strategy: "round_robin".to_string(),
        }
    }
}

/// A statically configured backend, registered at startup
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendSeed {
    pub service_name: String,
    #[serde(default)]
    pub instance_id: Option<String>,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub weight: Option<i64>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// External cache connection surface
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub addr: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub db: u32,
    #[serde(default)]
    pub pool_size: u32,
    #[serde(default = "default_cache_timeout")]
    pub timeout: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RoutingFileConfig {
    pub file: String,
}

fn default_check_interval() -> String {
    "10s".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_cache_timeout() -> String {
    "2s".to_string()
}

impl Config {
    /// Load from a TOML file with `${VAR}` environment expansion.
    pub async fn from_file<P: AsRef<Path>>(path: P) -> ShoalResult<Self> {
        let content = tokio::fs::read_to_string(path.as_ref()).await?;
        let config = Self::from_str(&content)?;
        info!(path = %path.as_ref().display(), "Configuration loaded");
        Ok(config)
    }

    pub fn from_str(content: &str) -> ShoalResult<Self> {
        let expanded = expand_env_vars(content);
        let config: Config = toml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ShoalResult<()> {
        if self.server.port == 0 {
            return Err(ShoalError::config("server port must be positive"));
        }

        if !VALID_STRATEGIES.contains(&self.load_balancer.strategy.as_str()) {
            return Err(ShoalError::config(format!(
                "invalid load balancing strategy: {}",
                self.load_balancer.strategy
            )));
        }

        humantime::parse_duration(&self.server.health_check_interval).map_err(|e| {
            ShoalError::config(format!(
                "invalid health_check_interval '{}': {}",
                self.server.health_check_interval, e
            ))
        })?;

        if !VALID_LOG_LEVELS.contains(&self.log.level.as_str()) {
            return Err(ShoalError::config(format!(
                "invalid log level: {}",
                self.log.level
            )));
        }
        if !VALID_LOG_FORMATS.contains(&self.log.format.as_str()) {
            return Err(ShoalError::config(format!(
                "invalid log format: {}",
                self.log.format
            )));
        }

        humantime::parse_duration(&self.cache.timeout).map_err(|e| {
            ShoalError::config(format!(
                "invalid cache timeout '{}': {}",
                self.cache.timeout, e
            ))
        })?;

        if self.routing.file.is_empty() {
            return Err(ShoalError::config("routing rules file is required"));
        }

        if self.backends.is_empty() {
            warn!("No backend servers configured");
        }
        for (i, backend) in self.backends.iter().enumerate() {
            if backend.service_name.is_empty() {
                return Err(ShoalError::config(format!(
                    "backend #{}: service_name is empty",
                    i + 1
                )));
            }
            if backend.host.is_empty() {
                return Err(ShoalError::config(format!(
                    "backend #{}: host is empty",
                    i + 1
                )));
            }
            if backend.port == 0 {
                return Err(ShoalError::config(format!(
                    "backend #{}: port must be positive",
                    i + 1
                )));
            }
        }

        if self.cache.addr.is_empty() {
            warn!("No cache address configured, using the in-process session store");
        }

        Ok(())
    }

    pub fn health_check_interval(&self) -> Duration {
        humantime::parse_duration(&self.server.health_check_interval)
            .unwrap_or(Duration::from_secs(10))
    }

    pub fn cache_timeout(&self) -> Duration {
        humantime::parse_duration(&self.cache.timeout).unwrap_or(Duration::from_secs(2))
    }

    /// Turn the configured backends into registration records, deriving an
    /// instance id from the service name and position when none is given.
    pub fn registration_inputs(&self) -> Vec<RegistrationInput> {
        self.backends
            .iter()
            .enumerate()
            .map(|(i, seed)| RegistrationInput {
                service_name: seed.service_name.clone(),
                instance_id: seed
                    .instance_id
                    .clone()
                    .unwrap_or_else(|| format!("{}-{}", seed.service_name, i + 1)),
                host: seed.host.clone(),
                port: seed.port,
                weight: seed.weight,
                metadata: seed.metadata.clone(),
            })
            .collect()
    }
}

/// Replace `${VAR}` with the value of the environment variable `VAR`;
/// unknown variables are left untouched.
fn expand_env_vars(content: &str) -> String {
    let mut result = String::with_capacity(content.len());
    let mut rest = content;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];

        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                match std::env::var(name) {
                    Ok(value) => result.push_str(&value),
                    Err(_) => {
                        result.push_str("${");
                        result.push_str(name);
                        result.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                result.push_str("${");
                rest = after;
            }
        }
    }

    result.push_str(rest);
    result
}
