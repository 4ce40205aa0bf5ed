use crate::health::HealthConfig;
use log::{info, warn};
use serde::Deserialize;
use std::{
  collections::HashSet,
  fs, io,
  net::{Ipv4Addr, SocketAddr},
  time::Duration,
};
use thiserror::Error;

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_HEALTH_CHECK_TIMEOUT: u64 = 1;
const DEFAULT_HEALTH_CHECK_PERIOD: u64 = 5;
const DEFAULT_SHUTDOWN_TIMEOUT: u64 = 10;

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("failed to read configuration file {path}: {source}")]
  Read {
    path: String,
    #[source]
    source: io::Error,
  },
  #[error("failed to parse configuration: {0}")]
  Parse(#[from] toml::de::Error),
  #[error("at least one upstream address is required")]
  NoUpstreams,
  #[error("health_check_period must be at least one second")]
  ZeroHealthCheckPeriod,
  #[error("health_check_timeout must be at least one second")]
  ZeroHealthCheckTimeout,
}

/// Contents of the configuration file. Durations are given in whole seconds.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Config {
  #[serde(default = "default_port")]
  pub port: u16,
  #[serde(alias = "backends")]
  pub upstreams: Vec<String>,
  #[serde(
    default = "default_health_check_timeout",
    alias = "healthCheckTimeout",
    alias = "healthCheckTries"
  )]
  pub health_check_timeout: u64,
  #[serde(default = "default_health_check_period", alias = "healthCheckPeriod")]
  pub health_check_period: u64,
  /// how long a shutdown waits for in-flight requests before dropping them
  #[serde(default = "default_shutdown_timeout")]
  pub shutdown_timeout: u64,
}

fn default_port() -> u16 {
  DEFAULT_PORT
}

fn default_health_check_timeout() -> u64 {
  DEFAULT_HEALTH_CHECK_TIMEOUT
}

fn default_health_check_period() -> u64 {
  DEFAULT_HEALTH_CHECK_PERIOD
}

fn default_shutdown_timeout() -> u64 {
  DEFAULT_SHUTDOWN_TIMEOUT
}

impl Config {
  pub fn from_file(toml_path: &str) -> Result<Config, ConfigError> {
    let toml_str = fs::read_to_string(toml_path).map_err(|source| ConfigError::Read {
      path: toml_path.to_string(),
      source,
    })?;
    let config = Config::from_toml(&toml_str)?;
    info!("Successfully parsed configuration {}!", toml_path);
    Ok(config)
  }

  pub fn from_toml(toml_str: &str) -> Result<Config, ConfigError> {
    let config: Config = toml::from_str(toml_str)?;
    config.validate()?;
    config.print_warnings();
    Ok(config)
  }

  /// Address syntax is checked when the upstream pool is built, not here.
  fn validate(&self) -> Result<(), ConfigError> {
    if self.upstreams.is_empty() {
      return Err(ConfigError::NoUpstreams);
    }
    if self.health_check_period == 0 {
      return Err(ConfigError::ZeroHealthCheckPeriod);
    }
    if self.health_check_timeout == 0 {
      return Err(ConfigError::ZeroHealthCheckTimeout);
    }
    Ok(())
  }

  fn print_warnings(&self) {
    let mut seen = HashSet::new();
    for (index, address) in self.upstreams.iter().enumerate() {
      if !seen.insert(address) {
        warn!(
          "upstream {} at index {} is listed more than once and will receive a larger share of requests",
          address, index
        );
      }
    }

    if self.health_check_timeout > self.health_check_period {
      warn!(
        "health_check_timeout ({}s) exceeds health_check_period ({}s), probe passes will run back to back",
        self.health_check_timeout, self.health_check_period
      );
    }
  }

  pub fn health_config(&self) -> HealthConfig {
    HealthConfig {
      period: Duration::from_secs(self.health_check_period),
      timeout: Duration::from_secs(self.health_check_timeout),
    }
  }

  pub fn shutdown_timeout(&self) -> Duration {
    Duration::from_secs(self.shutdown_timeout)
  }

  pub fn listen_address(&self) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.port))
  }
}
