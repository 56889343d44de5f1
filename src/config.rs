//! Configuration of the `tcplb` binary
//!
//! Loaded from a YAML file named by the first command line argument or the
//! `TCPLB_CONFIG` environment variable. `LISTEN` overrides the listen
//! address.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use crate::check::HealthCheckConfig;

const CONFIG_ENV: &str = "TCPLB_CONFIG";
const LISTEN_ENV: &str = "LISTEN";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Address the proxy accepts on
    pub listen: SocketAddr,

    /// Number of worker event loops
    pub workers: usize,

    /// Bytes buffered from each client
    pub in_buffer_size: usize,

    /// Bytes buffered from each backend
    pub out_buffer_size: usize,

    pub backends: Vec<BackendConfig>,

    pub health_check: HealthCheckSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendConfig {
    /// Optional backend name for logging
    #[serde(default)]
    pub name: Option<String>,

    /// Backend address
    pub address: SocketAddr,

    /// Source ip for connections to this backend
    #[serde(default)]
    pub local: Option<IpAddr>,
}

impl BackendConfig {
    /// Get a display name for the backend (name or address)
    pub fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.address.to_string())
    }

    pub fn local_ip(&self) -> IpAddr {
        self.local.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HealthCheckSettings {
    pub timeout_ms: u64,
    pub period_ms: u64,
    pub up: u32,
    pub down: u32,
}

impl Default for HealthCheckSettings {
    fn default() -> Self {
        let defaults = HealthCheckConfig::default();
        Self {
            timeout_ms: defaults.timeout.as_millis() as u64,
            period_ms: defaults.period.as_millis() as u64,
            up: defaults.up,
            down: defaults.down,
        }
    }
}

impl From<HealthCheckSettings> for HealthCheckConfig {
    fn from(settings: HealthCheckSettings) -> Self {
        Self {
            timeout: Duration::from_millis(settings.timeout_ms),
            period: Duration::from_millis(settings.period_ms),
            up: settings.up,
            down: settings.down,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8080)),
            workers: 2,
            in_buffer_size: 16384,
            out_buffer_size: 16384,
            backends: Vec::new(),
            health_check: HealthCheckSettings::default(),
        }
    }
}

impl Config {
    /// Load the configuration the binary runs with.
    pub fn load() -> Result<Self> {
        Self::load_from(std::env::args_os().nth(1).map(PathBuf::from))
    }

    /// Load from `path`, falling back to `TCPLB_CONFIG` and then to the
    /// defaults, and apply the environment overrides.
    pub fn load_from(path: Option<PathBuf>) -> Result<Self> {
        let path = path.or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from));
        let mut config = match path {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_yaml(&content).with_context(|| format!("invalid config file {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config = serde_yaml::from_str(content).context("failed to parse yaml")?;
        Ok(config)
    }

    /// Apply the `LISTEN` override.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(listen) = std::env::var(LISTEN_ENV) {
            self.listen = listen
                .parse()
                .with_context(|| format!("invalid {LISTEN_ENV} address {listen:?}"))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            bail!("workers must be at least 1");
        }
        if self.in_buffer_size == 0 || self.out_buffer_size == 0 {
            bail!("buffer sizes must be greater than 0");
        }
        if self.backends.is_empty() {
            bail!("no backends configured");
        }
        let hc = &self.health_check;
        if hc.timeout_ms == 0 || hc.period_ms == 0 {
            bail!("health check timeout and period must be greater than 0");
        }
        if hc.up == 0 || hc.down == 0 {
            bail!("health check up/down thresholds must be at least 1");
        }
        Ok(())
    }
}
