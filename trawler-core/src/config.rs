//! Configuration file model for Trawler
//!
//! The file is TOML with `[policy]`, `[crawl]`, `[bridge]` and `[sandbox]`
//! sections. Every field is optional; anything missing takes its default.

use crate::bridge::BridgeConfig;
use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};
use trawler_scanner::{CrawlPolicy, DynamicThresholds};

pub const DEFAULT_CONFIG_PATH: &str = "~/.config/trawler/config.toml";
pub const DEFAULT_WORKER_CONFIG_PATH: &str = "~/.config/trawler/worker.json";
pub const DEFAULT_OUTPUT_DIR: &str = "~/.config/trawler/results";

/// Expands a leading `~` and returns an owned path.
pub fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).as_ref())
}

/// Which scheduler runs each seed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// In-process frontier
    #[default]
    Frontier,
    /// External worker process
    Bridge,
}

impl FromStr for Backend {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "frontier" => Ok(Backend::Frontier),
            "bridge" | "worker" => Ok(Backend::Bridge),
            _ => Err(CoreError::ConfigError(format!(
                "Invalid backend: {}. Use frontier or bridge",
                s
            ))),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Frontier => write!(f, "frontier"),
            Backend::Bridge => write!(f, "bridge"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlSection {
    pub backend: Backend,
    pub workers: usize,
}

impl Default for CrawlSection {
    fn default() -> Self {
        Self {
            backend: Backend::Frontier,
            workers: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeSection {
    pub program: String,
    pub script: Option<String>,
    pub config_path: String,
    pub output_dir: String,
    pub poll_interval_ms: u64,
    pub stop_timeout_ms: u64,
    pub terminate_timeout_ms: u64,
}

impl Default for BridgeSection {
    fn default() -> Self {
        Self {
            program: "python3".to_string(),
            script: None,
            config_path: DEFAULT_WORKER_CONFIG_PATH.to_string(),
            output_dir: DEFAULT_OUTPUT_DIR.to_string(),
            poll_interval_ms: 2_000,
            stop_timeout_ms: 5_000,
            terminate_timeout_ms: 3_000,
        }
    }
}

impl BridgeSection {
    pub fn to_bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            program: self.program.clone(),
            script: self.script.as_deref().map(expand_path),
            config_path: expand_path(&self.config_path),
            output_dir: expand_path(&self.output_dir),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            stop_timeout: Duration::from_millis(self.stop_timeout_ms),
            terminate_timeout: Duration::from_millis(self.terminate_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSection {
    /// Launch a headless browser for classification and dynamic rendering.
    /// Only honoured when built with the `browser` feature.
    pub enabled: bool,
    pub thresholds: DynamicThresholds,
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            enabled: false,
            thresholds: DynamicThresholds::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub policy: CrawlPolicy,
    pub crawl: CrawlSection,
    pub bridge: BridgeSection,
    pub sandbox: SandboxSection,
}

impl AppConfig {
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Loads a config file. A missing file is an error.
    pub fn load(path: &Path) -> Result<Self> {
        debug!("Loading configuration from {}", path.display());
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Loads the given file, or the default location when `path` is `None`.
    /// Only the default location may be absent, in which case defaults apply.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let default_path = expand_path(DEFAULT_CONFIG_PATH);
                if default_path.exists() {
                    Self::load(&default_path)
                } else {
                    debug!("No config file at {}, using defaults", default_path.display());
                    Ok(Self::default())
                }
            }
        }
    }

    /// Writes the default configuration to `path`, creating parent
    /// directories. Refuses to overwrite unless `force` is set.
    pub fn write_default(path: &Path, force: bool) -> Result<()> {
        if path.exists() && !force {
            return Err(CoreError::ConfigError(format!(
                "{} already exists (use --force to overwrite)",
                path.display()
            )));
        }

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, Self::default().to_toml()?)?;
        info!("Wrote default configuration to {}", path.display());
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.crawl.workers == 0 {
            return Err(CoreError::ConfigError(
                "crawl.workers must be at least 1".to_string(),
            ));
        }
        if self.bridge.program.trim().is_empty() {
            return Err(CoreError::ConfigError(
                "bridge.program must not be empty".to_string(),
            ));
        }
        if self.bridge.poll_interval_ms == 0 {
            return Err(CoreError::ConfigError(
                "bridge.poll_interval_ms must be at least 1".to_string(),
            ));
        }
        self.policy.compile()?;
        Ok(())
    }
}
