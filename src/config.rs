//! Configuration loaded from `.treq/treq.toml`.
//!
//! Layering is file → environment → CLI. The project file wins over the
//! user-level `~/.treq/treq.toml`; missing files fall back to defaults.
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 4097
//! dev_mode = false
//!
//! [flows]
//! finished_ttl_secs = 300
//! idle_ttl_secs = 1800
//! sweep_interval_secs = 30
//!
//! [events]
//! heartbeat_secs = 15
//! subscriber_buffer = 256
//! replay_window = 256
//!
//! [runners.preferred]
//! ts = "bun"
//! py = "python"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::flow::{FlowManagerConfig, RetentionPolicy};
use crate::runner::RunnerDetector;
use crate::server::ServerConfig;

pub const CONFIG_DIR: &str = ".treq";
pub const CONFIG_FILE: &str = "treq.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
    pub dev_mode: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4097,
            dev_mode: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowsSection {
    /// Seconds a finished flow stays queryable.
    pub finished_ttl_secs: u64,
    /// Seconds of inactivity before an unobserved flow is evicted.
    pub idle_ttl_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for FlowsSection {
    fn default() -> Self {
        Self {
            finished_ttl_secs: 300,
            idle_ttl_secs: 1800,
            sweep_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsSection {
    pub heartbeat_secs: u64,
    pub subscriber_buffer: usize,
    /// Envelopes kept per flow so a reconnecting stream can resume.
    pub replay_window: usize,
}

impl Default for EventsSection {
    fn default() -> Self {
        Self {
            heartbeat_secs: 15,
            subscriber_buffer: 256,
            replay_window: 256,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnersSection {
    /// File extension (without the dot) to runner id.
    pub preferred: HashMap<String, String>,
}

/// Parsed `treq.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TreqToml {
    pub server: ServerSection,
    pub flows: FlowsSection,
    pub events: EventsSection,
    pub runners: RunnersSection,
}

impl TreqToml {
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse treq.toml")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Project config, else user config, else defaults.
    pub fn discover(project_dir: &Path) -> Result<(Self, Option<PathBuf>)> {
        let candidates = [
            Some(project_dir.join(CONFIG_DIR).join(CONFIG_FILE)),
            user_config_path(),
        ];
        for path in candidates.into_iter().flatten() {
            if path.exists() {
                return Ok((Self::load(&path)?, Some(path)));
            }
        }
        Ok((Self::default(), None))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize treq.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `TREQ_HOST` and `TREQ_PORT`.
    pub fn apply_env(&mut self) -> Vec<String> {
        let mut warnings = Vec::new();
        if let Ok(host) = std::env::var("TREQ_HOST")
            && !host.is_empty()
        {
            self.server.host = host;
        }
        if let Ok(port) = std::env::var("TREQ_PORT") {
            match port.parse() {
                Ok(port) => self.server.port = port,
                Err(_) => warnings.push(format!("Ignoring invalid TREQ_PORT '{}'", port)),
            }
        }
        warnings
    }

    /// Settings that parse but will not behave as intended.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.server.host.trim().is_empty() {
            warnings.push("server.host is empty".to_string());
        }
        if self.flows.sweep_interval_secs == 0 {
            warnings.push("flows.sweep_interval_secs must be positive; using 1".to_string());
        }
        if self.flows.finished_ttl_secs == 0 {
            warnings.push(
                "flows.finished_ttl_secs is 0: finished flows are evicted on the next sweep"
                    .to_string(),
            );
        }
        if self.events.heartbeat_secs == 0 {
            warnings.push("events.heartbeat_secs must be positive; using 1".to_string());
        }
        if self.events.subscriber_buffer == 0 {
            warnings.push("events.subscriber_buffer must be positive; using 1".to_string());
        }
        for (ext, runner) in &self.runners.preferred {
            if ext.starts_with('.') {
                warnings.push(format!(
                    "runners.preferred key '{}' should not start with a dot",
                    ext
                ));
            }
            if runner.trim().is_empty() {
                warnings.push(format!("runners.preferred.{} is empty", ext));
            }
        }

        warnings
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            host: self.server.host.clone(),
            port: self.server.port,
            dev_mode: self.server.dev_mode,
            heartbeat: Duration::from_secs(self.events.heartbeat_secs.max(1)),
            sweep_interval: Duration::from_secs(self.flows.sweep_interval_secs.max(1)),
            flows: FlowManagerConfig {
                retention: RetentionPolicy {
                    finished_ttl: Duration::from_secs(self.flows.finished_ttl_secs),
                    idle_ttl: Duration::from_secs(self.flows.idle_ttl_secs),
                },
                subscriber_buffer: self.events.subscriber_buffer.max(1),
                replay_window: self.events.replay_window,
            },
        }
    }

    pub fn runner_detector(&self) -> RunnerDetector {
        let preferred = self
            .runners
            .preferred
            .iter()
            .map(|(ext, id)| (ext.trim_start_matches('.').to_string(), id.clone()))
            .collect();
        RunnerDetector::new(preferred)
    }
}

/// `~/.treq/treq.toml`, when a home directory is known.
pub fn user_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(CONFIG_DIR).join(CONFIG_FILE))
}

pub fn project_config_path(project_dir: &Path) -> PathBuf {
    project_dir.join(CONFIG_DIR).join(CONFIG_FILE)
}
