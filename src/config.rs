//! Configuration loading and persistence.
//!
//! Settings come from three layers, later ones winning:
//!
//! 1. Built-in defaults ([`crate::constants`])
//! 2. `config.json` in the config directory
//! 3. `CADENCE_*` environment variables
//!
//! CLI flags are applied on top by `main`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::constants;

/// Configuration for the relay.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Delivery rate in ticks per second.
    pub tick_hz: u32,
    /// Relay buffer capacity in samples.
    pub buffer_capacity: usize,
    /// Lines whose trimmed text starts with this are device diagnostics.
    pub diagnostic_prefix: String,
    /// Longest unterminated line carried by the decoder.
    pub max_line_len: usize,
    /// WebSocket listen address for consumers.
    pub listen_addr: String,
    /// Device byte source (`tcp://host:port`, `host:port` or `-` for stdin).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Send nothing on underrun ticks instead of `null`.
    pub skip_underruns: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tick_hz: constants::DEFAULT_TICK_HZ,
            buffer_capacity: constants::DEFAULT_BUFFER_CAPACITY,
            diagnostic_prefix: constants::DEFAULT_DIAGNOSTIC_PREFIX.to_string(),
            max_line_len: constants::DEFAULT_MAX_LINE_LEN,
            listen_addr: constants::DEFAULT_LISTEN_ADDR.to_string(),
            source: None,
            skip_underruns: false,
        }
    }
}

impl Config {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// `CADENCE_CONFIG_DIR` overrides the platform config dir
    /// (e.g. `~/.config/cadence-relay`).
    pub fn config_dir() -> Result<PathBuf> {
        let dir = if let Ok(dir) = std::env::var("CADENCE_CONFIG_DIR") {
            PathBuf::from(dir)
        } else {
            dirs::config_dir()
                .context("Could not determine config directory")?
                .join("cadence-relay")
        };
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config dir {}", dir.display()))?;
        Ok(dir)
    }

    /// Loads configuration from file, with environment variable overrides.
    ///
    /// A missing file falls back to defaults; a malformed one is an error.
    pub fn load() -> Result<Self> {
        let path = Self::config_dir()?.join("config.json");
        let mut config = Self::load_from(&path)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load `path`, or defaults if it does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// Apply `CADENCE_*` overrides using `lookup` to read variables.
    ///
    /// Unparseable numeric values are ignored with a warning.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(hz) = lookup("CADENCE_TICK_HZ") {
            match hz.parse::<u32>() {
                Ok(hz) => self.tick_hz = hz,
                Err(_) => log::warn!("Ignoring CADENCE_TICK_HZ={hz:?}"),
            }
        }

        if let Some(capacity) = lookup("CADENCE_BUFFER_CAPACITY") {
            match capacity.parse::<usize>() {
                Ok(capacity) => self.buffer_capacity = capacity,
                Err(_) => log::warn!("Ignoring CADENCE_BUFFER_CAPACITY={capacity:?}"),
            }
        }

        if let Some(prefix) = lookup("CADENCE_DIAGNOSTIC_PREFIX") {
            self.diagnostic_prefix = prefix;
        }

        if let Some(addr) = lookup("CADENCE_LISTEN_ADDR") {
            self.listen_addr = addr;
        }

        if let Some(source) = lookup("CADENCE_SOURCE") {
            self.source = Some(source);
        }

        if let Some(skip) = lookup("CADENCE_SKIP_UNDERRUNS") {
            self.skip_underruns = matches!(skip.as_str(), "1" | "true" | "yes");
        }
    }

    /// Reject settings the relay cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.tick_hz == 0 {
            bail!("tick_hz must be > 0");
        }
        if self.tick_hz > 1_000_000_000 {
            bail!("tick_hz {} is faster than 1 ns per tick", self.tick_hz);
        }
        if self.buffer_capacity == 0 {
            bail!("buffer_capacity must be > 0");
        }
        if self.diagnostic_prefix.is_empty() {
            bail!("diagnostic_prefix must not be empty");
        }
        if self.max_line_len == 0 {
            bail!("max_line_len must be > 0");
        }
        Ok(())
    }

    /// Fixed tick interval derived from `tick_hz`.
    ///
    /// # Panics
    ///
    /// Panics if `tick_hz` is zero; call [`Config::validate`] first.
    pub fn tick_interval(&self) -> Duration {
        constants::tick_interval(self.tick_hz)
    }

    /// Persists the current configuration to `config.json`.
    pub fn save(&self) -> Result<PathBuf> {
        let path = Self::config_dir()?.join("config.json");
        fs::write(&path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(path)
    }
}
