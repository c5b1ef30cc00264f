//! TOML configuration parsing and validation.
//!
//! ```toml
//! [db]
//! path = "./data/exg.sqlite"
//!
//! [fallback]
//! confidence_threshold = 0.8
//! max_in_flight = 3
//!
//! [fallback.cache]
//! ttl_secs = 3600
//!
//! [completion]
//! provider = "openai"
//! model = "gpt-4o-mini"
//!
//! [server]
//! bind = "127.0.0.1:7440"
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use extraction_guard_core::consistency::DEFAULT_TOLERANCE;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub fallback: FallbackConfig,
    #[serde(default)]
    pub completion: CompletionConfig,
    #[serde(default)]
    pub consistency: ConsistencyConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FallbackConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_excerpt_chars")]
    pub excerpt_chars: usize,
    #[serde(default)]
    pub cache: CacheConfig,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            confidence_threshold: default_confidence_threshold(),
            max_in_flight: default_max_in_flight(),
            max_attempts: default_max_attempts(),
            call_timeout_secs: default_call_timeout_secs(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            excerpt_chars: default_excerpt_chars(),
            cache: CacheConfig::default(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_confidence_threshold() -> f64 {
    0.8
}
fn default_max_in_flight() -> usize {
    3
}
fn default_max_attempts() -> u32 {
    3
}
fn default_call_timeout_secs() -> u64 {
    30
}
fn default_backoff_base_ms() -> u64 {
    500
}
fn default_backoff_max_ms() -> u64 {
    8_000
}
fn default_excerpt_chars() -> usize {
    1_200
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            capacity: default_capacity(),
        }
    }
}

fn default_ttl_secs() -> u64 {
    3_600
}
fn default_capacity() -> usize {
    512
}

#[derive(Debug, Deserialize, Clone)]
pub struct CompletionConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            url: None,
            api_key_env: default_api_key_env(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

impl CompletionConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ConsistencyConfig {
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
}

impl Default for ConsistencyConfig {
    fn default() -> Self {
        Self {
            tolerance: default_tolerance(),
        }
    }
}

fn default_tolerance() -> f64 {
    DEFAULT_TOLERANCE
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

impl FallbackConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

/// Reject settings the orchestrator or checker cannot run with.
pub fn validate(config: &Config) -> Result<()> {
    let fallback = &config.fallback;

    if !(0.0..=1.0).contains(&fallback.confidence_threshold) {
        anyhow::bail!("fallback.confidence_threshold must be in [0.0, 1.0]");
    }
    if fallback.max_in_flight == 0 {
        anyhow::bail!("fallback.max_in_flight must be >= 1");
    }
    if fallback.max_attempts == 0 {
        anyhow::bail!("fallback.max_attempts must be >= 1");
    }
    if fallback.call_timeout_secs == 0 {
        anyhow::bail!("fallback.call_timeout_secs must be > 0");
    }
    if fallback.backoff_max_ms < fallback.backoff_base_ms {
        anyhow::bail!("fallback.backoff_max_ms must be >= fallback.backoff_base_ms");
    }
    if fallback.cache.capacity == 0 {
        anyhow::bail!("fallback.cache.capacity must be >= 1");
    }

    if !(config.consistency.tolerance >= 0.0 && config.consistency.tolerance.is_finite()) {
        anyhow::bail!("consistency.tolerance must be a finite value >= 0");
    }

    match config.completion.provider.as_str() {
        "disabled" => {}
        "openai" => {
            if config.completion.model.is_none() {
                anyhow::bail!("completion.model must be specified when provider is 'openai'");
            }
        }
        other => anyhow::bail!(
            "Unknown completion provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    Ok(())
}
