use serde::Deserialize;
use std::{fs, path::Path};
use anyhow::{bail, Context, Result};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: Server,
    #[serde(default)]
    pub relay: Relay,
    #[serde(default)]
    pub metrics: Metrics,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Server {
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Suppress routine connection lifecycle logs
    #[serde(default)]
    pub quiet: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Relay {
    #[serde(default = "default_txn_cache")]
    pub txn_cache_capacity: usize,
    #[serde(default = "default_block_cache")]
    pub block_cache_capacity: usize,
    /// Delay per send cycle until the first backlog fully drains
    #[serde(default = "default_throttle_ms")]
    pub initial_throttle_ms: u64,
    #[serde(default = "default_read_buffer")]
    pub read_buffer_bytes: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Metrics {
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_listen() -> String { "0.0.0.0:8336".into() }
fn default_txn_cache() -> usize { 100 }
fn default_block_cache() -> usize { 10 }
fn default_throttle_ms() -> u64 { 20 }           // ~5 Mbps worst case
fn default_read_buffer() -> usize { 64 * 1024 }
fn default_bind() -> String { "0.0.0.0:9100".into() }

impl Default for Server {
    fn default() -> Self {
        Self { listen: default_listen(), quiet: false }
    }
}

impl Default for Relay {
    fn default() -> Self {
        Self {
            txn_cache_capacity: default_txn_cache(),
            block_cache_capacity: default_block_cache(),
            initial_throttle_ms: default_throttle_ms(),
            read_buffer_bytes: default_read_buffer(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self { bind: default_bind() }
    }
}

impl Config {
    fn validate(&self) -> Result<()> {
        if self.relay.txn_cache_capacity == 0 || self.relay.block_cache_capacity == 0 {
            bail!("relay cache capacities must be non-zero");
        }
        if self.relay.read_buffer_bytes == 0 {
            bail!("relay.read_buffer_bytes must be non-zero");
        }
        Ok(())
    }
}

/// Read the TOML file at `p` and deserialize into `Config`.
/// *Adds context* so user errors print a friendlier message.
///
/// # Errors
/// * Returns an anyhow::Error if the file cannot be read, parsed or fails validation.
pub fn load<P: AsRef<Path>>(p: P) -> Result<Config> {
    let text = fs::read_to_string(&p)
        .with_context(|| format!("🗂️  couldn’t read config file {}", p.as_ref().display()))?;
    load_from_str(&text)
}

pub fn load_from_str(text: &str) -> Result<Config> {
    let cfg: Config = toml::from_str(text)
        .with_context(|| "📝  invalid TOML in config file".to_string())?;
    cfg.validate()?;
    Ok(cfg)
}
