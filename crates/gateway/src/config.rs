//! Environment configuration.
//!
//! Every value has a default; `.env` is loaded by `main` before this runs.

use crate::error::{GatewayError, Result};
use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Redis,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerBackend {
    Nats,
    Memory,
}

impl FromStr for StorageBackend {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "redis" => Ok(StorageBackend::Redis),
            "memory" => Ok(StorageBackend::Memory),
            other => Err(GatewayError::Config(format!(
                "STORAGE_BACKEND must be 'redis' or 'memory', got '{}'",
                other
            ))),
        }
    }
}

impl FromStr for BrokerBackend {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "nats" => Ok(BrokerBackend::Nats),
            "memory" => Ok(BrokerBackend::Memory),
            other => Err(GatewayError::Config(format!(
                "BROKER_BACKEND must be 'nats' or 'memory', got '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub http_port: u16,
    pub metrics_port: u16,
    pub redis_url: String,
    pub nats_url: String,
    pub storage: StorageBackend,
    pub broker: BrokerBackend,
    /// Topic carrying canvas pixel updates.
    pub canvas_topic: String,
    /// Duel session `N` publishes on `{duel_topic_prefix}.N`.
    pub duel_topic_prefix: String,
    pub canvas_width: u32,
    pub canvas_height: u32,
    pub canvas_cache_ttl: Duration,
    pub matchmaking_ttl: Duration,
    pub send_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            http_port: 8000,
            metrics_port: 9090,
            redis_url: "redis://localhost:6379".to_string(),
            nats_url: "nats://localhost:4222".to_string(),
            storage: StorageBackend::Redis,
            broker: BrokerBackend::Nats,
            canvas_topic: "pixel_updates".to_string(),
            duel_topic_prefix: "duel.session".to_string(),
            canvas_width: 1000,
            canvas_height: 1000,
            canvas_cache_ttl: Duration::from_secs(300),
            matchmaking_ttl: Duration::from_secs(300),
            send_timeout: Duration::from_millis(2000),
        }
    }
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; missing keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(v) = lookup("HTTP_PORT") {
            config.http_port = parse("HTTP_PORT", &v)?;
        }
        if let Some(v) = lookup("METRICS_PORT") {
            config.metrics_port = parse("METRICS_PORT", &v)?;
        }
        if let Some(v) = lookup("REDIS_URL") {
            config.redis_url = v;
        }
        if let Some(v) = lookup("NATS_URL") {
            config.nats_url = v;
        }
        if let Some(v) = lookup("STORAGE_BACKEND") {
            config.storage = v.parse()?;
        }
        if let Some(v) = lookup("BROKER_BACKEND") {
            config.broker = v.parse()?;
        }
        if let Some(v) = lookup("CANVAS_TOPIC") {
            config.canvas_topic = v;
        }
        if let Some(v) = lookup("DUEL_TOPIC_PREFIX") {
            config.duel_topic_prefix = v;
        }
        if let Some(v) = lookup("CANVAS_WIDTH") {
            config.canvas_width = parse("CANVAS_WIDTH", &v)?;
        }
        if let Some(v) = lookup("CANVAS_HEIGHT") {
            config.canvas_height = parse("CANVAS_HEIGHT", &v)?;
        }
        if let Some(v) = lookup("CANVAS_CACHE_TTL_SECS") {
            config.canvas_cache_ttl = Duration::from_secs(parse("CANVAS_CACHE_TTL_SECS", &v)?);
        }
        if let Some(v) = lookup("MATCHMAKING_TTL_SECS") {
            config.matchmaking_ttl = Duration::from_secs(parse("MATCHMAKING_TTL_SECS", &v)?);
        }
        if let Some(v) = lookup("SEND_TIMEOUT_MS") {
            config.send_timeout = Duration::from_millis(parse("SEND_TIMEOUT_MS", &v)?);
        }

        if config.canvas_width == 0 || config.canvas_height == 0 {
            return Err(GatewayError::Config(
                "CANVAS_WIDTH and CANVAS_HEIGHT must be positive".to_string(),
            ));
        }
        Ok(config)
    }

    pub fn log_summary(&self) {
        info!("Configuration:");
        info!("  HTTP_PORT: {}", self.http_port);
        info!("  METRICS_PORT: {}", self.metrics_port);
        info!("  STORAGE_BACKEND: {:?} ({})", self.storage, self.redis_url);
        info!("  BROKER_BACKEND: {:?} ({})", self.broker, self.nats_url);
        info!("  CANVAS_TOPIC: {}", self.canvas_topic);
        info!("  DUEL_TOPIC_PREFIX: {}", self.duel_topic_prefix);
        info!("  CANVAS: {}x{}", self.canvas_width, self.canvas_height);
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| GatewayError::Config(format!("{} must be a number, got '{}'", key, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.http_port, 8000);
        assert_eq!(config.canvas_topic, "pixel_updates");
        assert_eq!(config.storage, StorageBackend::Redis);
        assert_eq!(config.broker, BrokerBackend::Nats);
        assert_eq!(config.canvas_cache_ttl, Duration::from_secs(300));
        assert_eq!(config.matchmaking_ttl, Duration::from_secs(300));
    }

    #[test]
    fn test_overrides() {
        let config = GatewayConfig::from_lookup(lookup(&[
            ("HTTP_PORT", "9000"),
            ("STORAGE_BACKEND", "Memory"),
            ("BROKER_BACKEND", "memory"),
            ("CANVAS_WIDTH", "64"),
            ("SEND_TIMEOUT_MS", "250"),
        ]))
        .unwrap();
        assert_eq!(config.http_port, 9000);
        assert_eq!(config.storage, StorageBackend::Memory);
        assert_eq!(config.broker, BrokerBackend::Memory);
        assert_eq!(config.canvas_width, 64);
        assert_eq!(config.send_timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(GatewayConfig::from_lookup(lookup(&[("HTTP_PORT", "http")])).is_err());
        assert!(GatewayConfig::from_lookup(lookup(&[("BROKER_BACKEND", "kafka")])).is_err());
        assert!(GatewayConfig::from_lookup(lookup(&[("CANVAS_HEIGHT", "0")])).is_err());
    }
}
