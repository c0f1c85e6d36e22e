//! Application configuration loaded from environment variables.

use crate::errors::{Result, ServerError};

#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database file
    pub database_url: String,
    /// Port for the REST API server
    pub api_port: u16,
    /// How often (in seconds) the expiry sweep runs
    pub sweep_interval_secs: u64,
    /// Capacity of the lifecycle event channel
    pub event_buffer: usize,
    /// Optional endpoint that receives every committed event as JSON
    pub webhook_url: Option<String>,
    /// Delivery attempts per event before the webhook gives up
    pub webhook_max_attempts: u32,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_source(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Missing keys fall back to defaults.
    pub fn from_source(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Ok(Config {
            database_url: var("DATABASE_URL")
                .unwrap_or_else(|| "sqlite:./foodshare.db".to_string()),
            api_port: parse(&var, "API_PORT", 3001)?,
            sweep_interval_secs: parse(&var, "SWEEP_INTERVAL_SECS", 60)?,
            event_buffer: parse(&var, "EVENT_BUFFER", foodshare_lifecycle::DEFAULT_EVENT_BUFFER)?,
            webhook_url: var("WEBHOOK_URL"),
            webhook_max_attempts: parse(&var, "WEBHOOK_MAX_ATTEMPTS", 5)?,
        })
        .and_then(Config::validated)
    }

    fn validated(self) -> Result<Self> {
        if self.sweep_interval_secs == 0 {
            return Err(ServerError::Config(
                "SWEEP_INTERVAL_SECS must be at least 1".to_string(),
            ));
        }
        if self.event_buffer == 0 {
            return Err(ServerError::Config(
                "EVENT_BUFFER must be at least 1".to_string(),
            ));
        }
        if self.webhook_max_attempts == 0 {
            return Err(ServerError::Config(
                "WEBHOOK_MAX_ATTEMPTS must be at least 1".to_string(),
            ));
        }
        Ok(self)
    }
}

fn parse<T: std::str::FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T> {
    match var(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ServerError::Config(format!("Invalid {key}: {raw}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> Result<Config> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_source(|key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[]).unwrap();
        assert_eq!(config.database_url, "sqlite:./foodshare.db");
        assert_eq!(config.api_port, 3001);
        assert_eq!(config.sweep_interval_secs, 60);
        assert_eq!(config.event_buffer, 256);
        assert_eq!(config.webhook_url, None);
        assert_eq!(config.webhook_max_attempts, 5);
    }

    #[test]
    fn test_overrides() {
        let config = config(&[
            ("API_PORT", "8080"),
            ("SWEEP_INTERVAL_SECS", "5"),
            ("WEBHOOK_URL", "http://localhost:9000/hook"),
        ])
        .unwrap();
        assert_eq!(config.api_port, 8080);
        assert_eq!(config.sweep_interval_secs, 5);
        assert_eq!(
            config.webhook_url.as_deref(),
            Some("http://localhost:9000/hook")
        );
    }

    #[test]
    fn test_blank_values_use_defaults() {
        let config = config(&[("WEBHOOK_URL", "  "), ("API_PORT", "")]).unwrap();
        assert_eq!(config.webhook_url, None);
        assert_eq!(config.api_port, 3001);
    }

    #[test]
    fn test_invalid_values_fail() {
        let err = config(&[("API_PORT", "not-a-port")]).unwrap_err();
        assert!(matches!(err, ServerError::Config(msg) if msg.contains("API_PORT")));

        assert!(config(&[("SWEEP_INTERVAL_SECS", "0")]).is_err());
        assert!(config(&[("EVENT_BUFFER", "-1")]).is_err());
    }
}
