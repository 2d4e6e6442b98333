use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use axum::http::HeaderValue;
use taskrelay_core::channels::{validate_prefix, DEFAULT_CHANNEL_PREFIX};
use taskrelay_events::RegistryConfig;
use taskrelay_worker::WorkerConfig;

use crate::ws::SessionConfig;

/// A configuration value could not be used.
#[derive(Debug, thiserror::Error)]
#[error("Invalid {key}={value:?}: {reason}")]
pub struct ConfigError {
    pub key: &'static str,
    pub value: String,
    pub reason: String,
}

/// Server configuration loaded from environment variables.
///
/// All fields have defaults suitable for local development.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Allowed CORS origins, parsed from comma-separated `CORS_ORIGINS`.
    pub cors_origins: Vec<String>,
    pub request_timeout_secs: u64,
    /// Upper bound on post-signal cleanup.
    pub shutdown_timeout_secs: u64,
    /// Prefix of every task channel name.
    pub channel_prefix: String,
    /// Capacity of each session's outbound queue.
    pub session_buffer: usize,
    /// Consecutive dropped events before a slow session is closed.
    pub max_session_drops: u32,
    pub upstream_queue_capacity: usize,
    pub broker_timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub worker_concurrency: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8000,
            cors_origins: vec!["http://localhost:3000".into()],
            request_timeout_secs: 30,
            shutdown_timeout_secs: 10,
            channel_prefix: DEFAULT_CHANNEL_PREFIX.into(),
            session_buffer: 256,
            max_session_drops: 64,
            upstream_queue_capacity: 128,
            broker_timeout_secs: 5,
            heartbeat_interval_secs: 30,
            worker_concurrency: 4,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                   | Default                  |
    /// |---------------------------|--------------------------|
    /// | `HOST`                    | `0.0.0.0`                |
    /// | `PORT`                    | `8000`                   |
    /// | `CORS_ORIGINS`            | `http://localhost:3000`  |
    /// | `REQUEST_TIMEOUT_SECS`    | `30`                     |
    /// | `SHUTDOWN_TIMEOUT_SECS`   | `10`                     |
    /// | `CHANNEL_PREFIX`          | `product_analysis`       |
    /// | `SESSION_BUFFER`          | `256`                    |
    /// | `MAX_SESSION_DROPS`       | `64`                     |
    /// | `UPSTREAM_QUEUE_CAPACITY` | `128`                    |
    /// | `BROKER_TIMEOUT_SECS`     | `5`                      |
    /// | `HEARTBEAT_INTERVAL_SECS` | `30`                     |
    /// | `WORKER_CONCURRENCY`      | `4`                      |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an explicit variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let host = lookup("HOST").unwrap_or(defaults.host);
        let port = parse_var(&lookup, "PORT", defaults.port)?;

        let cors_origins: Vec<String> = match lookup("CORS_ORIGINS") {
            Some(raw) => raw
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            None => defaults.cors_origins,
        };
        for origin in &cors_origins {
            if let Err(e) = HeaderValue::from_str(origin) {
                return Err(ConfigError {
                    key: "CORS_ORIGINS",
                    value: origin.clone(),
                    reason: e.to_string(),
                });
            }
        }

        let channel_prefix = lookup("CHANNEL_PREFIX").unwrap_or(defaults.channel_prefix);
        if let Err(e) = validate_prefix(&channel_prefix) {
            return Err(ConfigError {
                key: "CHANNEL_PREFIX",
                value: channel_prefix,
                reason: e.to_string(),
            });
        }

        let session_buffer = parse_var(&lookup, "SESSION_BUFFER", defaults.session_buffer)?;
        // One slot is taken by the subscribe acknowledgment.
        if session_buffer < 2 {
            return Err(ConfigError {
                key: "SESSION_BUFFER",
                value: session_buffer.to_string(),
                reason: "must be at least 2".into(),
            });
        }

        Ok(Self {
            host,
            port,
            cors_origins,
            request_timeout_secs: parse_var(
                &lookup,
                "REQUEST_TIMEOUT_SECS",
                defaults.request_timeout_secs,
            )?,
            shutdown_timeout_secs: parse_var(
                &lookup,
                "SHUTDOWN_TIMEOUT_SECS",
                defaults.shutdown_timeout_secs,
            )?,
            channel_prefix,
            session_buffer,
            max_session_drops: parse_positive(
                &lookup,
                "MAX_SESSION_DROPS",
                defaults.max_session_drops,
            )?,
            upstream_queue_capacity: parse_positive(
                &lookup,
                "UPSTREAM_QUEUE_CAPACITY",
                defaults.upstream_queue_capacity,
            )?,
            broker_timeout_secs: parse_positive(
                &lookup,
                "BROKER_TIMEOUT_SECS",
                defaults.broker_timeout_secs,
            )?,
            heartbeat_interval_secs: parse_positive(
                &lookup,
                "HEARTBEAT_INTERVAL_SECS",
                defaults.heartbeat_interval_secs,
            )?,
            worker_concurrency: parse_positive(
                &lookup,
                "WORKER_CONCURRENCY",
                defaults.worker_concurrency,
            )?,
        })
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            upstream_queue_capacity: self.upstream_queue_capacity,
            max_consecutive_drops: self.max_session_drops,
            broker_timeout: Duration::from_secs(self.broker_timeout_secs),
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            channel_prefix: self.channel_prefix.clone(),
            buffer: self.session_buffer,
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs),
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            concurrency: self.worker_concurrency,
            channel_prefix: self.channel_prefix.clone(),
            ..WorkerConfig::default()
        }
    }
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError {
            key,
            value: raw,
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn parse_positive<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Default + Display,
    T::Err: Display,
{
    let value = parse_var(lookup, key, default)?;
    if value <= T::default() {
        return Err(ConfigError {
            key,
            value: value.to_string(),
            reason: "must be greater than zero".into(),
        });
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = ServerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.port, 8000);
        assert_eq!(config.channel_prefix, "product_analysis");
        assert_eq!(config.cors_origins, vec!["http://localhost:3000"]);
        assert_eq!(config.registry_config().max_consecutive_drops, 64);
    }

    #[test]
    fn overrides_are_parsed() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("PORT", "9001"),
            ("CORS_ORIGINS", "http://a.test, http://b.test,"),
            ("WORKER_CONCURRENCY", "8"),
            ("BROKER_TIMEOUT_SECS", "2"),
        ]))
        .unwrap();
        assert_eq!(config.port, 9001);
        assert_eq!(config.cors_origins, vec!["http://a.test", "http://b.test"]);
        assert_eq!(config.worker_config().concurrency, 8);
        assert_eq!(
            config.registry_config().broker_timeout,
            Duration::from_secs(2)
        );
    }

    #[test]
    fn invalid_number_is_reported_with_key() {
        let err = ServerConfig::from_lookup(lookup(&[("PORT", "eighty")])).unwrap_err();
        assert_eq!(err.key, "PORT");
        assert_eq!(err.value, "eighty");
    }

    #[test]
    fn zero_is_rejected_where_positive_required() {
        let err = ServerConfig::from_lookup(lookup(&[("WORKER_CONCURRENCY", "0")])).unwrap_err();
        assert_eq!(err.key, "WORKER_CONCURRENCY");
    }

    #[test]
    fn tiny_session_buffer_rejected() {
        let err = ServerConfig::from_lookup(lookup(&[("SESSION_BUFFER", "1")])).unwrap_err();
        assert_eq!(err.key, "SESSION_BUFFER");
    }

    #[test]
    fn bad_prefix_rejected() {
        let err = ServerConfig::from_lookup(lookup(&[("CHANNEL_PREFIX", "has space")])).unwrap_err();
        assert_eq!(err.key, "CHANNEL_PREFIX");
    }
}
