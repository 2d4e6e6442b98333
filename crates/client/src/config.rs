use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use taskrelay_core::task::AnalysisRequest;

use crate::reconnect::ReconnectConfig;

/// A configuration value could not be used.
#[derive(Debug, thiserror::Error)]
#[error("Invalid {key}={value:?}: {reason}")]
pub struct ConfigError {
    pub key: &'static str,
    pub value: String,
    pub reason: String,
}

/// What the watcher follows.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchTarget {
    /// An already submitted task.
    Task(String),
    /// Submit this request first, then follow the new task.
    Submit(AnalysisRequest),
}

/// Configuration of `taskrelay-watch`, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub http_url: String,
    pub ws_url: String,
    pub target: WatchTarget,
    pub reconnect: ReconnectConfig,
    pub poll_interval: Duration,
}

impl WatchConfig {
    /// | Env Var                 | Default                          |
    /// |-------------------------|----------------------------------|
    /// | `RELAY_HTTP_URL`        | `http://localhost:8000`          |
    /// | `RELAY_WS_URL`          | `ws://localhost:8000/api/v1/ws`  |
    /// | `TASK_ID`               | (either this or `ANALYZE_URL`)   |
    /// | `ANALYZE_URL`           |                                  |
    /// | `MAX_PRODUCTS`          | `10`                             |
    /// | `MAX_COMPETITIVE`       | `5`                              |
    /// | `RECONNECT_MAX_RETRIES` | `5`                              |
    /// | `RECONNECT_DELAY_MS`    | `2000`                           |
    /// | `POLL_INTERVAL_MS`      | `3000`                           |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let http_url =
            lookup("RELAY_HTTP_URL").unwrap_or_else(|| "http://localhost:8000".to_string());
        let ws_url =
            lookup("RELAY_WS_URL").unwrap_or_else(|| "ws://localhost:8000/api/v1/ws".to_string());

        let target = match (lookup("TASK_ID"), lookup("ANALYZE_URL")) {
            (Some(task_id), _) if !task_id.trim().is_empty() => {
                WatchTarget::Task(task_id.trim().to_string())
            }
            (_, Some(url)) => {
                let mut request = AnalysisRequest::new(url.clone());
                request.max_products = parse_var(&lookup, "MAX_PRODUCTS", request.max_products)?;
                request.max_competitive =
                    parse_var(&lookup, "MAX_COMPETITIVE", request.max_competitive)?;
                if let Err(e) = request.validate() {
                    return Err(ConfigError {
                        key: "ANALYZE_URL",
                        value: url,
                        reason: e.to_string(),
                    });
                }
                WatchTarget::Submit(request)
            }
            _ => {
                return Err(ConfigError {
                    key: "TASK_ID",
                    value: String::new(),
                    reason: "set TASK_ID or ANALYZE_URL".into(),
                })
            }
        };

        let defaults = ReconnectConfig::default();
        let delay_ms = parse_var(
            &lookup,
            "RECONNECT_DELAY_MS",
            defaults.initial_delay.as_millis() as u64,
        )?;
        let reconnect = ReconnectConfig {
            initial_delay: Duration::from_millis(delay_ms),
            max_retries: parse_var(&lookup, "RECONNECT_MAX_RETRIES", defaults.max_retries)?,
            ..defaults
        };

        let poll_ms: u64 = parse_var(&lookup, "POLL_INTERVAL_MS", 3000)?;
        if poll_ms == 0 {
            return Err(ConfigError {
                key: "POLL_INTERVAL_MS",
                value: "0".into(),
                reason: "must be greater than zero".into(),
            });
        }

        Ok(Self {
            http_url,
            ws_url,
            target,
            reconnect,
            poll_interval: Duration::from_millis(poll_ms),
        })
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
            value: raw.clone(),
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert_matches::assert_matches;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<WatchConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        WatchConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn task_id_with_defaults() {
        let config = load(&[("TASK_ID", "T1")]).unwrap();
        assert_eq!(config.target, WatchTarget::Task("T1".into()));
        assert_eq!(config.ws_url, "ws://localhost:8000/api/v1/ws");
        assert_eq!(config.reconnect.max_retries, 5);
        assert_eq!(config.reconnect.initial_delay, Duration::from_secs(2));
        assert_eq!(config.poll_interval, Duration::from_secs(3));
    }

    #[test]
    fn analyze_url_builds_request() {
        let config = load(&[
            ("ANALYZE_URL", "https://shop.example.com/item/1"),
            ("MAX_COMPETITIVE", "3"),
        ])
        .unwrap();
        assert_matches!(config.target, WatchTarget::Submit(req) if req.max_competitive == 3);
    }

    #[test]
    fn missing_target_is_rejected() {
        let err = load(&[]).unwrap_err();
        assert_eq!(err.key, "TASK_ID");
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = load(&[("TASK_ID", "T1"), ("RECONNECT_MAX_RETRIES", "many")]).unwrap_err();
        assert_eq!(err.key, "RECONNECT_MAX_RETRIES");

        let err = load(&[("ANALYZE_URL", "not a url")]).unwrap_err();
        assert_eq!(err.key, "ANALYZE_URL");

        let err = load(&[("TASK_ID", "T1"), ("POLL_INTERVAL_MS", "0")]).unwrap_err();
        assert_eq!(err.key, "POLL_INTERVAL_MS");
    }
}
