//! Runtime configuration read from `SWAPGATE_*` environment variables.
//!
//! | Variable                       | Default                 |
//! |--------------------------------|-------------------------|
//! | `SWAPGATE_BIND`                | `127.0.0.1:8080`        |
//! | `SWAPGATE_PROXY_PREFIX`        | `/api/proxy`            |
//! | `SWAPGATE_UPSTREAM_ORIGIN`     | `https://api.1inch.dev` |
//! | `SWAPGATE_UPSTREAM_TIMEOUT_MS` | unset (no timeout)      |
//! | `SWAPGATE_API_KEY_VAR`         | `SWAPGATE_API_KEY`      |
//! | `SWAPGATE_TICKER_URL`          | unset (route disabled)  |
//! | `SWAPGATE_TICKER_TTL_MS`       | `300000`                |
//!
//! The API key itself is not part of the configuration. Only the *name* of
//! the variable holding it is; the proxy reads that variable per request.

use std::time::Duration;

use thiserror::Error;

use crate::cache::DEFAULT_TTL;
use crate::proxy::ProxyConfig;

pub const DEFAULT_BIND: &str = "127.0.0.1:8080";
pub const DEFAULT_PROXY_PREFIX: &str = "/api/proxy";
pub const DEFAULT_UPSTREAM_ORIGIN: &str = "https://api.1inch.dev";
pub const DEFAULT_API_KEY_VAR: &str = "SWAPGATE_API_KEY";

/// Errors produced while reading configuration.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?} ({reason})")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Everything the binary needs to start serving.
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub bind: String,
    pub proxy_prefix: String,
    pub upstream_origin: String,
    pub upstream_timeout: Option<Duration>,
    pub api_key_var: String,
    pub ticker_url: Option<String>,
    pub ticker_ttl: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_owned(),
            proxy_prefix: DEFAULT_PROXY_PREFIX.to_owned(),
            upstream_origin: DEFAULT_UPSTREAM_ORIGIN.to_owned(),
            upstream_timeout: None,
            api_key_var: DEFAULT_API_KEY_VAR.to_owned(),
            ticker_url: None,
            ticker_ttl: DEFAULT_TTL,
        }
    }
}

impl AppConfig {
    /// Reads configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Reads configuration through `lookup`. Blank values count as unset.
    pub fn from_lookup<L>(lookup: L) -> Result<Self, ConfigError>
    where
        L: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let proxy_prefix = match get("SWAPGATE_PROXY_PREFIX") {
            Some(prefix) if !prefix.starts_with('/') => {
                return Err(ConfigError::Invalid {
                    var: "SWAPGATE_PROXY_PREFIX",
                    value: prefix,
                    reason: "must start with '/'".into(),
                });
            }
            Some(prefix) => prefix,
            None => defaults.proxy_prefix,
        };

        Ok(Self {
            bind: get("SWAPGATE_BIND").unwrap_or(defaults.bind),
            proxy_prefix,
            upstream_origin: get("SWAPGATE_UPSTREAM_ORIGIN").unwrap_or(defaults.upstream_origin),
            upstream_timeout: get("SWAPGATE_UPSTREAM_TIMEOUT_MS")
                .map(|v| millis("SWAPGATE_UPSTREAM_TIMEOUT_MS", v))
                .transpose()?,
            api_key_var: get("SWAPGATE_API_KEY_VAR").unwrap_or(defaults.api_key_var),
            ticker_url: get("SWAPGATE_TICKER_URL"),
            ticker_ttl: get("SWAPGATE_TICKER_TTL_MS")
                .map(|v| millis("SWAPGATE_TICKER_TTL_MS", v))
                .transpose()?
                .unwrap_or(defaults.ticker_ttl),
        })
    }

    /// Proxy settings derived from this configuration.
    pub fn proxy(&self) -> ProxyConfig {
        let config = ProxyConfig::new(&self.proxy_prefix, &self.upstream_origin);
        match self.upstream_timeout {
            Some(timeout) => config.timeout(timeout),
            None => config,
        }
    }
}

fn millis(var: &'static str, value: String) -> Result<Duration, ConfigError> {
    match value.trim().parse::<u64>() {
        Ok(ms) => Ok(Duration::from_millis(ms)),
        Err(e) => Err(ConfigError::Invalid {
            var,
            value,
            reason: e.to_string(),
        }),
    }
}
