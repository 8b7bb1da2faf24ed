//! Engine configuration loaded from the environment.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Tunables of the engine. Every field has a default; see [`EngineConfig::from_env`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Capture a snapshot each time a stream crosses a multiple of this many events (0 disables).
    pub snapshot_every: u64,
    /// Concurrency conflicts retried by the dispatcher before surfacing.
    pub max_concurrency_retries: u32,
    /// Attempts per event before a (handler, stream) pair is marked degraded.
    pub projection_max_attempts: u32,
    /// Base delay of the exponential backoff between projection attempts.
    pub projection_backoff: Duration,
    /// How long a saga may wait before it is timed out by `tick`.
    pub saga_timeout: Duration,
    /// Page size of lazy log reads.
    pub log_page_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            snapshot_every: 50,
            max_concurrency_retries: 3,
            projection_max_attempts: 5,
            projection_backoff: Duration::from_millis(50),
            saga_timeout: Duration::from_secs(300),
            log_page_size: 256,
        }
    }
}

impl EngineConfig {
    pub const SNAPSHOT_EVERY: &'static str = "FOLIO_SNAPSHOT_EVERY";
    pub const MAX_CONCURRENCY_RETRIES: &'static str = "FOLIO_MAX_CONCURRENCY_RETRIES";
    pub const PROJECTION_MAX_ATTEMPTS: &'static str = "FOLIO_PROJECTION_MAX_ATTEMPTS";
    pub const PROJECTION_BACKOFF_MS: &'static str = "FOLIO_PROJECTION_BACKOFF_MS";
    pub const SAGA_TIMEOUT_SECS: &'static str = "FOLIO_SAGA_TIMEOUT_SECS";
    pub const LOG_PAGE_SIZE: &'static str = "FOLIO_LOG_PAGE_SIZE";

    /// Read the `FOLIO_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let projection_max_attempts = parse(&lookup, Self::PROJECTION_MAX_ATTEMPTS)?
            .unwrap_or(defaults.projection_max_attempts);
        if projection_max_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: Self::PROJECTION_MAX_ATTEMPTS,
                value: "0".to_string(),
                reason: "at least one attempt is required".to_string(),
            });
        }

        let log_page_size: usize =
            parse(&lookup, Self::LOG_PAGE_SIZE)?.unwrap_or(defaults.log_page_size);
        if log_page_size == 0 {
            return Err(ConfigError::Invalid {
                key: Self::LOG_PAGE_SIZE,
                value: "0".to_string(),
                reason: "page size must be positive".to_string(),
            });
        }

        Ok(Self {
            snapshot_every: parse(&lookup, Self::SNAPSHOT_EVERY)?.unwrap_or(defaults.snapshot_every),
            max_concurrency_retries: parse(&lookup, Self::MAX_CONCURRENCY_RETRIES)?
                .unwrap_or(defaults.max_concurrency_retries),
            projection_max_attempts,
            projection_backoff: parse(&lookup, Self::PROJECTION_BACKOFF_MS)?
                .map(Duration::from_millis)
                .unwrap_or(defaults.projection_backoff),
            saga_timeout: parse(&lookup, Self::SAGA_TIMEOUT_SECS)?
                .map(Duration::from_secs)
                .unwrap_or(defaults.saga_timeout),
            log_page_size,
        })
    }

    pub fn with_snapshot_every(mut self, every: u64) -> Self {
        self.snapshot_every = every;
        self
    }

    pub fn with_max_concurrency_retries(mut self, retries: u32) -> Self {
        self.max_concurrency_retries = retries;
        self
    }

    pub fn with_projection_retry(mut self, max_attempts: u32, backoff: Duration) -> Self {
        self.projection_max_attempts = max_attempts.max(1);
        self.projection_backoff = backoff;
        self
    }

    pub fn with_saga_timeout(mut self, timeout: Duration) -> Self {
        self.saga_timeout = timeout;
        self
    }

    pub fn with_log_page_size(mut self, page_size: usize) -> Self {
        self.log_page_size = page_size.max(1);
        self
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: core::str::FromStr,
    T::Err: core::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::Invalid {
                key,
                value: raw.clone(),
                reason: e.to_string(),
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let cfg = EngineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg, EngineConfig::default());
        assert_eq!(cfg.snapshot_every, 50);
        assert_eq!(cfg.max_concurrency_retries, 3);
    }

    #[test]
    fn variables_override_defaults() {
        let cfg = EngineConfig::from_lookup(lookup(&[
            ("FOLIO_SNAPSHOT_EVERY", "0"),
            ("FOLIO_PROJECTION_BACKOFF_MS", "5"),
            ("FOLIO_SAGA_TIMEOUT_SECS", "30"),
        ]))
        .unwrap();
        assert_eq!(cfg.snapshot_every, 0);
        assert_eq!(cfg.projection_backoff, Duration::from_millis(5));
        assert_eq!(cfg.saga_timeout, Duration::from_secs(30));
    }

    #[test]
    fn garbage_is_reported_with_its_key() {
        let err = EngineConfig::from_lookup(lookup(&[("FOLIO_MAX_CONCURRENCY_RETRIES", "lots")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                key: "FOLIO_MAX_CONCURRENCY_RETRIES",
                ..
            }
        ));
    }

    #[test]
    fn zero_attempts_is_refused() {
        let err =
            EngineConfig::from_lookup(lookup(&[("FOLIO_PROJECTION_MAX_ATTEMPTS", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }
}
