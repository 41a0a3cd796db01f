//! Environment-sourced settings.
//!
//! Every numeric setting has a safe default and a bounded range:
//!
//! | Input | Result |
//! |-------|--------|
//! | unset | default |
//! | not a number | default, with a warning |
//! | outside the range | clamped into the range, with a warning |
//!
//! Settings built in code skip that sanitizing and are checked by
//! [`SyncSettings::validate`] when a job starts.

use std::ops::RangeInclusive;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use metricsync_core::SyncKind;

pub const SHOP_METRICS_CONCURRENCY_VAR: &str = "SHOP_METRICS_SYNC_CONCURRENCY";
pub const ADS_METRICS_CONCURRENCY_VAR: &str = "ADS_METRICS_SYNC_CONCURRENCY";
pub const REFRESH_HORIZON_VAR: &str = "TOKEN_REFRESH_HORIZON_HOURS";
pub const REFRESH_DELAY_VAR: &str = "TOKEN_REFRESH_DELAY_MS";

pub const DEFAULT_SHOP_METRICS_CONCURRENCY: usize = 20;
pub const DEFAULT_ADS_METRICS_CONCURRENCY: usize = 15;
pub const DEFAULT_REFRESH_HORIZON_HOURS: u32 = 24;
pub const DEFAULT_REFRESH_DELAY_MS: u64 = 1_000;

pub const CONCURRENCY_RANGE: RangeInclusive<usize> = 1..=50;
pub const REFRESH_HORIZON_RANGE: RangeInclusive<u32> = 1..=720;
pub const REFRESH_DELAY_RANGE: RangeInclusive<u64> = 0..=60_000;

/// Connections kept free for callers other than sync workers.
pub const POOL_HEADROOM: u32 = 10;

pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";
pub const DEFAULT_REDIS_LOCK_TTL_SECS: u64 = 900;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

/// Sync job settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSettings {
    pub shop_metrics_concurrency: usize,
    pub ads_metrics_concurrency: usize,
    pub refresh_horizon_hours: u32,
    /// Pause between two consecutive credential refresh calls.
    pub refresh_delay: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            shop_metrics_concurrency: DEFAULT_SHOP_METRICS_CONCURRENCY,
            ads_metrics_concurrency: DEFAULT_ADS_METRICS_CONCURRENCY,
            refresh_horizon_hours: DEFAULT_REFRESH_HORIZON_HOURS,
            refresh_delay: Duration::from_millis(DEFAULT_REFRESH_DELAY_MS),
        }
    }
}

impl SyncSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary key lookup (tests, layered config).
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            shop_metrics_concurrency: bounded(
                &lookup,
                SHOP_METRICS_CONCURRENCY_VAR,
                DEFAULT_SHOP_METRICS_CONCURRENCY,
                CONCURRENCY_RANGE,
            ),
            ads_metrics_concurrency: bounded(
                &lookup,
                ADS_METRICS_CONCURRENCY_VAR,
                DEFAULT_ADS_METRICS_CONCURRENCY,
                CONCURRENCY_RANGE,
            ),
            refresh_horizon_hours: bounded(
                &lookup,
                REFRESH_HORIZON_VAR,
                DEFAULT_REFRESH_HORIZON_HOURS,
                REFRESH_HORIZON_RANGE,
            ),
            refresh_delay: Duration::from_millis(bounded(
                &lookup,
                REFRESH_DELAY_VAR,
                DEFAULT_REFRESH_DELAY_MS,
                REFRESH_DELAY_RANGE,
            )),
        }
    }

    pub fn concurrency_for(&self, kind: SyncKind) -> usize {
        match kind {
            SyncKind::ShopMetrics => self.shop_metrics_concurrency,
            SyncKind::AdsMetrics => self.ads_metrics_concurrency,
        }
    }

    pub fn with_concurrency(mut self, kind: SyncKind, concurrency: usize) -> Self {
        match kind {
            SyncKind::ShopMetrics => self.shop_metrics_concurrency = concurrency,
            SyncKind::AdsMetrics => self.ads_metrics_concurrency = concurrency,
        }
        self
    }

    pub fn with_refresh_delay(mut self, delay: Duration) -> Self {
        self.refresh_delay = delay;
        self
    }

    /// Largest worker budget across kinds (sizes the connection pool).
    pub fn max_concurrency(&self) -> usize {
        SyncKind::ALL
            .into_iter()
            .map(|kind| self.concurrency_for(kind))
            .max()
            .unwrap_or(0)
    }

    /// Reject values outside the accepted ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for kind in SyncKind::ALL {
            let concurrency = self.concurrency_for(kind);
            if !CONCURRENCY_RANGE.contains(&concurrency) {
                return Err(ConfigError::Invalid {
                    key: concurrency_var(kind),
                    value: concurrency.to_string(),
                });
            }
        }
        if !REFRESH_HORIZON_RANGE.contains(&self.refresh_horizon_hours) {
            return Err(ConfigError::Invalid {
                key: REFRESH_HORIZON_VAR,
                value: self.refresh_horizon_hours.to_string(),
            });
        }
        Ok(())
    }
}

pub fn concurrency_var(kind: SyncKind) -> &'static str {
    match kind {
        SyncKind::ShopMetrics => SHOP_METRICS_CONCURRENCY_VAR,
        SyncKind::AdsMetrics => ADS_METRICS_CONCURRENCY_VAR,
    }
}

/// Database connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseSettings {
    pub url: String,
    pub max_connections: u32,
}

impl DatabaseSettings {
    pub fn from_env(sync: &SyncSettings) -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok(), sync)
    }

    /// The pool is never sized below the largest worker budget plus
    /// [`POOL_HEADROOM`], so sync workers cannot starve other callers.
    pub fn from_lookup<F>(lookup: F, sync: &SyncSettings) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let url = lookup("DATABASE_URL")
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConfigError::Missing("DATABASE_URL"))?;

        let floor = u32::try_from(sync.max_concurrency())
            .unwrap_or(u32::MAX)
            .saturating_add(POOL_HEADROOM);

        let max_connections = match lookup("DATABASE_MAX_CONNECTIONS") {
            None => floor,
            Some(raw) => match raw.trim().parse::<u32>() {
                Ok(n) if n >= floor => n,
                Ok(n) => {
                    warn!(
                        configured = n,
                        floor, "DATABASE_MAX_CONNECTIONS below sync concurrency plus headroom, raising"
                    );
                    floor
                }
                Err(_) => {
                    warn!(value = %raw, default = floor, "DATABASE_MAX_CONNECTIONS is not a number, using default");
                    floor
                }
            },
        };

        Ok(Self {
            url,
            max_connections,
        })
    }
}

/// Where store locks live.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum LockBackendKind {
    /// Postgres advisory locks (shared by every process on the database).
    #[default]
    Postgres,
    Redis,
    /// Process-local only.
    Memory,
}

impl FromStr for LockBackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" => Ok(LockBackendKind::Postgres),
            "redis" => Ok(LockBackendKind::Redis),
            "memory" => Ok(LockBackendKind::Memory),
            other => Err(ConfigError::Invalid {
                key: "LOCK_BACKEND",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockSettings {
    pub backend: LockBackendKind,
    pub redis_url: String,
    pub redis_ttl: Duration,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            backend: LockBackendKind::default(),
            redis_url: DEFAULT_REDIS_URL.to_string(),
            redis_ttl: Duration::from_secs(DEFAULT_REDIS_LOCK_TTL_SECS),
        }
    }
}

impl LockSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let backend = match lookup("LOCK_BACKEND") {
            Some(raw) => raw.parse()?,
            None => LockBackendKind::default(),
        };

        Ok(Self {
            backend,
            redis_url: lookup("REDIS_URL").unwrap_or_else(|| DEFAULT_REDIS_URL.to_string()),
            redis_ttl: Duration::from_secs(bounded(
                &lookup,
                "REDIS_LOCK_TTL_SECS",
                DEFAULT_REDIS_LOCK_TTL_SECS,
                1..=86_400,
            )),
        })
    }
}

fn bounded<T, F>(lookup: &F, key: &str, default: T, range: RangeInclusive<T>) -> T
where
    T: FromStr + PartialOrd + Copy + core::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return default;
    };

    let Ok(value) = raw.trim().parse::<T>() else {
        warn!(key, value = %raw, %default, "setting is not a number, using default");
        return default;
    };

    if value < *range.start() {
        warn!(key, %value, min = %range.start(), "setting below range, clamping");
        *range.start()
    } else if value > *range.end() {
        warn!(key, %value, max = %range.end(), "setting above range, clamping");
        *range.end()
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn unset_values_use_defaults() {
        assert_eq!(SyncSettings::from_lookup(env(&[])), SyncSettings::default());
    }

    #[test]
    fn non_numeric_falls_back_to_default() {
        let settings = SyncSettings::from_lookup(env(&[
            (SHOP_METRICS_CONCURRENCY_VAR, "lots"),
            (REFRESH_HORIZON_VAR, ""),
        ]));
        assert_eq!(settings.shop_metrics_concurrency, DEFAULT_SHOP_METRICS_CONCURRENCY);
        assert_eq!(settings.refresh_horizon_hours, DEFAULT_REFRESH_HORIZON_HOURS);
    }

    #[test]
    fn out_of_range_is_clamped() {
        let settings = SyncSettings::from_lookup(env(&[
            (SHOP_METRICS_CONCURRENCY_VAR, "0"),
            (ADS_METRICS_CONCURRENCY_VAR, "500"),
            (REFRESH_HORIZON_VAR, "10000"),
            (REFRESH_DELAY_VAR, " 250 "),
        ]));
        assert_eq!(settings.shop_metrics_concurrency, 1);
        assert_eq!(settings.ads_metrics_concurrency, 50);
        assert_eq!(settings.refresh_horizon_hours, 720);
        assert_eq!(settings.refresh_delay, Duration::from_millis(250));
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn zero_concurrency_fails_validation() {
        let settings = SyncSettings::default().with_concurrency(SyncKind::AdsMetrics, 0);
        assert_eq!(
            settings.validate(),
            Err(ConfigError::Invalid {
                key: ADS_METRICS_CONCURRENCY_VAR,
                value: "0".to_string()
            })
        );
    }

    #[test]
    fn out_of_range_horizon_fails_validation() {
        let settings = SyncSettings {
            refresh_horizon_hours: u32::MAX,
            ..SyncSettings::default()
        };
        assert_eq!(
            settings.validate(),
            Err(ConfigError::Invalid {
                key: REFRESH_HORIZON_VAR,
                value: u32::MAX.to_string()
            })
        );
    }

    #[test]
    fn pool_is_sized_above_worker_budget() {
        let sync = SyncSettings::default();
        let db = DatabaseSettings::from_lookup(
            env(&[("DATABASE_URL", "postgres://localhost/metrics"), ("DATABASE_MAX_CONNECTIONS", "5")]),
            &sync,
        )
        .unwrap();
        assert_eq!(db.max_connections, 30);

        let db = DatabaseSettings::from_lookup(
            env(&[("DATABASE_URL", "postgres://localhost/metrics"), ("DATABASE_MAX_CONNECTIONS", "64")]),
            &sync,
        )
        .unwrap();
        assert_eq!(db.max_connections, 64);
    }

    #[test]
    fn database_url_is_required() {
        assert_eq!(
            DatabaseSettings::from_lookup(env(&[]), &SyncSettings::default()),
            Err(ConfigError::Missing("DATABASE_URL"))
        );
    }

    #[test]
    fn lock_backend_parses_case_insensitively() {
        let settings = LockSettings::from_lookup(env(&[("LOCK_BACKEND", "Redis")])).unwrap();
        assert_eq!(settings.backend, LockBackendKind::Redis);
        assert_eq!(settings.redis_ttl, Duration::from_secs(DEFAULT_REDIS_LOCK_TTL_SECS));

        assert!(LockSettings::from_lookup(env(&[("LOCK_BACKEND", "zookeeper")])).is_err());
    }
}
