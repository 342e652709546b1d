//! Environment-driven settings for the projector process.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use stockview_core::ProjectorId;

use crate::retry::RetryPolicy;
use crate::workers::{FailurePolicy, ProjectorConfig};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Process settings.
///
/// | variable | default |
/// |----------|---------|
/// | `DATABASE_URL` | required |
/// | `DATABASE_MAX_CONNECTIONS` | 5 |
/// | `PROJECTOR_ID` | `main_projector` |
/// | `PROJECTOR_BATCH_SIZE` | 256 |
/// | `PROJECTOR_POLL_INTERVAL_MS` | 1000 |
/// | `PROJECTOR_FAILURE_POLICY` | `skip` (`skip` or `halt`) |
/// | `PROJECTOR_RETRY_MAX_ATTEMPTS` | 5 |
/// | `PROJECTOR_RETRY_BASE_DELAY_MS` | 200 |
/// | `PROJECTOR_LEASE_TTL_MS` | 30000 |
/// | `STOCKVIEW_PROVISION_SCHEMA` | false |
#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: String,
    pub max_connections: u32,
    pub provision_schema: bool,
    pub projector: ProjectorConfig,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary key lookup (tests pass a map).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let database_url = get("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;
        let max_connections = parse_or(&get, "DATABASE_MAX_CONNECTIONS", 5u32)?;
        let provision_schema = parse_bool(&get, "STOCKVIEW_PROVISION_SCHEMA", false)?;

        let projector_id = match get("PROJECTOR_ID") {
            Some(raw) => ProjectorId::new(raw).map_err(|e| ConfigError::Invalid {
                key: "PROJECTOR_ID",
                reason: e.to_string(),
            })?,
            None => ProjectorId::default(),
        };

        let batch_size = parse_or(&get, "PROJECTOR_BATCH_SIZE", 256usize)?;
        if batch_size == 0 {
            return Err(ConfigError::Invalid {
                key: "PROJECTOR_BATCH_SIZE",
                reason: "must be at least 1".to_string(),
            });
        }

        let poll_interval =
            Duration::from_millis(parse_or(&get, "PROJECTOR_POLL_INTERVAL_MS", 1000u64)?);
        let failure_policy =
            parse_or(&get, "PROJECTOR_FAILURE_POLICY", FailurePolicy::SkipAndContinue)?;
        let retry = RetryPolicy::exponential(
            parse_or(&get, "PROJECTOR_RETRY_MAX_ATTEMPTS", 5u32)?,
            Duration::from_millis(parse_or(&get, "PROJECTOR_RETRY_BASE_DELAY_MS", 200u64)?),
            Duration::from_secs(30),
        );
        let lease_ttl = Duration::from_millis(parse_or(&get, "PROJECTOR_LEASE_TTL_MS", 30_000u64)?);
        if lease_ttl <= poll_interval {
            return Err(ConfigError::Invalid {
                key: "PROJECTOR_LEASE_TTL_MS",
                reason: "must be longer than the poll interval".to_string(),
            });
        }

        Ok(Self {
            database_url,
            max_connections,
            provision_schema,
            projector: ProjectorConfig {
                projector_id,
                batch_size,
                poll_interval,
                failure_policy,
                retry,
                lease_ttl,
            },
        })
    }
}

fn parse_or<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: core::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn parse_bool<G>(get: &G, key: &'static str, default: bool) -> Result<bool, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key).map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid {
                key,
                reason: format!("'{v}' is not a boolean"),
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(pairs: &[(&str, &str)]) -> Result<Settings, ConfigError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_only_the_url_is_set() {
        let s = settings(&[("DATABASE_URL", "postgres://localhost/stock")]).unwrap();
        assert_eq!(s.max_connections, 5);
        assert!(!s.provision_schema);
        assert_eq!(s.projector.projector_id.as_str(), "main_projector");
        assert_eq!(s.projector.batch_size, 256);
        assert_eq!(s.projector.poll_interval, Duration::from_secs(1));
        assert_eq!(s.projector.failure_policy, FailurePolicy::SkipAndContinue);
        assert_eq!(s.projector.retry.max_attempts, 5);
        assert_eq!(s.projector.retry.base_delay, Duration::from_millis(200));
        assert_eq!(s.projector.lease_ttl, Duration::from_secs(30));
    }

    #[test]
    fn database_url_is_required() {
        assert_eq!(settings(&[]).unwrap_err(), ConfigError::Missing("DATABASE_URL"));
        assert_eq!(
            settings(&[("DATABASE_URL", "  ")]).unwrap_err(),
            ConfigError::Missing("DATABASE_URL")
        );
    }

    #[test]
    fn overrides_are_parsed() {
        let s = settings(&[
            ("DATABASE_URL", "postgres://db/stock"),
            ("PROJECTOR_ID", "audit_projector"),
            ("PROJECTOR_BATCH_SIZE", "10"),
            ("PROJECTOR_FAILURE_POLICY", "halt"),
            ("STOCKVIEW_PROVISION_SCHEMA", "true"),
        ])
        .unwrap();
        assert_eq!(s.projector.projector_id.as_str(), "audit_projector");
        assert_eq!(s.projector.batch_size, 10);
        assert_eq!(s.projector.failure_policy, FailurePolicy::HaltAndAlert);
        assert!(s.provision_schema);
    }

    #[test]
    fn bad_values_name_the_key() {
        let err = settings(&[("DATABASE_URL", "x"), ("PROJECTOR_BATCH_SIZE", "lots")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "PROJECTOR_BATCH_SIZE", .. }));

        let err = settings(&[("DATABASE_URL", "x"), ("PROJECTOR_BATCH_SIZE", "0")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "PROJECTOR_BATCH_SIZE", .. }));

        let err =
            settings(&[("DATABASE_URL", "x"), ("PROJECTOR_FAILURE_POLICY", "retry")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "PROJECTOR_FAILURE_POLICY", .. }));

        let err =
            settings(&[("DATABASE_URL", "x"), ("PROJECTOR_LEASE_TTL_MS", "500")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "PROJECTOR_LEASE_TTL_MS", .. }));
    }
}
