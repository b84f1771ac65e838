use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;

use crate::service::{ConflictPolicy, IssuancePolicy};
use crate::store::LockSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    File,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" => Ok(Self::File),
            "memory" => Ok(Self::Memory),
            other => anyhow::bail!("unknown store backend '{}': expected file or memory", other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Name reported by `/` and attached to every log line. Lets two
    /// deployments of the same binary be told apart.
    pub instance: String,
    pub token_dir: PathBuf,
    pub store: StoreBackend,
    pub admin_key: Option<String>,
    pub log_format: LogFormat,
    pub issuance: IssuancePolicy,
    pub locks: LockSettings,
    /// How long revoked/expired records are kept before the cleanup job
    /// deletes them. `None` disables the job.
    pub retention: Option<Duration>,
    pub cleanup_interval: Duration,
    pub production: bool,
}

impl Config {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8000,
            instance: "default".into(),
            token_dir: PathBuf::from("tokens"),
            store: StoreBackend::File,
            admin_key: None,
            log_format: LogFormat::Text,
            issuance: IssuancePolicy::default(),
            locks: LockSettings::default(),
            retention: Some(Duration::from_secs(7 * 24 * 3600)),
            cleanup_interval: Duration::from_secs(3600),
            production: false,
        }
    }
}

/// Load configuration from the environment (and `.env`, if present).
pub fn load() -> anyhow::Result<Config> {
    dotenvy::dotenv().ok();
    from_lookup(|key| std::env::var(key).ok())
}

/// Build a config from an arbitrary key lookup. `load` passes the process
/// environment; tests pass a map.
pub fn from_lookup<F>(get: F) -> anyhow::Result<Config>
where
    F: Fn(&str) -> Option<String>,
{
    let defaults = Config::default();
    let get = |key: &str| get(key).filter(|v| !v.trim().is_empty());

    let env_mode = get("TOKEND_ENV").or_else(|| get("RUST_ENV")).unwrap_or_default();
    let production = env_mode == "production";

    let admin_key = get("TOKEND_ADMIN_KEY");
    if admin_key.is_none() && production {
        anyhow::bail!("TOKEND_ADMIN_KEY must be set when running in production");
    }

    let log_format = match get("TOKEND_LOG_FORMAT").as_deref() {
        Some("json") => LogFormat::Json,
        Some("text") | None => LogFormat::Text,
        Some(other) => anyhow::bail!("TOKEND_LOG_FORMAT must be text or json, got '{}'", other),
    };

    let retention = match parse_secs(&get, "TOKEND_RETENTION")? {
        Some(d) if d.is_zero() => None,
        Some(d) => Some(d),
        None => defaults.retention,
    };

    Ok(Config {
        host: get("TOKEND_HOST").unwrap_or(defaults.host),
        port: parse(&get, "TOKEND_PORT")?.unwrap_or(defaults.port),
        instance: get("TOKEND_INSTANCE").unwrap_or(defaults.instance),
        token_dir: get("TOKEND_TOKEN_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.token_dir),
        store: parse(&get, "TOKEND_STORE")?.unwrap_or(defaults.store),
        admin_key,
        log_format,
        issuance: IssuancePolicy {
            on_conflict: get("TOKEND_ON_CONFLICT")
                .map(|v| ConflictPolicy::from_str(&v))
                .transpose()
                .map_err(anyhow::Error::msg)?
                .unwrap_or_default(),
            default_ttl: parse_secs(&get, "TOKEND_DEFAULT_TTL")?,
            max_ttl: parse_secs(&get, "TOKEND_MAX_TTL")?,
            renewal_margin: parse_secs(&get, "TOKEND_RENEWAL_MARGIN")?
                .unwrap_or(defaults.issuance.renewal_margin),
        },
        locks: LockSettings {
            timeout: parse(&get, "TOKEND_LOCK_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.locks.timeout),
            stale_after: parse_secs(&get, "TOKEND_STALE_LOCK_SECS")?
                .unwrap_or(defaults.locks.stale_after),
        },
        retention,
        cleanup_interval: parse_secs(&get, "TOKEND_CLEANUP_INTERVAL")?
            .filter(|d| !d.is_zero())
            .unwrap_or(defaults.cleanup_interval),
        production,
    })
}

fn parse<T, F>(get: &F, key: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    get(key)
        .map(|v| {
            v.trim()
                .parse::<T>()
                .map_err(|e| anyhow::anyhow!("{}", e))
                .with_context(|| format!("invalid {}: '{}'", key, v))
        })
        .transpose()
}

fn parse_secs<F>(get: &F, key: &str) -> anyhow::Result<Option<Duration>>
where
    F: Fn(&str) -> Option<String>,
{
    Ok(parse::<u64, F>(get, key)?.map(Duration::from_secs))
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
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let cfg = from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg.bind_addr(), "0.0.0.0:8000");
        assert_eq!(cfg.token_dir, PathBuf::from("tokens"));
        assert_eq!(cfg.store, StoreBackend::File);
        assert_eq!(cfg.issuance.on_conflict, ConflictPolicy::Reject);
        assert_eq!(cfg.issuance.renewal_margin, Duration::from_secs(600));
        assert_eq!(cfg.retention, Some(Duration::from_secs(604800)));
        assert!(cfg.admin_key.is_none());
    }

    #[test]
    fn test_second_deployment_differs_only_by_config() {
        let cfg = from_lookup(lookup(&[
            ("TOKEND_PORT", "8001"),
            ("TOKEND_INSTANCE", "secondary"),
            ("TOKEND_TOKEN_DIR", "/app/tokens"),
        ]))
        .unwrap();
        assert_eq!(cfg.port, 8001);
        assert_eq!(cfg.instance, "secondary");
        assert_eq!(cfg.token_dir, PathBuf::from("/app/tokens"));
    }

    #[test]
    fn test_policy_and_lock_settings() {
        let cfg = from_lookup(lookup(&[
            ("TOKEND_ON_CONFLICT", "replace"),
            ("TOKEND_DEFAULT_TTL", "3600"),
            ("TOKEND_MAX_TTL", "86400"),
            ("TOKEND_LOCK_TIMEOUT_MS", "250"),
            ("TOKEND_RETENTION", "0"),
            ("TOKEND_STORE", "memory"),
        ]))
        .unwrap();
        assert_eq!(cfg.issuance.on_conflict, ConflictPolicy::Replace);
        assert_eq!(cfg.issuance.default_ttl, Some(Duration::from_secs(3600)));
        assert_eq!(cfg.issuance.max_ttl, Some(Duration::from_secs(86400)));
        assert_eq!(cfg.locks.timeout, Duration::from_millis(250));
        assert_eq!(cfg.retention, None);
        assert_eq!(cfg.store, StoreBackend::Memory);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(from_lookup(lookup(&[("TOKEND_PORT", "eighty")])).is_err());
        assert!(from_lookup(lookup(&[("TOKEND_ON_CONFLICT", "multi")])).is_err());
        assert!(from_lookup(lookup(&[("TOKEND_STORE", "redis")])).is_err());
        assert!(from_lookup(lookup(&[("TOKEND_LOG_FORMAT", "xml")])).is_err());
    }

    #[test]
    fn test_production_requires_admin_key() {
        assert!(from_lookup(lookup(&[("TOKEND_ENV", "production")])).is_err());
        let cfg = from_lookup(lookup(&[
            ("TOKEND_ENV", "production"),
            ("TOKEND_ADMIN_KEY", "s3cret"),
        ]))
        .unwrap();
        assert!(cfg.production);
        assert_eq!(cfg.admin_key.as_deref(), Some("s3cret"));
    }
}
