use crate::core::{MigrateError, Result};
use crate::ledger::{DEFAULT_LEDGER_TABLE, LedgerTable};
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const ENV_PREFIX: &str = "OCCMIGRATE_";

/// Migration run configuration
///
/// Built from defaults, then optionally a JSON file, the environment and
/// explicit builder calls, in that order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrateConfig {
    /// Target endpoint (`dsql://`, `postgres://` or `postgresql://`)
    pub endpoint: String,

    /// Identity to authenticate as; falls back to the URI user, then `admin`
    pub identity: Option<String>,

    /// Region used for token generation when the URI has none
    pub region: Option<String>,

    /// Bound for the whole connect, bootstrap and migrate sequence
    pub timeout_ms: u64,

    /// Conflict retry tunables
    pub retry: RetryPolicy,

    /// Maximum number of connections in pool
    pub max_connections: u32,

    /// Connections kept open even when idle
    pub min_connections: u32,

    /// Recycle connections older than this; driver default when unset
    pub max_lifetime_secs: Option<u64>,

    /// Close connections idle for longer than this; driver default when unset
    pub idle_timeout_secs: Option<u64>,

    /// Name of the migration-version ledger table
    pub ledger_table: String,

    /// Directory holding versioned migration scripts
    pub migrations_dir: PathBuf,
}

impl Default for MigrateConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            identity: None,
            region: None,
            timeout_ms: 2 * 60 * 1000,
            retry: RetryPolicy::default(),
            max_connections: 4,
            min_connections: 0,
            max_lifetime_secs: None,
            idle_timeout_secs: None,
            ledger_table: DEFAULT_LEDGER_TABLE.to_string(),
            migrations_dir: PathBuf::from("migrations"),
        }
    }
}

impl MigrateConfig {
    /// Create a new configuration for `endpoint`
    pub fn new(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            ..Self::default()
        }
    }

    /// Load from a JSON file; absent fields keep their defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| MigrateError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw)
            .map_err(|e| MigrateError::Config(format!("parse '{}': {e}", path.display())))
    }

    /// Overlay `OCCMIGRATE_*` variables (and a `.env` file, if present)
    pub fn with_env(self) -> Result<Self> {
        dotenvy::dotenv().ok();
        self.with_env_from(|key| std::env::var(key).ok())
    }

    /// Overlay variables resolved through `lookup`
    pub fn with_env_from<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}")).filter(|v| !v.is_empty());

        if let Some(endpoint) = var("ENDPOINT") {
            self.endpoint = endpoint;
        }
        if let Some(identity) = var("IDENTITY") {
            self.identity = Some(identity);
        }
        if let Some(region) = var("REGION") {
            self.region = Some(region);
        } else if let Some(region) = lookup("AWS_REGION")
            .or_else(|| lookup("AWS_DEFAULT_REGION"))
            .filter(|v| !v.is_empty())
        {
            self.region.get_or_insert(region);
        }
        if let Some(value) = var("TIMEOUT_MS") {
            self.timeout_ms = parse_number("TIMEOUT_MS", &value)?;
        }
        if let Some(value) = var("MAX_ATTEMPTS") {
            self.retry.max_attempts = parse_number("MAX_ATTEMPTS", &value)?;
        }
        if let Some(value) = var("BASE_BACKOFF_MS") {
            self.retry.base_backoff = Duration::from_millis(parse_number("BASE_BACKOFF_MS", &value)?);
        }
        if let Some(value) = var("MAX_CONNECTIONS") {
            self.max_connections = parse_number("MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = var("MIN_CONNECTIONS") {
            self.min_connections = parse_number("MIN_CONNECTIONS", &value)?;
        }
        if let Some(value) = var("MAX_LIFETIME_SECS") {
            self.max_lifetime_secs = Some(parse_number("MAX_LIFETIME_SECS", &value)?);
        }
        if let Some(value) = var("IDLE_TIMEOUT_SECS") {
            self.idle_timeout_secs = Some(parse_number("IDLE_TIMEOUT_SECS", &value)?);
        }
        if let Some(table) = var("TABLE") {
            self.ledger_table = table;
        }
        if let Some(dir) = var("DIR") {
            self.migrations_dir = PathBuf::from(dir);
        }

        Ok(self)
    }

    /// Set the identity
    pub fn identity(mut self, identity: &str) -> Self {
        self.identity = Some(identity.to_string());
        self
    }

    /// Set the region
    pub fn region(mut self, region: &str) -> Self {
        self.region = Some(region.to_string());
        self
    }

    /// Set the overall deadline
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the retry policy
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set maximum connections
    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    /// Set minimum connections
    pub fn min_connections(mut self, min: u32) -> Self {
        self.min_connections = min;
        self
    }

    /// Set maximum connection lifetime
    pub fn max_lifetime(mut self, lifetime: Duration) -> Self {
        self.max_lifetime_secs = Some(lifetime.as_secs());
        self
    }

    /// Set idle timeout
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout_secs = Some(timeout.as_secs());
        self
    }

    /// Set the ledger table
    pub fn ledger_table(mut self, table: &str) -> Self {
        self.ledger_table = table.to_string();
        self
    }

    /// Set the migrations directory
    pub fn migrations_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.migrations_dir = dir.into();
        self
    }

    pub fn timeout_duration(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn max_lifetime_duration(&self) -> Option<Duration> {
        self.max_lifetime_secs.map(Duration::from_secs)
    }

    pub fn idle_timeout_duration(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }

    pub fn table(&self) -> Result<LedgerTable> {
        LedgerTable::new(self.ledger_table.clone())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.endpoint.trim().is_empty() {
            return Err(MigrateError::Config("endpoint cannot be empty".to_string()));
        }

        if self.timeout_ms == 0 {
            return Err(MigrateError::Config("timeout must be > 0".to_string()));
        }

        if self.max_connections == 0 {
            return Err(MigrateError::Config(
                "max_connections must be > 0".to_string(),
            ));
        }

        if self.min_connections > self.max_connections {
            return Err(MigrateError::Config(
                "min_connections must not exceed max_connections".to_string(),
            ));
        }

        self.retry.validate().map_err(MigrateError::Config)?;
        self.table()?;

        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| {
        MigrateError::Config(format!("{ENV_PREFIX}{name} must be a number, got '{value}'"))
    })
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
    fn test_default_config() {
        let config = MigrateConfig::default();
        assert_eq!(config.timeout_duration(), Duration::from_secs(120));
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_backoff, Duration::from_millis(10));
        assert_eq!(config.ledger_table, "goose_db_version");
        assert_eq!(config.identity, None);
    }

    #[test]
    fn test_builder_pattern() {
        let config = MigrateConfig::new("dsql://cluster.example/postgres")
            .identity("migrator")
            .region("us-east-1")
            .timeout(Duration::from_secs(30))
            .retry(RetryPolicy::default().max_attempts(3))
            .ledger_table("app.schema_versions")
            .migrations_dir("db/migrations");

        assert_eq!(config.identity.as_deref(), Some("migrator"));
        assert_eq!(config.timeout_ms, 30_000);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.migrations_dir, PathBuf::from("db/migrations"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overlay() {
        let config = MigrateConfig::default()
            .with_env_from(env(&[
                ("OCCMIGRATE_ENDPOINT", "dsql://cluster.example/postgres"),
                ("OCCMIGRATE_MAX_ATTEMPTS", "7"),
                ("OCCMIGRATE_BASE_BACKOFF_MS", "25"),
                ("OCCMIGRATE_TIMEOUT_MS", "5000"),
                ("AWS_REGION", "ap-southeast-2"),
            ]))
            .unwrap();

        assert_eq!(config.endpoint, "dsql://cluster.example/postgres");
        assert_eq!(config.retry.max_attempts, 7);
        assert_eq!(config.retry.base_backoff, Duration::from_millis(25));
        assert_eq!(config.timeout_ms, 5000);
        assert_eq!(config.region.as_deref(), Some("ap-southeast-2"));
    }

    #[test]
    fn test_pool_tunables_from_env() {
        let config = MigrateConfig::new("postgres://app@localhost/app")
            .with_env_from(env(&[
                ("OCCMIGRATE_MIN_CONNECTIONS", "2"),
                ("OCCMIGRATE_MAX_LIFETIME_SECS", "300"),
                ("OCCMIGRATE_IDLE_TIMEOUT_SECS", "60"),
            ]))
            .unwrap();

        assert_eq!(config.min_connections, 2);
        assert_eq!(config.max_lifetime_duration(), Some(Duration::from_secs(300)));
        assert_eq!(config.idle_timeout_duration(), Some(Duration::from_secs(60)));
        assert!(config.validate().is_ok());

        let defaults = MigrateConfig::default();
        assert_eq!(defaults.min_connections, 0);
        assert_eq!(defaults.max_lifetime_duration(), None);
        assert_eq!(defaults.idle_timeout_duration(), None);
    }

    #[test]
    fn test_env_region_does_not_override_explicit_region() {
        let config = MigrateConfig::default()
            .region("eu-central-1")
            .with_env_from(env(&[("AWS_REGION", "us-west-2")]))
            .unwrap();
        assert_eq!(config.region.as_deref(), Some("eu-central-1"));

        let config = config
            .with_env_from(env(&[("OCCMIGRATE_REGION", "us-west-1")]))
            .unwrap();
        assert_eq!(config.region.as_deref(), Some("us-west-1"));
    }

    #[test]
    fn test_env_rejects_garbage_numbers() {
        let err = MigrateConfig::default()
            .with_env_from(env(&[("OCCMIGRATE_MAX_ATTEMPTS", "lots")]))
            .unwrap_err();
        assert!(err.to_string().contains("OCCMIGRATE_MAX_ATTEMPTS"));
    }

    #[test]
    fn test_from_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("occmigrate.json");
        std::fs::write(
            &path,
            r#"{ "endpoint": "postgres://app@localhost/app", "retry": { "max_attempts": 3 } }"#,
        )
        .unwrap();

        let config = MigrateConfig::from_file(&path).unwrap();
        assert_eq!(config.endpoint, "postgres://app@localhost/app");
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.base_backoff, Duration::from_millis(10));
        assert_eq!(config.max_connections, 4);
    }

    #[test]
    fn test_validate() {
        assert!(MigrateConfig::default().validate().is_err());

        let ok = MigrateConfig::new("postgres://app@localhost/app");
        assert!(ok.validate().is_ok());

        assert!(ok.clone().max_connections(0).validate().is_err());
        assert!(ok.clone().min_connections(5).validate().is_err());
        assert!(
            ok.clone()
                .retry(RetryPolicy::default().base_backoff(Duration::from_millis(u64::MAX)))
                .validate()
                .is_err()
        );
        assert!(ok.clone().timeout(Duration::ZERO).validate().is_err());
        assert!(ok.clone().ledger_table("bad name").validate().is_err());
        assert!(
            ok.clone()
                .retry(RetryPolicy::default().max_attempts(0))
                .validate()
                .is_err()
        );
    }
}
