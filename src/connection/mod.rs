pub mod auth;
pub mod config;
pub mod dsn;

use crate::core::{DbError, MigrateError, Result};
use auth::TokenProvider;
use config::MigrateConfig;
use dsn::Endpoint;
use sqlx::PgPool;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Opens pools against the configured endpoint.
///
/// Token-authenticated endpoints get a freshly generated credential on every
/// `connect`; tokens are never cached here.
#[derive(Clone)]
pub struct Connector {
    endpoint: Endpoint,
    identity: String,
    max_connections: u32,
    min_connections: u32,
    max_lifetime: Option<Duration>,
    idle_timeout: Option<Duration>,
    acquire_timeout: Duration,
    tokens: Arc<dyn TokenProvider>,
}

impl Connector {
    pub fn new(config: &MigrateConfig, tokens: Arc<dyn TokenProvider>) -> Result<Self> {
        let endpoint = Endpoint::parse(&config.endpoint)?;
        let identity = endpoint.resolve_identity(config.identity.as_deref());

        Ok(Self {
            endpoint,
            identity,
            max_connections: config.max_connections.max(1),
            min_connections: config.min_connections,
            max_lifetime: config.max_lifetime_duration(),
            idle_timeout: config.idle_timeout_duration(),
            acquire_timeout: config.timeout_duration(),
            tokens,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Connection string ready for the driver, token included.
    pub async fn connection_url(&self) -> Result<String> {
        let token = if self.endpoint.requires_token() {
            Some(
                self.tokens
                    .generate_token(&self.endpoint, &self.identity)
                    .await?,
            )
        } else {
            None
        };

        let url = self
            .endpoint
            .to_postgres_url(&self.identity, token.as_deref())?;
        Ok(url.to_string())
    }

    /// Pool settings; lifetime and idle limits keep the driver defaults
    /// unless configured.
    pub fn pool_options(&self) -> PgPoolOptions {
        let mut options = PgPoolOptions::new()
            .max_connections(self.max_connections)
            .min_connections(self.min_connections.min(self.max_connections))
            .acquire_timeout(self.acquire_timeout);
        if let Some(lifetime) = self.max_lifetime {
            options = options.max_lifetime(lifetime);
        }
        if let Some(idle) = self.idle_timeout {
            options = options.idle_timeout(idle);
        }
        options
    }

    pub async fn connect(&self) -> Result<PgPool> {
        let url = self.connection_url().await?;
        let options = PgConnectOptions::from_str(&url)
            .map_err(|e| MigrateError::Connect(DbError::from(e)))?;

        debug!(
            endpoint = %self.endpoint.redacted(),
            identity = %self.identity,
            max_connections = self.max_connections,
            "opening connection pool"
        );

        let pool = self
            .pool_options()
            .connect_with(options)
            .await
            .map_err(|e| MigrateError::Connect(DbError::from(e)))?;

        info!(endpoint = %self.endpoint.redacted(), identity = %self.identity, "connected");
        Ok(pool)
    }
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("endpoint", &self.endpoint.redacted())
            .field("identity", &self.identity)
            .field("max_connections", &self.max_connections)
            .finish_non_exhaustive()
    }
}
