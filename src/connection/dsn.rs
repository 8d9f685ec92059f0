use crate::core::{MigrateError, Result};
use url::Url;

/// Identity used when neither the caller nor the URI names one.
pub const DEFAULT_IDENTITY: &str = "admin";

const DSQL_SCHEME: &str = "dsql";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointScheme {
    /// Token-authenticated cluster; TLS is mandatory.
    Dsql,
    /// Plain PostgreSQL connection string.
    Postgres,
}

/// Parsed target address.
///
/// Format: `dsql://[user@]host[:port]/database?region=us-east-1` or any
/// `postgres://` / `postgresql://` connection string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    scheme: EndpointScheme,
    url: Url,
}

impl Endpoint {
    pub fn parse(uri: &str) -> Result<Self> {
        let uri = uri.trim();
        let (scheme, rest) = if let Some(rest) = uri.strip_prefix("dsql://") {
            (EndpointScheme::Dsql, rest)
        } else if let Some(rest) = uri.strip_prefix("postgresql://") {
            (EndpointScheme::Postgres, rest)
        } else if let Some(rest) = uri.strip_prefix("postgres://") {
            (EndpointScheme::Postgres, rest)
        } else {
            return Err(MigrateError::Config(format!(
                "endpoint must start with '{DSQL_SCHEME}://', 'postgres://' or 'postgresql://'"
            )));
        };

        let url = Url::parse(&format!("postgres://{rest}"))
            .map_err(|e| MigrateError::Config(format!("parse endpoint: {e}")))?;

        if url.host_str().is_none_or(str::is_empty) {
            return Err(MigrateError::Config("endpoint has no host".to_string()));
        }

        Ok(Self { scheme, url })
    }

    pub fn scheme(&self) -> EndpointScheme {
        self.scheme
    }

    pub fn requires_token(&self) -> bool {
        self.scheme == EndpointScheme::Dsql
    }

    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    pub fn port(&self) -> Option<u16> {
        self.url.port()
    }

    /// Database name, `postgres` when the URI omits it.
    pub fn database(&self) -> &str {
        match self.url.path().trim_start_matches('/') {
            "" => "postgres",
            name => name,
        }
    }

    pub fn user(&self) -> Option<&str> {
        match self.url.username() {
            "" => None,
            user => Some(user),
        }
    }

    pub fn region(&self) -> Option<String> {
        self.url
            .query_pairs()
            .find(|(key, _)| key == "region")
            .map(|(_, value)| value.into_owned())
    }

    /// Identity precedence: explicit override, URI user, then `admin`.
    pub fn resolve_identity(&self, identity: Option<&str>) -> String {
        identity
            .filter(|name| !name.is_empty())
            .or_else(|| self.user())
            .unwrap_or(DEFAULT_IDENTITY)
            .to_string()
    }

    /// Standard connection string carrying `identity` and, when given, `token`
    /// as the password.
    ///
    /// For token-authenticated endpoints `region` is dropped (PostgreSQL does
    /// not understand it) and `sslmode=require` is forced.
    pub fn to_postgres_url(&self, identity: &str, token: Option<&str>) -> Result<Url> {
        let mut url = self.url.clone();
        url.set_username(identity)
            .map_err(|_| MigrateError::Config("endpoint cannot carry credentials".to_string()))?;
        if let Some(token) = token {
            url.set_password(Some(token))
                .map_err(|_| MigrateError::Config("endpoint cannot carry credentials".to_string()))?;
        }

        if self.requires_token() {
            let retained: Vec<(String, String)> = self
                .url
                .query_pairs()
                .filter(|(key, _)| key != "region" && key != "sslmode")
                .map(|(key, value)| (key.into_owned(), value.into_owned()))
                .collect();

            url.query_pairs_mut()
                .clear()
                .extend_pairs(retained)
                .append_pair("sslmode", "require");
        }

        Ok(url)
    }

    /// Loggable form: no password, no token.
    pub fn redacted(&self) -> String {
        let mut url = self.url.clone();
        let _ = url.set_password(None);
        match self.scheme {
            EndpointScheme::Dsql => url.as_str().replacen("postgres://", "dsql://", 1),
            EndpointScheme::Postgres => url.to_string(),
        }
    }
}
