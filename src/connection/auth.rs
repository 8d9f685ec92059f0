use super::dsn::Endpoint;
use crate::core::AuthError;
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Source of short-lived credentials.
///
/// Implementations are asked for a new token on every connection attempt;
/// nothing here caches or refreshes tokens.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn generate_token(
        &self,
        endpoint: &Endpoint,
        identity: &str,
    ) -> Result<String, AuthError>;
}

/// Fixed secret, for password-authenticated databases and tests.
#[derive(Clone)]
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl fmt::Debug for StaticTokenProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticTokenProvider")
            .field("token", &"***")
            .finish()
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn generate_token(&self, _endpoint: &Endpoint, _identity: &str) -> Result<String, AuthError> {
        Ok(self.token.clone())
    }
}

/// Generates IAM tokens by invoking the AWS CLI.
///
/// The admin identity uses `generate-db-connect-admin-auth-token`, every
/// other identity `generate-db-connect-auth-token`.
#[derive(Debug, Clone)]
pub struct CommandTokenProvider {
    program: String,
    region: Option<String>,
    expires_in: Duration,
}

impl Default for CommandTokenProvider {
    fn default() -> Self {
        Self::aws_cli()
    }
}

impl CommandTokenProvider {
    const ADMIN_IDENTITY: &'static str = "admin";

    pub fn aws_cli() -> Self {
        Self {
            program: "aws".to_string(),
            region: None,
            expires_in: Duration::from_secs(900),
        }
    }

    /// Set the executable to run
    pub fn program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Set the region, overriding the endpoint's `region` parameter
    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Set token lifetime
    pub fn expires_in(mut self, expires_in: Duration) -> Self {
        self.expires_in = expires_in;
        self
    }

    pub fn args(&self, endpoint: &Endpoint, identity: &str) -> Result<Vec<String>, AuthError> {
        let region = self
            .region
            .clone()
            .or_else(|| endpoint.region())
            .ok_or_else(|| AuthError::MissingRegion(endpoint.host().to_string()))?;

        let action = if identity == Self::ADMIN_IDENTITY {
            "generate-db-connect-admin-auth-token"
        } else {
            "generate-db-connect-auth-token"
        };

        Ok(vec![
            "dsql".to_string(),
            action.to_string(),
            "--hostname".to_string(),
            endpoint.host().to_string(),
            "--region".to_string(),
            region,
            "--expires-in".to_string(),
            self.expires_in.as_secs().to_string(),
        ])
    }
}

#[async_trait]
impl TokenProvider for CommandTokenProvider {
    async fn generate_token(&self, endpoint: &Endpoint, identity: &str) -> Result<String, AuthError> {
        let args = self.args(endpoint, identity)?;
        debug!(program = %self.program, host = endpoint.host(), identity, "requesting auth token");

        let output = Command::new(&self.program)
            .args(&args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| AuthError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let failure = |message: String| AuthError::Generation {
            identity: identity.to_string(),
            host: endpoint.host().to_string(),
            message,
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(failure(format!("{} ({})", stderr, output.status)));
        }

        let token = String::from_utf8(output.stdout)
            .map_err(|_| failure("token is not valid UTF-8".to_string()))?
            .trim()
            .to_string();

        if token.is_empty() {
            return Err(failure("token command printed nothing".to_string()));
        }

        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> Endpoint {
        Endpoint::parse("dsql://admin@cluster.example/postgres?region=eu-west-1").unwrap()
    }

    #[tokio::test]
    async fn test_static_provider_returns_token() {
        let provider = StaticTokenProvider::new("secret");
        let token = provider.generate_token(&endpoint(), "admin").await.unwrap();
        assert_eq!(token, "secret");
        assert!(!format!("{provider:?}").contains("secret"));
    }

    #[test]
    fn test_admin_identity_uses_admin_action() {
        let provider = CommandTokenProvider::aws_cli();
        let args = provider.args(&endpoint(), "admin").unwrap();
        assert_eq!(args[1], "generate-db-connect-admin-auth-token");
        assert!(args.windows(2).any(|w| w[0] == "--hostname" && w[1] == "cluster.example"));
        assert!(args.windows(2).any(|w| w[0] == "--region" && w[1] == "eu-west-1"));
        assert!(args.windows(2).any(|w| w[0] == "--expires-in" && w[1] == "900"));
    }

    #[test]
    fn test_other_identity_uses_plain_action() {
        let provider = CommandTokenProvider::aws_cli().region("us-east-2");
        let args = provider.args(&endpoint(), "migrator").unwrap();
        assert_eq!(args[1], "generate-db-connect-auth-token");
        assert!(args.windows(2).any(|w| w[0] == "--region" && w[1] == "us-east-2"));
    }

    #[test]
    fn test_missing_region_is_an_error() {
        let endpoint = Endpoint::parse("dsql://admin@cluster.example/postgres").unwrap();
        let err = CommandTokenProvider::aws_cli().args(&endpoint, "admin").unwrap_err();
        assert!(matches!(err, AuthError::MissingRegion(_)));
    }

    #[tokio::test]
    async fn test_missing_program_reports_spawn_failure() {
        let provider = CommandTokenProvider::aws_cli().program("occmigrate-no-such-binary");
        let err = provider.generate_token(&endpoint(), "admin").await.unwrap_err();
        assert!(matches!(err, AuthError::Spawn { .. }));
    }
}
