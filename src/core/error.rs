use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// SQLSTATE raised when a transaction loses an optimistic-concurrency race on row data.
pub const SQLSTATE_OCC_DATA: &str = "OC000";
/// SQLSTATE raised when a transaction loses an optimistic-concurrency race on the catalog.
pub const SQLSTATE_OCC_SCHEMA: &str = "OC001";
/// Standard PostgreSQL `serialization_failure`.
pub const SQLSTATE_SERIALIZATION_FAILURE: &str = "40001";
/// Standard PostgreSQL `unique_violation`.
pub const SQLSTATE_UNIQUE_VIOLATION: &str = "23505";
/// Standard PostgreSQL `duplicate_table`.
pub const SQLSTATE_DUPLICATE_TABLE: &str = "42P07";
/// Standard PostgreSQL `undefined_table`.
pub const SQLSTATE_UNDEFINED_TABLE: &str = "42P01";

/// Error reported by a database backend.
///
/// `Sql` keeps the structured SQLSTATE so that classifiers never have to
/// fall back to message matching when the server supplies a code.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DbError {
    #[error("Database error [{code}]: {message}")]
    Sql { code: String, message: String },

    #[error("Database error: {0}")]
    Other(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Decode error: {0}")]
    Decode(String),
}

impl DbError {
    pub fn sql(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Sql {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Returns the SQLSTATE code when the backend reported one.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Sql { code, .. } => Some(code.as_str()),
            _ => None,
        }
    }

    pub fn is_unique_violation(&self) -> bool {
        self.code() == Some(SQLSTATE_UNIQUE_VIOLATION)
    }

    /// Catalog collision raised by racing `CREATE ... IF NOT EXISTS` on
    /// lock-based backends: `42P07`, or `23505` on a system catalog index.
    pub fn is_duplicate_object(&self) -> bool {
        matches!(
            self.code(),
            Some(SQLSTATE_DUPLICATE_TABLE | SQLSTATE_UNIQUE_VIOLATION)
        )
    }
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) => match db.code() {
                Some(code) => Self::sql(code.into_owned(), db.message()),
                None => Self::Other(db.message().to_string()),
            },
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => Self::Connection(err.to_string()),
            sqlx::Error::RowNotFound
            | sqlx::Error::ColumnNotFound(_)
            | sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::Decode(_) => Self::Decode(err.to_string()),
            _ => Self::Other(err.to_string()),
        }
    }
}

/// Terminal outcome of a [`RetryExecutor`](crate::retry::RetryExecutor) run.
///
/// Transient conflicts never surface individually; only the final state of
/// the loop does.
#[derive(Error, Debug)]
pub enum RetryError<E>
where
    E: std::error::Error + 'static,
{
    /// The operation failed with an error classified as terminal.
    #[error("operation failed after {attempts} attempt(s)")]
    Terminal {
        attempts: u32,
        #[source]
        source: E,
    },

    /// Every attempt ended in a transient conflict.
    #[error("retry limit exceeded after {attempts} attempt(s)")]
    Exhausted {
        attempts: u32,
        #[source]
        source: E,
    },

    /// The caller's cancellation signal fired while waiting to retry.
    #[error("retry cancelled after {attempts} attempt(s)")]
    Cancelled {
        attempts: u32,
        #[source]
        last: Option<E>,
    },
}

impl<E> RetryError<E>
where
    E: std::error::Error + 'static,
{
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Terminal { attempts, .. }
            | Self::Exhausted { attempts, .. }
            | Self::Cancelled { attempts, .. } => *attempts,
        }
    }

    /// The last error observed from the operation, if any ran.
    pub fn last_error(&self) -> Option<&E> {
        match self {
            Self::Terminal { source, .. } | Self::Exhausted { source, .. } => Some(source),
            Self::Cancelled { last, .. } => last.as_ref(),
        }
    }

    pub fn into_last_error(self) -> Option<E> {
        match self {
            Self::Terminal { source, .. } | Self::Exhausted { source, .. } => Some(source),
            Self::Cancelled { last, .. } => last,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

/// Step of the version-ledger bootstrap that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BootstrapStep {
    CreateTable,
    CheckExists,
    InsertSentinel,
}

impl std::fmt::Display for BootstrapStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::CreateTable => "create table",
            Self::CheckExists => "existence check",
            Self::InsertSentinel => "sentinel insert",
        };
        write!(f, "{label}")
    }
}

#[derive(Error, Debug)]
#[error("version ledger bootstrap failed at {step}")]
pub struct BootstrapError {
    pub step: BootstrapStep,
    #[source]
    pub source: RetryError<DbError>,
}

impl BootstrapError {
    pub fn is_cancelled(&self) -> bool {
        self.source.is_cancelled()
    }
}

/// Failure of the credential collaborator. Never retried here.
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("generate auth token for '{identity}' at {host}: {message}")]
    Generation {
        identity: String,
        host: String,
        message: String,
    },

    #[error("no region configured for token generation against {0}")]
    MissingRegion(String),

    #[error("failed to launch token command '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum MigrateError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("open connection: {0}")]
    Connect(#[source] DbError),

    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),

    #[error("read migration ledger: {0}")]
    Ledger(#[source] RetryError<DbError>),

    #[error("apply migration {version} ({name})")]
    Apply {
        version: i64,
        name: String,
        #[source]
        source: RetryError<DbError>,
    },

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("deadline of {0:?} exceeded")]
    Timeout(Duration),

    #[error("migration run cancelled")]
    Cancelled,

    #[error("I/O error on '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, MigrateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_is_only_reported_for_sql_errors() {
        let err = DbError::sql(SQLSTATE_OCC_DATA, "change conflicts with another transaction");
        assert_eq!(err.code(), Some("OC000"));
        assert_eq!(DbError::Other("OC000".into()).code(), None);
        assert_eq!(DbError::Connection("reset".into()).code(), None);
    }

    #[test]
    fn test_unique_violation_detection() {
        assert!(DbError::sql("23505", "duplicate key").is_unique_violation());
        assert!(!DbError::sql("OC000", "conflict").is_unique_violation());
    }

    #[test]
    fn test_duplicate_object_detection() {
        assert!(DbError::sql("42P07", "relation already exists").is_duplicate_object());
        assert!(
            DbError::sql("23505", "duplicate key value violates unique constraint \"pg_type_typname_nsp_index\"")
                .is_duplicate_object()
        );
        assert!(!DbError::sql("OC001", "schema conflict").is_duplicate_object());
        assert!(!DbError::Other("42P07".into()).is_duplicate_object());
    }

    #[test]
    fn test_retry_error_keeps_last_error() {
        let err: RetryError<DbError> = RetryError::Exhausted {
            attempts: 5,
            source: DbError::sql("OC000", "conflict"),
        };
        assert_eq!(err.attempts(), 5);
        assert!(err.is_exhausted());
        assert!(err.to_string().contains("retry limit exceeded"));
        assert_eq!(err.last_error().and_then(DbError::code), Some("OC000"));

        let cancelled: RetryError<DbError> = RetryError::Cancelled {
            attempts: 2,
            last: None,
        };
        assert!(cancelled.is_cancelled());
        assert!(!cancelled.to_string().contains("retry limit exceeded"));
        assert!(cancelled.into_last_error().is_none());
    }

    #[test]
    fn test_bootstrap_error_names_step() {
        let err = BootstrapError {
            step: BootstrapStep::InsertSentinel,
            source: RetryError::Terminal {
                attempts: 1,
                source: DbError::sql("42501", "permission denied"),
            },
        };
        assert_eq!(
            err.to_string(),
            "version ledger bootstrap failed at sentinel insert"
        );
    }
}
