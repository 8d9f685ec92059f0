// ============================================================================
// occmigrate Library
// ============================================================================
//
// Schema migrations for PostgreSQL-compatible clusters that use optimistic
// concurrency control and short-lived auth tokens.
//
// - retry:      OCC-aware retry executor with exponential backoff and jitter
// - ledger:     goose-compatible version table and its idempotent bootstrap
// - connection: endpoint rewriting, token generation, pool construction
// - migrate:    goose-format runner and the deadline-bounded orchestration
//
// ============================================================================

pub mod connection;
pub mod core;
pub mod ledger;
pub mod migrate;
pub mod retry;

pub use connection::Connector;
pub use connection::auth::{CommandTokenProvider, StaticTokenProvider, TokenProvider};
pub use connection::config::MigrateConfig;
pub use connection::dsn::Endpoint;
pub use core::{AuthError, BootstrapError, BootstrapStep, DbError, MigrateError, Result, RetryError};
pub use ledger::{
    BootstrapReport, LedgerBackend, LedgerTable, MemoryLedger, PgLedger, SentinelOutcome,
    VersionRow, VersionTableBootstrapper,
};
pub use migrate::{MigrationReport, MigrationRunner, Migrator, with_deadline};
pub use retry::{
    ConflictClass, ConflictClassifier, OccClassifier, RetryExecutor, RetryPolicy, RetryReport,
};
