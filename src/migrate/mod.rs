// ============================================================================
// Migration Orchestration
// ============================================================================
//
// connect (fresh token) -> bootstrap ledger -> run pending migrations
//
// The whole sequence runs under one deadline. When it expires the run's
// cancellation token fires, which interrupts any retry backoff in flight.
// The pool opened for a run is closed after the deadline resolves, so an
// expired run still releases its connections.
//
// ============================================================================

pub mod goose;

pub use goose::{GooseRunner, MigrationScript, load_dir, parse_script};

use crate::connection::Connector;
use crate::connection::auth::TokenProvider;
use crate::connection::config::MigrateConfig;
use crate::core::{MigrateError, Result};
use crate::ledger::{BootstrapReport, LedgerTable, PgLedger, VersionTableBootstrapper};
use crate::retry::RetryExecutor;
use async_trait::async_trait;
use serde::Serialize;
use sqlx::PgPool;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Everything a runner needs for one pass.
pub struct MigrationContext<'a> {
    pub pool: &'a PgPool,
    pub table: &'a LedgerTable,
    pub dir: &'a Path,
    pub executor: &'a RetryExecutor,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedMigration {
    pub version: i64,
    pub name: String,
}

/// Applies versioned migrations once the ledger is in place.
#[async_trait]
pub trait MigrationRunner: Send + Sync {
    /// Latest applied version, `0` for a fresh ledger.
    async fn current_version(&self, ctx: &MigrationContext<'_>) -> Result<i64>;

    /// Apply every pending migration, returning what was applied.
    async fn up(&self, ctx: &MigrationContext<'_>) -> Result<Vec<AppliedMigration>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    pub from_version: i64,
    pub to_version: i64,
    pub applied: Vec<AppliedMigration>,
    pub bootstrap: BootstrapReport,
}

/// Run `fut` until it finishes, `timeout` elapses, or `cancel` fires.
///
/// On expiry `cancel` is triggered before returning, so work sharing the
/// token stops waiting.
pub async fn with_deadline<T, F>(timeout: Duration, cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(MigrateError::Cancelled),
        result = fut => result,
        _ = tokio::time::sleep(timeout) => {
            cancel.cancel();
            warn!(timeout_ms = timeout.as_millis() as u64, "migration deadline exceeded");
            Err(MigrateError::Timeout(timeout))
        }
    }
}

/// Run `work` on the pool produced by `open`, bounded like [`with_deadline`].
///
/// The pool is closed once the deadline resolves, whether the work finished,
/// failed, timed out, or was cancelled.
async fn with_scoped_pool<T, O, W, Fut>(
    timeout: Duration,
    cancel: &CancellationToken,
    open: O,
    work: W,
) -> Result<T>
where
    O: Future<Output = Result<PgPool>>,
    W: FnOnce(PgPool) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let slot = OnceCell::new();
    let result = with_deadline(timeout, cancel, async {
        let pool = slot.get_or_try_init(|| open).await?.clone();
        work(pool).await
    })
    .await;

    if let Some(pool) = slot.get() {
        pool.close().await;
    }
    result
}

pub struct Migrator<R = GooseRunner> {
    config: MigrateConfig,
    connector: Connector,
    table: LedgerTable,
    runner: R,
}

impl Migrator<GooseRunner> {
    pub fn new(config: MigrateConfig, tokens: Arc<dyn TokenProvider>) -> Result<Self> {
        Self::with_runner(config, tokens, GooseRunner::new())
    }
}

impl<R: MigrationRunner> Migrator<R> {
    pub fn with_runner(
        config: MigrateConfig,
        tokens: Arc<dyn TokenProvider>,
        runner: R,
    ) -> Result<Self> {
        config.validate()?;
        let connector = Connector::new(&config, tokens)?;
        let table = config.table()?;

        Ok(Self {
            config,
            connector,
            table,
            runner,
        })
    }

    pub fn config(&self) -> &MigrateConfig {
        &self.config
    }

    pub fn connector(&self) -> &Connector {
        &self.connector
    }

    fn executor(&self, cancel: &CancellationToken) -> RetryExecutor {
        RetryExecutor::new(self.config.retry.clone()).with_cancellation(cancel.clone())
    }

    async fn bounded<T, F, Fut>(&self, cancel: &CancellationToken, work: F) -> Result<T>
    where
        F: FnOnce(PgPool, RetryExecutor) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let run = cancel.child_token();
        let executor = self.executor(&run);
        with_scoped_pool(
            self.config.timeout_duration(),
            &run,
            self.connector.connect(),
            |pool| work(pool, executor),
        )
        .await
    }

    /// Only ensure the ledger table and its sentinel row.
    pub async fn bootstrap(&self) -> Result<BootstrapReport> {
        self.bounded(&CancellationToken::new(), |pool, executor| self.bootstrap_with(pool, executor))
            .await
    }

    pub async fn current_version(&self) -> Result<i64> {
        self.bounded(&CancellationToken::new(), |pool, executor| self.version_with(pool, executor))
            .await
    }

    pub async fn run(&self) -> Result<MigrationReport> {
        self.run_until(CancellationToken::new()).await
    }

    /// Full run, also stopping when `cancel` fires.
    pub async fn run_until(&self, cancel: CancellationToken) -> Result<MigrationReport> {
        let report = self
            .bounded(&cancel, |pool, executor| self.migrate(pool, executor))
            .await?;

        info!(
            from = report.from_version,
            to = report.to_version,
            applied = report.applied.len(),
            "migrations complete"
        );
        Ok(report)
    }

    async fn bootstrap_with(&self, pool: PgPool, executor: RetryExecutor) -> Result<BootstrapReport> {
        let ledger = PgLedger::new(pool, self.table.clone());
        Ok(VersionTableBootstrapper::with_executor(executor)
            .ensure(&ledger)
            .await?)
    }

    async fn version_with(&self, pool: PgPool, executor: RetryExecutor) -> Result<i64> {
        self.runner
            .current_version(&self.context(&pool, &executor))
            .await
    }

    async fn migrate(&self, pool: PgPool, executor: RetryExecutor) -> Result<MigrationReport> {
        let ledger = PgLedger::new(pool.clone(), self.table.clone());
        let bootstrap = VersionTableBootstrapper::with_executor(executor.clone())
            .ensure(&ledger)
            .await?;

        let ctx = self.context(&pool, &executor);
        let from_version = self.runner.current_version(&ctx).await?;
        let applied = self.runner.up(&ctx).await?;
        let to_version = self.runner.current_version(&ctx).await?;

        Ok(MigrationReport {
            from_version,
            to_version,
            applied,
            bootstrap,
        })
    }

    fn context<'a>(&'a self, pool: &'a PgPool, executor: &'a RetryExecutor) -> MigrationContext<'a> {
        MigrationContext {
            pool,
            table: &self.table,
            dir: &self.config.migrations_dir,
            executor,
        }
    }
}
