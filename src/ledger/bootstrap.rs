use super::LedgerBackend;
use crate::core::{BootstrapError, BootstrapStep, DbError};
use crate::retry::{ConflictClassifier, OccClassifier, RetryExecutor, RetryPolicy};
use std::future::Future;
use tracing::{debug, info};

/// How the sentinel requirement was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SentinelOutcome {
    /// The ledger already held rows; nothing was written.
    AlreadyPresent,
    /// This call inserted the sentinel.
    Inserted,
    /// A peer inserted it concurrently; the conflict was absorbed.
    BenignDuplicate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapReport {
    pub sentinel: SentinelOutcome,
    /// Statement invocations across all steps, retries included.
    pub attempts: u32,
}

/// Ensures the version ledger exists and holds its baseline row.
///
/// Safe to run redundantly and from many processes at once: every step is
/// idempotent on its own and retried individually, instead of wrapping the
/// three statements in one transaction that a stampede would keep aborting.
#[derive(Debug, Clone)]
pub struct VersionTableBootstrapper<C = OccClassifier> {
    executor: RetryExecutor<C>,
}

impl VersionTableBootstrapper<OccClassifier> {
    pub fn new(policy: RetryPolicy) -> Self {
        Self::with_executor(RetryExecutor::new(policy))
    }
}

impl Default for VersionTableBootstrapper<OccClassifier> {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl<C> VersionTableBootstrapper<C>
where
    C: ConflictClassifier<DbError>,
{
    pub fn with_executor(executor: RetryExecutor<C>) -> Self {
        Self { executor }
    }

    pub fn executor(&self) -> &RetryExecutor<C> {
        &self.executor
    }

    pub async fn ensure<L>(&self, ledger: &L) -> Result<BootstrapReport, BootstrapError>
    where
        L: LedgerBackend + ?Sized,
    {
        let table = ledger.table().as_str().to_string();

        let ((), mut attempts) = self
            .run_step(BootstrapStep::CreateTable, move || self.create_table(ledger))
            .await?;

        let (populated, used) = self
            .run_step(BootstrapStep::CheckExists, move || ledger.has_rows())
            .await?;
        attempts += used;

        let sentinel = if populated {
            SentinelOutcome::AlreadyPresent
        } else {
            let (outcome, used) = self
                .run_step(BootstrapStep::InsertSentinel, move || {
                    self.insert_sentinel(ledger)
                })
                .await?;
            attempts += used;
            outcome
        };

        info!(table = %table, sentinel = ?sentinel, attempts, "version ledger ensured");
        Ok(BootstrapReport { sentinel, attempts })
    }

    /// One conditional create. Lock-based backends reject a racing
    /// `CREATE TABLE IF NOT EXISTS` with a catalog collision instead of a
    /// notice; once the table is visible the step is done.
    async fn create_table<L>(&self, ledger: &L) -> Result<(), DbError>
    where
        L: LedgerBackend + ?Sized,
    {
        let err = match ledger.create_table_if_not_exists().await {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };

        if !err.is_duplicate_object() {
            return Err(err);
        }

        match ledger.has_rows().await {
            Ok(_) => {
                debug!(table = %ledger.table(), error = %err, "ledger table created by a concurrent peer");
                Ok(())
            }
            Err(recheck) if self.executor.classifier().classify(&recheck).is_transient() => Err(recheck),
            Err(_) => Err(err),
        }
    }

    /// One sentinel attempt. A conflict or key collision is re-checked
    /// against the ledger: if a peer's row is now visible the step is done.
    async fn insert_sentinel<L>(&self, ledger: &L) -> Result<SentinelOutcome, DbError>
    where
        L: LedgerBackend + ?Sized,
    {
        let err = match ledger.insert_sentinel().await {
            Ok(true) => return Ok(SentinelOutcome::Inserted),
            Ok(false) => {
                debug!(table = %ledger.table(), "ledger populated between check and insert");
                return Ok(SentinelOutcome::BenignDuplicate);
            }
            Err(err) => err,
        };

        let collided =
            err.is_unique_violation() || self.executor.classifier().classify(&err).is_transient();
        if !collided {
            return Err(err);
        }

        if ledger.has_rows().await? {
            debug!(table = %ledger.table(), error = %err, "sentinel inserted by a concurrent peer");
            return Ok(SentinelOutcome::BenignDuplicate);
        }

        Err(err)
    }

    async fn run_step<T, F, Fut>(
        &self,
        step: BootstrapStep,
        operation: F,
    ) -> Result<(T, u32), BootstrapError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DbError>>,
    {
        let (result, report) = self.executor.execute_with_report(operation).await;
        match result {
            Ok(value) => {
                debug!(step = %step, attempts = report.attempts, "bootstrap step complete");
                Ok((value, report.attempts))
            }
            Err(source) => Err(BootstrapError { step, source }),
        }
    }
}
