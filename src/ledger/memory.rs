// ============================================================================
// In-Memory OCC Ledger
// ============================================================================
//
// A ledger that behaves like an optimistic-concurrency backend:
//
// - statements read a snapshot, yield, then validate at commit time
// - a commit that observes a concurrent schema change fails with OC001, or
//   with a catalog collision (23505) in CreateRace::DuplicateType mode
// - a commit that observes a concurrent data change fails with OC000,
//   or with 23505 when the peer wrote the same primary key
//
// Clones share one database, so each clone stands in for an independent
// process connected to the same cluster. Faults can be scripted per
// operation to exercise failure paths.
//
// ============================================================================

use super::{LedgerBackend, LedgerTable, SENTINEL_ID, VersionRow};
use crate::core::DbError;
use crate::core::error::{
    SQLSTATE_OCC_DATA, SQLSTATE_OCC_SCHEMA, SQLSTATE_UNDEFINED_TABLE, SQLSTATE_UNIQUE_VIOLATION,
};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, RwLock};

/// Ledger operations that can carry scripted faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LedgerOp {
    CreateTable,
    HasRows,
    InsertSentinel,
}

/// How a losing concurrent table creation fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CreateRace {
    /// Optimistic backends abort the loser with OC001.
    #[default]
    SchemaConflict,
    /// Lock-based backends (PostgreSQL) report a duplicate catalog key.
    DuplicateType,
}

#[derive(Debug, Default)]
struct LedgerState {
    rows: Option<Vec<VersionRow>>,
    schema_version: u64,
    data_version: u64,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryLedger {
    table: LedgerTable,
    create_race: CreateRace,
    state: Arc<RwLock<LedgerState>>,
    faults: Arc<Mutex<HashMap<LedgerOp, VecDeque<DbError>>>>,
    calls: Arc<Mutex<HashMap<LedgerOp, u64>>>,
    commits: Arc<AtomicU64>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(table: LedgerTable) -> Self {
        Self {
            table,
            ..Self::default()
        }
    }

    /// Select how racing creates fail. Set before cloning handles.
    pub fn with_create_race(mut self, race: CreateRace) -> Self {
        self.create_race = race;
        self
    }

    /// Queue `err` to be returned by the next call of `op`.
    pub async fn fail_next(&self, op: LedgerOp, err: DbError) {
        self.faults.lock().await.entry(op).or_default().push_back(err);
    }

    /// Queue `count` copies of `err` for `op`.
    pub async fn fail_times(&self, op: LedgerOp, err: DbError, count: usize) {
        let mut faults = self.faults.lock().await;
        let queue = faults.entry(op).or_default();
        queue.extend(std::iter::repeat_n(err, count));
    }

    /// Create the table and load `rows` directly, bypassing conflict checks.
    pub async fn seed(&self, rows: Vec<VersionRow>) {
        let mut state = self.state.write().await;
        state.rows = Some(rows);
        state.schema_version += 1;
        state.data_version += 1;
    }

    pub async fn table_exists(&self) -> bool {
        self.state.read().await.rows.is_some()
    }

    /// Number of calls made to `op`, including failed ones.
    pub async fn calls(&self, op: LedgerOp) -> u64 {
        self.calls.lock().await.get(&op).copied().unwrap_or(0)
    }

    /// Number of successful writes across all handles.
    pub fn commits(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }

    async fn enter(&self, op: LedgerOp) -> Result<(), DbError> {
        *self.calls.lock().await.entry(op).or_insert(0) += 1;
        match self.faults.lock().await.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn undefined_table(&self) -> DbError {
        DbError::sql(
            SQLSTATE_UNDEFINED_TABLE,
            format!("relation \"{}\" does not exist", self.table),
        )
    }
}

#[async_trait]
impl LedgerBackend for MemoryLedger {
    fn table(&self) -> &LedgerTable {
        &self.table
    }

    async fn create_table_if_not_exists(&self) -> Result<(), DbError> {
        self.enter(LedgerOp::CreateTable).await?;
        let observed = self.state.read().await.schema_version;

        tokio::task::yield_now().await;

        let mut state = self.state.write().await;
        if state.schema_version != observed {
            return Err(match self.create_race {
                CreateRace::SchemaConflict => DbError::sql(
                    SQLSTATE_OCC_SCHEMA,
                    "schema has been updated by another transaction, please retry: (OC001)",
                ),
                CreateRace::DuplicateType => DbError::sql(
                    SQLSTATE_UNIQUE_VIOLATION,
                    "duplicate key value violates unique constraint \"pg_type_typname_nsp_index\"",
                ),
            });
        }
        if state.rows.is_none() {
            state.rows = Some(Vec::new());
            state.schema_version += 1;
            self.commits.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn has_rows(&self) -> Result<bool, DbError> {
        self.enter(LedgerOp::HasRows).await?;
        let state = self.state.read().await;
        match &state.rows {
            Some(rows) => Ok(!rows.is_empty()),
            None => Err(self.undefined_table()),
        }
    }

    async fn insert_sentinel(&self) -> Result<bool, DbError> {
        self.enter(LedgerOp::InsertSentinel).await?;
        let (observed, empty) = {
            let state = self.state.read().await;
            let rows = state.rows.as_ref().ok_or_else(|| self.undefined_table())?;
            (state.data_version, rows.is_empty())
        };

        if !empty {
            return Ok(false);
        }

        tokio::task::yield_now().await;

        let mut state = self.state.write().await;
        let moved = state.data_version != observed;
        let rows = state.rows.as_mut().ok_or_else(|| self.undefined_table())?;
        if moved {
            if rows.iter().any(|row| row.id == SENTINEL_ID) {
                return Err(DbError::sql(
                    SQLSTATE_UNIQUE_VIOLATION,
                    format!(
                        "duplicate key value violates unique constraint \"{}_pkey\"",
                        self.table
                    ),
                ));
            }
            return Err(DbError::sql(
                SQLSTATE_OCC_DATA,
                "change conflicts with another transaction, please retry: (OC000)",
            ));
        }

        rows.push(VersionRow::sentinel());
        state.data_version += 1;
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    async fn rows(&self) -> Result<Vec<VersionRow>, DbError> {
        let state = self.state.read().await;
        state.rows.clone().ok_or_else(|| self.undefined_table())
    }
}
