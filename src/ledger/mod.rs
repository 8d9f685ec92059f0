// ============================================================================
// Migration Version Ledger
// ============================================================================
//
// The ledger is the goose-compatible table that records applied migration
// versions. The backend cannot generate sequential identifiers, so:
//
// - the column default derives the id from epoch microseconds
// - rows inserted by this crate carry ids from LedgerIdGenerator
// - the sentinel row (version 0) uses the reserved id 0, so two racing
//   sentinel inserts collide on the primary key instead of duplicating
//
// ============================================================================

pub mod bootstrap;
pub mod memory;
pub mod postgres;

pub use bootstrap::{BootstrapReport, SentinelOutcome, VersionTableBootstrapper};
pub use memory::{CreateRace, LedgerOp, MemoryLedger};
pub use postgres::PgLedger;

use crate::core::{DbError, MigrateError, Result};
use async_trait::async_trait;
use chrono::{NaiveDateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

pub const DEFAULT_LEDGER_TABLE: &str = "goose_db_version";

/// Reserved primary key of the baseline row.
pub const SENTINEL_ID: i64 = 0;
pub const SENTINEL_VERSION: i64 = 0;

lazy_static! {
    static ref TABLE_NAME: Regex =
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}(\.[A-Za-z_][A-Za-z0-9_]{0,62})?$")
            .expect("ledger table pattern is valid");
}

/// One entry of the migration-version ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionRow {
    pub id: i64,
    pub version_id: i64,
    pub is_applied: bool,
    pub tstamp: Option<NaiveDateTime>,
}

impl VersionRow {
    pub fn sentinel() -> Self {
        Self {
            id: SENTINEL_ID,
            version_id: SENTINEL_VERSION,
            is_applied: true,
            tstamp: Some(Utc::now().naive_utc()),
        }
    }

    pub fn applied(id: i64, version_id: i64) -> Self {
        Self {
            id,
            version_id,
            is_applied: true,
            tstamp: Some(Utc::now().naive_utc()),
        }
    }

    pub fn is_sentinel(&self) -> bool {
        self.version_id == SENTINEL_VERSION && self.is_applied
    }
}

/// Validated ledger table name and the SQL issued against it.
///
/// Only plain or schema-qualified identifiers are accepted, so the name can
/// be spliced into statements without quoting.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LedgerTable(String);

impl LedgerTable {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if !TABLE_NAME.is_match(&name) {
            return Err(MigrateError::Config(format!(
                "invalid ledger table name '{name}'"
            )));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn create_sql(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\
             id BIGINT PRIMARY KEY DEFAULT (EXTRACT(EPOCH FROM now()) * 1000000)::BIGINT, \
             version_id BIGINT NOT NULL, \
             is_applied BOOLEAN NOT NULL, \
             tstamp TIMESTAMP DEFAULT now())",
            self.0
        )
    }

    pub fn exists_sql(&self) -> String {
        format!("SELECT EXISTS (SELECT 1 FROM {})", self.0)
    }

    /// Inserts the sentinel only when the ledger is still empty.
    pub fn insert_sentinel_sql(&self) -> String {
        format!(
            "INSERT INTO {table} (id, version_id, is_applied) \
             SELECT {SENTINEL_ID}, {SENTINEL_VERSION}, TRUE \
             WHERE NOT EXISTS (SELECT 1 FROM {table})",
            table = self.0
        )
    }

    pub fn insert_row_sql(&self) -> String {
        format!(
            "INSERT INTO {} (id, version_id, is_applied) VALUES ($1, $2, $3)",
            self.0
        )
    }

    /// Full history, newest first, for [`current_version`].
    pub fn history_sql(&self) -> String {
        format!(
            "SELECT version_id, is_applied FROM {} ORDER BY id DESC",
            self.0
        )
    }

    pub fn rows_sql(&self) -> String {
        format!(
            "SELECT id, version_id, is_applied, tstamp FROM {} ORDER BY id",
            self.0
        )
    }
}

impl Default for LedgerTable {
    fn default() -> Self {
        Self(DEFAULT_LEDGER_TABLE.to_string())
    }
}

impl fmt::Display for LedgerTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Current version from `(version_id, is_applied)` pairs, newest first.
///
/// A version's newest row decides its state: a later rollback hides every
/// earlier apply of the same version. Empty history is version 0.
pub fn current_version<I>(newest_first: I) -> i64
where
    I: IntoIterator<Item = (i64, bool)>,
{
    let mut rolled_back = HashSet::new();
    for (version, is_applied) in newest_first {
        if rolled_back.contains(&version) {
            continue;
        }
        if is_applied {
            return version;
        }
        rolled_back.insert(version);
    }
    SENTINEL_VERSION
}

/// Produces ledger ids from epoch microseconds.
///
/// Ids are strictly increasing within one generator even when the clock
/// stalls or steps backwards.
#[derive(Debug, Default)]
pub struct LedgerIdGenerator {
    last: AtomicI64,
}

impl LedgerIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> i64 {
        let now = Utc::now().timestamp_micros();
        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let candidate = now.max(prev + 1);
            match self
                .last
                .compare_exchange_weak(prev, candidate, Ordering::SeqCst, Ordering::Relaxed)
            {
                Ok(_) => return candidate,
                Err(actual) => prev = actual,
            }
        }
    }
}

/// Storage operations the bootstrap needs from a ledger.
///
/// Every method is a single statement. A failed call must leave no visible
/// effect, which is what makes it safe to re-run after a conflict.
#[async_trait]
pub trait LedgerBackend: Send + Sync {
    fn table(&self) -> &LedgerTable;

    /// Conditional creation; succeeds when the table already exists.
    async fn create_table_if_not_exists(&self) -> std::result::Result<(), DbError>;

    async fn has_rows(&self) -> std::result::Result<bool, DbError>;

    /// Inserts the sentinel row unless the ledger already holds any row.
    /// Returns whether a row was written.
    async fn insert_sentinel(&self) -> std::result::Result<bool, DbError>;

    async fn rows(&self) -> std::result::Result<Vec<VersionRow>, DbError>;
}
