use super::{LedgerBackend, LedgerTable, VersionRow};
use crate::core::DbError;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use sqlx::PgPool;

/// Ledger stored in a PostgreSQL-compatible database.
///
/// DDL goes through the simple query protocol (`raw_sql`), which the
/// backend accepts for statements that cannot be prepared.
#[derive(Debug, Clone)]
pub struct PgLedger {
    pool: PgPool,
    table: LedgerTable,
}

impl PgLedger {
    pub fn new(pool: PgPool, table: LedgerTable) -> Self {
        Self { pool, table }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl LedgerBackend for PgLedger {
    fn table(&self) -> &LedgerTable {
        &self.table
    }

    async fn create_table_if_not_exists(&self) -> Result<(), DbError> {
        let sql = self.table.create_sql();
        sqlx::raw_sql(&sql).execute(&self.pool).await?;
        Ok(())
    }

    async fn has_rows(&self) -> Result<bool, DbError> {
        let sql = self.table.exists_sql();
        let (exists,): (bool,) = sqlx::query_as(&sql).fetch_one(&self.pool).await?;
        Ok(exists)
    }

    async fn insert_sentinel(&self) -> Result<bool, DbError> {
        let sql = self.table.insert_sentinel_sql();
        let result = sqlx::query(&sql).execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn rows(&self) -> Result<Vec<VersionRow>, DbError> {
        let sql = self.table.rows_sql();
        let rows: Vec<(i64, i64, bool, Option<NaiveDateTime>)> =
            sqlx::query_as(&sql).fetch_all(&self.pool).await?;

        Ok(rows
            .into_iter()
            .map(|(id, version_id, is_applied, tstamp)| VersionRow {
                id,
                version_id,
                is_applied,
                tstamp,
            })
            .collect())
    }
}
