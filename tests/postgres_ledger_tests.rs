/// PostgreSQL-backed ledger and migration tests
///
/// Skipped unless TEST_DATABASE_URL (or DATABASE_URL) points at a reachable
/// PostgreSQL-compatible database.
/// Run with: TEST_DATABASE_URL=postgres://... cargo test --test postgres_ledger_tests

use futures::future::join_all;
use occmigrate::{
    LedgerBackend, LedgerTable, MigrateConfig, Migrator, PgLedger, RetryPolicy, SentinelOutcome,
    StaticTokenProvider, VersionTableBootstrapper,
};
use sqlx::{PgPool, postgres::PgPoolOptions};
use std::sync::Arc;
use std::time::Duration;

fn database_url() -> Option<String> {
    std::env::var("TEST_DATABASE_URL")
        .or_else(|_| std::env::var("DATABASE_URL"))
        .ok()
}

async fn maybe_pool() -> Option<PgPool> {
    PgPoolOptions::new()
        .max_connections(8)
        .connect(&database_url()?)
        .await
        .ok()
}

fn unique_name(prefix: &str) -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    format!("{prefix}_{nanos}")
}

async fn drop_table(pool: &PgPool, table: &str) {
    sqlx::raw_sql(&format!("DROP TABLE IF EXISTS {table}"))
        .execute(pool)
        .await
        .expect("drop should succeed");
}

#[tokio::test]
async fn postgres_bootstrap_is_idempotent() {
    let Some(pool) = maybe_pool().await else {
        eprintln!("Skipping postgres_bootstrap_is_idempotent: TEST_DATABASE_URL/DATABASE_URL is not set or database is unreachable.");
        return;
    };

    let table = LedgerTable::new(unique_name("occ_ledger")).unwrap();
    let ledger = PgLedger::new(pool.clone(), table.clone());
    let bootstrapper = VersionTableBootstrapper::new(RetryPolicy::default());

    let first = bootstrapper.ensure(&ledger).await.expect("first bootstrap");
    assert_eq!(first.sentinel, SentinelOutcome::Inserted);

    let second = bootstrapper.ensure(&ledger).await.expect("second bootstrap");
    assert_eq!(second.sentinel, SentinelOutcome::AlreadyPresent);

    let rows = ledger.rows().await.unwrap();
    assert_eq!(rows.len(), 1);
    assert!(rows[0].is_sentinel());

    drop_table(&pool, table.as_str()).await;
}

#[tokio::test]
async fn postgres_concurrent_bootstrap_writes_one_sentinel() {
    let Some(pool) = maybe_pool().await else {
        eprintln!("Skipping postgres_concurrent_bootstrap_writes_one_sentinel: TEST_DATABASE_URL/DATABASE_URL is not set or database is unreachable.");
        return;
    };

    let table = LedgerTable::new(unique_name("occ_ledger")).unwrap();
    let ledger = PgLedger::new(pool.clone(), table.clone());

    let runs = (0..6).map(|_| {
        let ledger = PgLedger::new(pool.clone(), table.clone());
        async move {
            VersionTableBootstrapper::new(RetryPolicy::default())
                .ensure(&ledger)
                .await
        }
    });
    for result in join_all(runs).await {
        result.expect("every participant should succeed");
    }

    let sentinels = ledger
        .rows()
        .await
        .unwrap()
        .into_iter()
        .filter(|row| row.is_sentinel())
        .count();
    assert_eq!(sentinels, 1);

    drop_table(&pool, table.as_str()).await;
}

#[tokio::test]
async fn postgres_migrator_applies_pending_scripts() {
    let (Some(url), Some(pool)) = (database_url(), maybe_pool().await) else {
        eprintln!("Skipping postgres_migrator_applies_pending_scripts: TEST_DATABASE_URL/DATABASE_URL is not set or database is unreachable.");
        return;
    };

    let ledger_table = unique_name("occ_ledger");
    let users = unique_name("occ_users");
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("00001_create_users.sql"),
        format!(
            "-- +goose Up\nCREATE TABLE {users} (id BIGINT PRIMARY KEY, name TEXT);\n\
             -- +goose Down\nDROP TABLE {users};\n"
        ),
    )
    .unwrap();
    std::fs::write(
        dir.path().join("00002_seed_users.sql"),
        format!("-- +goose Up\nINSERT INTO {users} VALUES (1, 'ada');\nINSERT INTO {users} VALUES (2, 'grace');\n"),
    )
    .unwrap();

    let config = MigrateConfig::new(&url)
        .ledger_table(&ledger_table)
        .migrations_dir(dir.path())
        .timeout(Duration::from_secs(30));
    let migrator = Migrator::new(config, Arc::new(StaticTokenProvider::new("unused"))).unwrap();

    let report = migrator.run().await.expect("migrations should run");
    assert_eq!(report.from_version, 0);
    assert_eq!(report.to_version, 2);
    assert_eq!(report.applied.len(), 2);
    assert_eq!(report.bootstrap.sentinel, SentinelOutcome::Inserted);

    let (count,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {users}"))
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 2);

    let again = migrator.run().await.expect("second run should be a no-op");
    assert!(again.applied.is_empty());
    assert_eq!(again.to_version, 2);
    assert_eq!(migrator.current_version().await.unwrap(), 2);

    drop_table(&pool, &users).await;
    drop_table(&pool, &ledger_table).await;
}

#[tokio::test]
async fn postgres_version_of_missing_ledger_is_zero() {
    let Some(url) = database_url() else {
        eprintln!("Skipping postgres_version_of_missing_ledger_is_zero: TEST_DATABASE_URL/DATABASE_URL is not set.");
        return;
    };
    if maybe_pool().await.is_none() {
        eprintln!("Skipping postgres_version_of_missing_ledger_is_zero: database is unreachable.");
        return;
    }

    let config = MigrateConfig::new(&url).ledger_table(&unique_name("occ_missing"));
    let migrator = Migrator::new(config, Arc::new(StaticTokenProvider::new("unused"))).unwrap();
    assert_eq!(migrator.current_version().await.unwrap(), 0);
}

#[tokio::test]
async fn postgres_version_ignores_rolled_back_migrations() {
    let (Some(url), Some(pool)) = (database_url(), maybe_pool().await) else {
        eprintln!("Skipping postgres_version_ignores_rolled_back_migrations: TEST_DATABASE_URL/DATABASE_URL is not set or database is unreachable.");
        return;
    };

    let table = LedgerTable::new(unique_name("occ_ledger")).unwrap();
    let ledger = PgLedger::new(pool.clone(), table.clone());
    VersionTableBootstrapper::new(RetryPolicy::default())
        .ensure(&ledger)
        .await
        .expect("bootstrap");

    // Version 2 applied, then rolled back by goose down.
    for (id, version, applied) in [(10_i64, 1_i64, true), (20, 2, true), (30, 2, false)] {
        sqlx::query(&table.insert_row_sql())
            .bind(id)
            .bind(version)
            .bind(applied)
            .execute(&pool)
            .await
            .unwrap();
    }

    let config = MigrateConfig::new(&url).ledger_table(table.as_str());
    let migrator = Migrator::new(config, Arc::new(StaticTokenProvider::new("unused"))).unwrap();
    assert_eq!(migrator.current_version().await.unwrap(), 1);

    drop_table(&pool, table.as_str()).await;
}
