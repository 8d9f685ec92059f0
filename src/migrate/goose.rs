use super::{AppliedMigration, MigrationContext, MigrationRunner};
use crate::core::error::SQLSTATE_UNDEFINED_TABLE;
use crate::core::{DbError, MigrateError, Result, RetryError};
use crate::ledger::{self, LedgerIdGenerator};
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

lazy_static! {
    static ref SCRIPT_FILE: Regex =
        Regex::new(r"^(\d+)_(.+)\.sql$").expect("script file pattern is valid");
    static ref ANNOTATION: Regex =
        Regex::new(r"^--\s*\+goose\s+(.+?)\s*$").expect("annotation pattern is valid");
}

/// One versioned migration file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationScript {
    pub version: i64,
    pub name: String,
    pub path: PathBuf,
    pub up: Vec<String>,
    /// Parsed so files round-trip with goose. No command here applies it;
    /// rollbacks are done with goose itself.
    pub down: Vec<String>,
    /// `-- +goose NO TRANSACTION` was present. Statements always run one by
    /// one here, so the flag is informational.
    pub no_transaction: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    None,
    Up,
    Down,
}

/// Split a goose-annotated SQL file into its up and down statements.
pub fn parse_script(version: i64, name: &str, path: &Path, source: &str) -> Result<MigrationScript> {
    let invalid = |message: String| {
        MigrateError::Migration(format!("{}: {message}", path.display()))
    };

    let mut script = MigrationScript {
        version,
        name: name.to_string(),
        path: path.to_path_buf(),
        up: Vec::new(),
        down: Vec::new(),
        no_transaction: false,
    };
    let mut section = Section::None;
    let mut in_block = false;
    let mut buffer = String::new();

    fn flush(buffer: &mut String, section: Section, script: &mut MigrationScript) {
        let statement = buffer.trim();
        if !statement.is_empty() {
            let target = match section {
                Section::Down => &mut script.down,
                _ => &mut script.up,
            };
            target.push(statement.to_string());
        }
        buffer.clear();
    }

    for (index, line) in source.lines().enumerate() {
        let lineno = index + 1;
        let trimmed = line.trim();

        if let Some(caps) = ANNOTATION.captures(trimmed) {
            match caps[1].to_ascii_lowercase().as_str() {
                "up" | "down" => {
                    if in_block {
                        return Err(invalid(format!(
                            "line {lineno}: section change inside StatementBegin block"
                        )));
                    }
                    flush(&mut buffer, section, &mut script);
                    section = if caps[1].eq_ignore_ascii_case("up") {
                        Section::Up
                    } else {
                        Section::Down
                    };
                }
                "statementbegin" => {
                    flush(&mut buffer, section, &mut script);
                    in_block = true;
                }
                "statementend" => {
                    if !in_block {
                        return Err(invalid(format!(
                            "line {lineno}: StatementEnd without StatementBegin"
                        )));
                    }
                    flush(&mut buffer, section, &mut script);
                    in_block = false;
                }
                "no transaction" => script.no_transaction = true,
                other => {
                    debug!(path = %path.display(), annotation = other, "ignoring goose annotation");
                }
            }
            continue;
        }

        if section == Section::None {
            if trimmed.is_empty() || trimmed.starts_with("--") {
                continue;
            }
            return Err(invalid(format!(
                "line {lineno}: statement before '-- +goose Up'"
            )));
        }

        if !in_block && buffer.is_empty() && (trimmed.is_empty() || trimmed.starts_with("--")) {
            continue;
        }

        buffer.push_str(line);
        buffer.push('\n');

        if !in_block && trimmed.ends_with(';') {
            flush(&mut buffer, section, &mut script);
        }
    }

    if in_block {
        return Err(invalid("unterminated StatementBegin block".to_string()));
    }
    if section == Section::None {
        return Err(invalid("missing '-- +goose Up' annotation".to_string()));
    }
    flush(&mut buffer, section, &mut script);

    Ok(script)
}

/// Load every `<version>_<name>.sql` file in `dir`, ordered by version.
pub fn load_dir(dir: &Path) -> Result<Vec<MigrationScript>> {
    let io_error = |source: std::io::Error| MigrateError::Io {
        path: dir.to_path_buf(),
        source,
    };

    let mut scripts = BTreeMap::new();
    for entry in std::fs::read_dir(dir).map_err(io_error)? {
        let path = entry.map_err(io_error)?.path();
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(caps) = SCRIPT_FILE.captures(file_name) else {
            continue;
        };

        let version: i64 = caps[1].parse().map_err(|_| {
            MigrateError::Migration(format!("{file_name}: version out of range"))
        })?;
        if version <= 0 {
            return Err(MigrateError::Migration(format!(
                "{file_name}: version must be positive"
            )));
        }

        let source = std::fs::read_to_string(&path).map_err(|source| MigrateError::Io {
            path: path.clone(),
            source,
        })?;
        let script = parse_script(version, &caps[2], &path, &source)?;

        if let Some(existing) = scripts.insert(version, script) {
            return Err(MigrateError::Migration(format!(
                "duplicate migration version {version}: {} and {file_name}",
                existing.path.display()
            )));
        }
    }

    Ok(scripts.into_values().collect())
}

/// Applies goose-format migrations one statement at a time.
///
/// Ledger rows get client-generated ids so that `ORDER BY id DESC` keeps
/// returning the newest version.
#[derive(Debug, Default)]
pub struct GooseRunner {
    ids: LedgerIdGenerator,
}

impl GooseRunner {
    pub fn new() -> Self {
        Self::default()
    }

    async fn apply(&self, ctx: &MigrationContext<'_>, script: &MigrationScript) -> Result<()> {
        let pool = ctx.pool;
        let apply_error = |source: RetryError<DbError>| MigrateError::Apply {
            version: script.version,
            name: script.name.clone(),
            source,
        };

        for (index, statement) in script.up.iter().enumerate() {
            let sql = statement.as_str();
            ctx.executor
                .execute(move || async move {
                    sqlx::raw_sql(sql)
                        .execute(pool)
                        .await
                        .map(|_| ())
                        .map_err(DbError::from)
                })
                .await
                .map_err(apply_error)?;
            debug!(version = script.version, statement = index + 1, "statement applied");
        }

        let id = self.ids.next_id();
        let sql = ctx.table.insert_row_sql();
        let sql = sql.as_str();
        let version = script.version;
        ctx.executor
            .execute(move || async move {
                sqlx::query(sql)
                    .bind(id)
                    .bind(version)
                    .bind(true)
                    .execute(pool)
                    .await
                    .map(|_| ())
                    .map_err(DbError::from)
            })
            .await
            .map_err(apply_error)?;

        Ok(())
    }
}

#[async_trait]
impl MigrationRunner for GooseRunner {
    async fn current_version(&self, ctx: &MigrationContext<'_>) -> Result<i64> {
        let pool = ctx.pool;
        let sql = ctx.table.history_sql();
        let sql = sql.as_str();

        let history = ctx
            .executor
            .execute(move || async move {
                sqlx::query_as::<_, (i64, bool)>(sql)
                    .fetch_all(pool)
                    .await
                    .map_err(DbError::from)
            })
            .await;

        match history {
            Ok(rows) => Ok(ledger::current_version(rows)),
            Err(RetryError::Terminal { source, .. })
                if source.code() == Some(SQLSTATE_UNDEFINED_TABLE) =>
            {
                Ok(0)
            }
            Err(err) => Err(MigrateError::Ledger(err)),
        }
    }

    async fn up(&self, ctx: &MigrationContext<'_>) -> Result<Vec<AppliedMigration>> {
        let scripts = load_dir(ctx.dir)?;
        let mut current = self.current_version(ctx).await?;
        let mut applied = Vec::new();

        for script in &scripts {
            if script.version <= current {
                continue;
            }
            // A concurrent migrator may have advanced the ledger meanwhile.
            current = self.current_version(ctx).await?;
            if script.version <= current {
                debug!(version = script.version, current, "migration applied elsewhere, skipping");
                continue;
            }

            self.apply(ctx, script).await?;
            info!(version = script.version, name = %script.name, "migration applied");
            applied.push(AppliedMigration {
                version: script.version,
                name: script.name.clone(),
            });
            current = script.version;
        }

        Ok(applied)
    }
}
