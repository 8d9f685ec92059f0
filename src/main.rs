use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use occmigrate::connection::auth::{CommandTokenProvider, StaticTokenProvider, TokenProvider};
use occmigrate::connection::config::MigrateConfig;
use occmigrate::migrate::Migrator;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser, Debug)]
#[command(name = "occmigrate", version, about = "Schema migrations for optimistic-concurrency SQL clusters")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// JSON configuration file, applied before environment and flags
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Cluster endpoint (dsql://, postgres:// or postgresql://)
    #[arg(long, global = true)]
    endpoint: Option<String>,

    /// Database identity; defaults to the URI user, then `admin`
    #[arg(long, global = true)]
    identity: Option<String>,

    #[arg(long, global = true)]
    region: Option<String>,

    /// Use a fixed token instead of asking the AWS CLI for one
    #[arg(long, global = true, env = "OCCMIGRATE_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Directory holding `<version>_<name>.sql` scripts
    #[arg(long, global = true)]
    dir: Option<PathBuf>,

    /// Version ledger table
    #[arg(long, global = true)]
    table: Option<String>,

    #[arg(long, global = true)]
    timeout_secs: Option<u64>,

    #[arg(long, global = true)]
    max_attempts: Option<u32>,

    #[arg(long, global = true)]
    base_backoff_ms: Option<u64>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ensure the ledger, then apply every pending migration
    Up,
    /// Only ensure the ledger table and its baseline row
    Bootstrap,
    /// Print the latest applied version
    Version,
}

impl Cli {
    fn load_config(&self) -> Result<MigrateConfig> {
        let config = match &self.config {
            Some(path) => MigrateConfig::from_file(path)
                .with_context(|| format!("failed to load {}", path.display()))?,
            None => MigrateConfig::default(),
        };
        let mut config = config.with_env().context("invalid environment configuration")?;

        if let Some(endpoint) = &self.endpoint {
            config.endpoint = endpoint.clone();
        }
        if let Some(identity) = &self.identity {
            config = config.identity(identity);
        }
        if let Some(region) = &self.region {
            config = config.region(region);
        }
        if let Some(dir) = &self.dir {
            config = config.migrations_dir(dir.clone());
        }
        if let Some(table) = &self.table {
            config = config.ledger_table(table);
        }
        if let Some(secs) = self.timeout_secs {
            config = config.timeout(Duration::from_secs(secs));
        }
        if let Some(max_attempts) = self.max_attempts {
            config.retry.max_attempts = max_attempts;
        }
        if let Some(base_backoff_ms) = self.base_backoff_ms {
            config.retry.base_backoff = Duration::from_millis(base_backoff_ms);
        }

        config.validate().context("invalid configuration")?;
        Ok(config)
    }

    fn token_provider(&self, config: &MigrateConfig) -> Arc<dyn TokenProvider> {
        match &self.token {
            Some(token) => Arc::new(StaticTokenProvider::new(token.clone())),
            None => {
                let provider = CommandTokenProvider::aws_cli();
                match &config.region {
                    Some(region) => Arc::new(provider.region(region.clone())),
                    None => Arc::new(provider),
                }
            }
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = cli.load_config()?;
    let tokens = cli.token_provider(&config);
    let migrator = Migrator::new(config, tokens).context("failed to prepare migrator")?;

    match cli.command {
        Command::Up => {
            let report = migrator.run().await.context("failed to run migrations")?;
            for migration in &report.applied {
                println!("applied {} {}", migration.version, migration.name);
            }
            println!(
                "version {} -> {} ({} applied)",
                report.from_version,
                report.to_version,
                report.applied.len()
            );
        }
        Command::Bootstrap => {
            let report = migrator
                .bootstrap()
                .await
                .context("failed to bootstrap version ledger")?;
            println!("ledger ready ({:?}, {} attempts)", report.sentinel, report.attempts);
        }
        Command::Version => {
            let version = migrator
                .current_version()
                .await
                .context("failed to read current version")?;
            println!("{version}");
        }
    }

    Ok(())
}
