mod migrate;
mod seed;

pub use migrate::MigrateCommand;
pub use seed::SeedCommand;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dbkit_core::cancel;
use dbkit_core::config::DbkitConfig;
use dbkit_core::registry::{DatabaseRegistry, SourceRegistry};
use dbkit_runtime::drivers;
use tokio_util::sync::CancellationToken;

/// dbkit - database migrations and seeds
#[derive(Parser)]
#[command(name = "dbkit")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path.
    #[arg(short, long, default_value = "dbkit.toml", global = true)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

/// CLI commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Manage database migrations.
    Migrate(MigrateCommand),

    /// Run or create seeds.
    Seed(SeedCommand),
}

impl Cli {
    /// Execute the CLI command.
    pub async fn execute(self) -> Result<()> {
        tracing_subscriber::fmt()
            .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".to_string()))
            .with_writer(std::io::stderr)
            .init();

        let ctx = Invocation::load(&self.config)?;
        match self.command {
            Commands::Migrate(cmd) => cmd.execute(&ctx).await,
            Commands::Seed(cmd) => cmd.execute(&ctx).await,
        }
    }
}

/// Everything a single command needs: configuration, driver registries and
/// the token that bounds the whole invocation.
pub struct Invocation {
    pub config: Arc<DbkitConfig>,
    pub databases: Arc<DatabaseRegistry>,
    pub sources: Arc<SourceRegistry>,
    pub cancel: CancellationToken,
}

impl Invocation {
    pub fn load(path: &Path) -> Result<Self> {
        let config = DbkitConfig::from_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?;
        let signals = CancellationToken::new();
        cancel_on_signal(signals.clone());
        let cancel = cancel::deadline(&signals, config.runtime.timeout());

        Ok(Self {
            config: Arc::new(config),
            databases: Arc::new(drivers::default_databases()?),
            sources: Arc::new(drivers::default_sources()?),
            cancel,
        })
    }
}

fn cancel_on_signal(token: CancellationToken) {
    tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => {}
            _ = shutdown_signal() => {
                tracing::warn!("Received shutdown signal, cancelling");
                token.cancel();
            }
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
