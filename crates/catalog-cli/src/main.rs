use anyhow::{bail, Context, Result};
use catalog_providers::ProviderRegistry;
use catalog_storage::PgProductStore;
use catalog_sync::{JobStatus, SyncConfig};
use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "catalog-cli")]
#[command(about = "Product catalog sync command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync pass in the foreground.
    Sync {
        /// Provider key; defaults to CATALOG_PROVIDER.
        #[arg(long)]
        provider: Option<String>,
    },
    Migrate,
    Serve,
    /// List registered providers as JSON.
    Providers,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync { provider: None }) {
        Commands::Sync { provider } => {
            let job = catalog_sync::run_sync_once_from_env(provider.as_deref()).await?;
            match (job.status, job.result) {
                (JobStatus::Succeeded, Some(summary)) => println!(
                    "sync complete: job_id={} provider={} added={} updated={} total={}",
                    job.job_id, job.provider, summary.added, summary.updated, summary.total_processed
                ),
                (status, _) => bail!(
                    "sync job {} ended {}: {}",
                    job.job_id,
                    status.as_str(),
                    job.error.unwrap_or_default()
                ),
            }
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            let url = config
                .database_url
                .context("DATABASE_URL must be set to run migrations")?;
            let store = PgProductStore::connect(&url).await?;
            store.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
        Commands::Serve => {
            catalog_web::serve_from_env().await?;
        }
        Commands::Providers => {
            let view = catalog_sync::SyncService::new(
                SyncConfig::from_env(),
                ProviderRegistry::builtin(),
                std::sync::Arc::new(catalog_storage::InMemoryProductStore::new()),
            )?
            .list_providers();
            println!("{}", serde_json::to_string_pretty(&view)?);
        }
    }

    Ok(())
}
