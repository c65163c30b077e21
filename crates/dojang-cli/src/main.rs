use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use dojang_storage::RankStore;
use dojang_sync::{JobKind, SyncConfig, SyncPipeline};
use dojang_web::{lookup_rank, RankQuery};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "dojang-cli")]
#[command(about = "Dojang ranking tracker command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one ingestion job and exit.
    Sync {
        #[arg(value_enum, default_value_t = Week::ThisWeek)]
        kind: Week,
    },
    /// Serve rank queries, with scheduled ingestion when enabled.
    Serve {
        /// Run the last-week then the this-week job once before serving.
        #[arg(long)]
        update: bool,
    },
    /// Look up one player directly from the store.
    Lookup {
        world: i32,
        #[arg(value_name = "TYPE")]
        type_id: i32,
        name: String,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Week {
    ThisWeek,
    LastWeek,
}

impl From<Week> for JobKind {
    fn from(week: Week) -> Self {
        match week {
            Week::ThisWeek => JobKind::ThisWeek,
            Week::LastWeek => JobKind::LastWeek,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("dojang=info".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync { kind: Week::ThisWeek }) {
        Commands::Sync { kind } => {
            let summary = dojang_sync::run_job_once_from_env(kind.into()).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Serve { update } => serve(update).await?,
        Commands::Lookup { world, type_id, name } => {
            let config = SyncConfig::from_env();
            let store = open_store(&config)?;
            let response = lookup_rank(&store, &RankQuery { world, type_id, name })?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
    }

    Ok(())
}

fn open_store(config: &SyncConfig) -> Result<RankStore> {
    RankStore::open(&config.database_path)
        .with_context(|| format!("opening {}", config.database_path.display()))
}

async fn serve(update: bool) -> Result<()> {
    let config = SyncConfig::from_env();
    let store = open_store(&config)?;
    let pipeline = Arc::new(SyncPipeline::new(config, store.clone())?);

    // Kept alive for the lifetime of the server.
    let _scheduler = match pipeline.maybe_build_scheduler().await? {
        Some(sched) => {
            sched.start().await.context("starting scheduler")?;
            info!("ingestion scheduler started");
            Some(sched)
        }
        None => None,
    };

    if update {
        for kind in [JobKind::LastWeek, JobKind::ThisWeek] {
            dojang_sync::run_and_log(&pipeline, kind).await;
        }
    }

    dojang_web::serve_from_env(store).await
}
