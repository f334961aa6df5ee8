//! # Plugin Index CLI (`pidx`)
//!
//! ## Usage
//!
//! ```bash
//! pidx --config ./config/pidx.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `pidx init` | Create the SQLite database and run schema migrations |
//! | `pidx sources` | Show the connector configured for every stage |
//! | `pidx run <pipeline>` | Run a pipeline now and print its report as JSON |
//! | `pidx scheduled [--at <rfc3339>]` | Run the pipeline scheduled for today, with retry |
//! | `pidx serve` | Start the trigger HTTP server |
//! | `pidx runs [--limit N]` | List recent runs |
//! | `pidx status` | Entity counts and last run per pipeline |
//! | `pidx trend <entity-id> [--last N]` | Popularity trend of one entity |
//!
//! Logs go to stderr; reports go to stdout.

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use plugin_index::config::{self, Config};
use plugin_index::coordinator::RunCoordinator;
use plugin_index::models::{Pipeline, TriggerSource};
use plugin_index::traits::ConnectorRegistry;
use plugin_index::{db, entities, history, logging, migrate, runs, schedule, server, sources, stats};

/// Plugin Index CLI: indexing orchestration for plugin marketplaces and MCP
/// server registries.
#[derive(Parser)]
#[command(
    name = "pidx",
    about = "Plugin Index — indexing orchestration for plugin marketplaces and MCP registries",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/pidx.toml")]
    config: PathBuf,

    /// Log filter (`info`, `debug`, `plugin_index=trace`). Overrides `RUST_LOG`.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent, running it multiple times is safe.
    Init,

    /// Show the connector configured for every stage.
    Sources,

    /// Run a pipeline now.
    ///
    /// Pipelines: `all`, `marketplaces`, `mcp-servers`, `plugins`, `mcp-stats`.
    /// Exits non-zero if the run is rejected; a run with failed stages still
    /// prints its report.
    Run {
        pipeline: Pipeline,
    },

    /// Run the pipeline scheduled for a day, retrying infrastructure failures.
    Scheduled {
        /// Scheduled time (RFC 3339). Defaults to now.
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },

    /// Start the trigger HTTP server.
    Serve,

    /// List recent runs, newest first.
    Runs {
        #[arg(long, default_value = "20")]
        limit: i64,
    },

    /// Entity counts and the last run of every pipeline.
    Status,

    /// Popularity trend of one entity over its last observations.
    Trend {
        entity_id: String,

        #[arg(long, default_value = "10")]
        last: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.log_level.as_deref())?;

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Sources => {
            sources::list_sources(&cfg)?;
        }
        Commands::Run { pipeline } => {
            let coordinator = build_coordinator(&cfg).await?;
            let report = coordinator.trigger(pipeline, TriggerSource::Cli).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Scheduled { at } => {
            let coordinator = build_coordinator(&cfg).await?;
            let at = at.unwrap_or_else(Utc::now);
            let report = schedule::run_scheduled(&coordinator, &cfg.schedule, at).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Runs { limit } => {
            let pool = db::connect(&cfg).await?;
            let recent = runs::recent_runs(&pool, limit).await?;
            println!(
                "{:<36}  {:<12} {:<9} {:<9} {:>7} {:>6}  STARTED",
                "RUN", "PIPELINE", "TRIGGER", "RESULT", "INDEXED", "FAILED"
            );
            for run in &recent {
                let indexed: u64 = run.stages.iter().map(|s| s.indexed).sum();
                let failed: u64 = run.stages.iter().map(|s| s.failed).sum();
                println!(
                    "{:<36}  {:<12} {:<9} {:<9} {:>7} {:>6}  {}",
                    run.run_id,
                    run.pipeline.as_str(),
                    run.trigger.as_str(),
                    stats::run_result(run),
                    indexed,
                    failed,
                    stats::format_ts_iso(run.started_at)
                );
            }
            pool.close().await;
        }
        Commands::Status => {
            stats::run_status(&cfg).await?;
        }
        Commands::Trend { entity_id, last } => {
            let pool = db::connect(&cfg).await?;
            let entity = entities::get_entity(&pool, &entity_id)
                .await?
                .with_context(|| format!("no entity with id {}", entity_id))?;
            let snapshots = history::recent_snapshots(&pool, &entity_id, last).await?;

            println!("{} ({}, {})", entity.name, entity.family, entity.status.as_str());
            println!("  {:<17} {:>8} {:>8} {:>8}", "RECORDED", "STARS", "PLUGINS", "SKILLS");
            for s in &snapshots {
                println!(
                    "  {:<17} {:>8} {:>8} {:>8}",
                    stats::format_ts_iso(s.recorded_at),
                    s.stars,
                    s.plugin_count,
                    s.skill_count
                );
            }
            match history::trend(&snapshots) {
                Some(t) => println!(
                    "  over {} observations: stars {:+}, plugins {:+}, skills {:+}",
                    t.observations, t.stars, t.plugin_count, t.skill_count
                ),
                None => println!("  not enough observations for a trend"),
            }
            pool.close().await;
        }
    }

    Ok(())
}

async fn build_coordinator(cfg: &Config) -> anyhow::Result<RunCoordinator> {
    let pool = db::connect(cfg).await?;
    Ok(RunCoordinator::new(
        pool,
        ConnectorRegistry::from_config(cfg),
        cfg.pipeline.clone(),
    ))
}
