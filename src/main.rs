//! relay-ledger: inspect and drive the completion sync engine
//!
//! ## Usage
//!
//! ```bash
//! # Seed an event with two teams sharing one exclusive activity
//! relay-ledger seed-event ev1 --team 3 --team 9 --exclusive 5 --activity 42
//!
//! # Record a completion and sync it
//! relay-ledger complete ev1 3 5 --points 20 --exclusive
//!
//! # Queue and ledger state
//! relay-ledger status
//!
//! # Print reconciled team snapshots as they change
//! relay-ledger watch events/ev1/teams/3
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use relay_ledger::{
    ActivityKey, ActivitySnapshot, CompletionEngine, CompletionJob, Config, Connectivity,
    EngineConfig, LocalStore, SharedStore, TeamActivityRecord, TeamPath,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "relay-ledger")]
#[command(about = "Offline-tolerant completion sync for live team events")]
struct Cli {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Data directory (local store, default shared database)
    #[arg(long, env = "RELAY_LEDGER_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Shared team database
    #[arg(long, env = "RELAY_LEDGER_REMOTE_DB")]
    remote_db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show pending jobs and local completion marks
    Status,

    /// Run one drain pass against the shared store
    Drain,

    /// Wipe the local queue and ledger
    ClearCache,

    /// Create an event and its teams in the shared store
    SeedEvent {
        event_id: String,

        #[arg(long, default_value = "")]
        name: String,

        /// Team on the roster (repeatable)
        #[arg(long = "team", required = true)]
        teams: Vec<String>,

        /// Non-exclusive activity given to every team (repeatable)
        #[arg(long = "activity")]
        activities: Vec<String>,

        /// Exclusive activity given to every team (repeatable)
        #[arg(long = "exclusive")]
        exclusive: Vec<String>,
    },

    /// Record a completion locally, then drain once
    Complete {
        event_id: String,
        team_id: String,
        activity_id: String,

        /// Points the activity is worth
        #[arg(long, default_value_t = 0)]
        points: i64,

        #[arg(long)]
        exclusive: bool,

        /// Record a failed attempt
        #[arg(long)]
        failed: bool,

        #[arg(long)]
        media: Option<String>,
    },

    /// Print reconciled snapshots of one team until interrupted
    Watch {
        /// events/{eventId}/teams/{teamId}
        path: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("relay_ledger=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    // Load config
    let mut config = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => Config::default(),
    };

    // Apply CLI overrides
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }
    if let Some(path) = cli.remote_db {
        config.remote_db_path = Some(path);
    }

    tokio::fs::create_dir_all(&config.data_dir).await?;
    let config_path = config.config_path();
    if !config_path.exists() {
        config.save(&config_path)?;
        info!(path = %config_path.display(), "Created default config");
    }

    let local = LocalStore::open_or_degraded(&config.local_store_path());

    if let Command::ClearCache = cli.command {
        local.clear_all().await?;
        println!("Local completion cache cleared");
        return Ok(());
    }

    let shared = SharedStore::open(
        &config.remote_db_path(),
        config.busy_timeout(),
        config.change_feed_capacity,
    )
    .context("failed to open shared store")?
    .with_poll_interval(config.change_poll_interval());

    match cli.command {
        Command::ClearCache => {}

        Command::SeedEvent {
            event_id,
            name,
            teams,
            activities,
            exclusive,
        } => {
            shared.create_event(&event_id, &name).await?;
            for team_id in &teams {
                shared.add_team(&event_id, team_id, 0).await?;
                let entries = activities
                    .iter()
                    .map(|id| TeamActivityRecord::new(id.clone(), false))
                    .chain(exclusive.iter().map(|id| TeamActivityRecord::new(id.clone(), true)));
                for entry in entries {
                    shared.assign_activity(&event_id, team_id, entry).await?;
                }
            }
            info!(event_id = %event_id, teams = teams.len(), "Event seeded");
            for team in shared.list_teams(&event_id).await? {
                println!("{}", serde_json::to_string(&team)?);
            }
        }

        Command::Status => {
            let engine = engine(&local, &shared, &config);
            let stats = engine.queue_stats().await;
            let status = serde_json::json!({
                "durable": local.is_durable(),
                "queue": stats,
                "ledger_marks": engine.ledger().len().await,
                "pending": engine.list_pending().await,
            });
            println!("{}", serde_json::to_string_pretty(&status)?);
        }

        Command::Drain => {
            let engine = engine(&local, &shared, &config);
            let report = engine.drain().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }

        Command::Complete {
            event_id,
            team_id,
            activity_id,
            points,
            exclusive,
            failed,
            media,
        } => {
            let engine = engine(&local, &shared, &config);
            let mut events = engine.events();

            let key = ActivityKey::new(event_id, team_id, activity_id.clone());
            let mut job = CompletionJob::new(
                key,
                ActivitySnapshot::new(activity_id, points, exclusive),
                !failed,
            );
            if let Some(media) = media {
                job = job.with_media(media);
            }

            let mark = engine.enqueue_completion(job).await;
            println!("{}", serde_json::to_string(&mark)?);

            let report = engine.drain().await;
            while let Ok(event) = events.try_recv() {
                println!("{}", serde_json::to_string(&event)?);
            }
            if report.retrying > 0 {
                warn!("Completion kept in the queue; run `relay-ledger drain` to retry");
            }
        }

        Command::Watch { path } => {
            let path: TeamPath = path.parse()?;
            let engine = engine(&local, &shared, &config);

            let _subscription = engine.subscribe(
                path,
                |record| match serde_json::to_string(&record) {
                    Ok(line) => println!("{}", line),
                    Err(e) => warn!(error = %e, "Failed to encode team record"),
                },
                |error| warn!(error = %error, "Subscription error"),
            );
            engine.start();

            tokio::signal::ctrl_c().await?;
            info!("Shutting down");
            engine.shutdown();
        }
    }

    local.flush().await?;
    Ok(())
}

fn engine(local: &LocalStore, shared: &SharedStore, config: &Config) -> CompletionEngine {
    CompletionEngine::new(
        local,
        Arc::new(shared.clone()),
        Arc::new(shared.clone()),
        Connectivity::new(true),
        EngineConfig::from(config),
    )
}
