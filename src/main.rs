//! # casewatch CLI (`cw`)
//!
//! The `cw` binary is the operator interface for casewatch. It initializes
//! the store, triggers collection, processes pending records, geocodes and
//! clusters cases, and runs the long-lived scheduler.
//!
//! ## Usage
//!
//! ```bash
//! cw --config ./config/casewatch.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `cw init` | Create the SQLite database and schema |
//! | `cw sources` | List sources with status, error count and health |
//! | `cw sync <id\|all>` | Run collection now (`--batch-size N` for grouped runs) |
//! | `cw process` | Validate and classify pending records |
//! | `cw reprocess-failed` | Move failed records back to pending |
//! | `cw reset-source <id>` | Reactivate a source in `error` status |
//! | `cw history` | Recent sync history |
//! | `cw events` | Recent change events |
//! | `cw geocode <action>` | Batch geocoding, single lookup, cache stats and clear |
//! | `cw cluster` | Cluster geolocated cases, print JSON |
//! | `cw run` | Scheduler loop with periodic processing until Ctrl-C |
//! | `cw stats` | Store statistics |

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};

use casewatch::alerting::LogAlertSink;
use casewatch::config::{self, Config};
use casewatch::geocode::GeocodeResolver;
use casewatch::process::Processor;
use casewatch::progress::{format_number, ProgressMode, SyncProgressReporter};
use casewatch::rate_limit::RateLimiter;
use casewatch::scheduler::Scheduler;
use casewatch::sqlite_store::SqliteStore;
use casewatch::{db, logging, migrate, sources, stats};
use casewatch_core::cluster::{cluster_points, points_from_cases, ClusterAlgorithm};
use casewatch_core::models::SyncResult;
use casewatch_core::store::RecordStore;

/// casewatch: missing-person and AMBER alert collection pipeline.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/casewatch.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "cw",
    about = "casewatch: collect, deduplicate, track and cluster missing-person and AMBER alert records",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/casewatch.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// List configured sources with status and health.
    Sources,

    /// Run collection now, outside the schedule.
    ///
    /// `all` runs every active source in parallel; with `--batch-size`
    /// sources run in groups with a pause between groups.
    Sync {
        /// Source id from `[sources.<id>]`, or `all`.
        source: String,

        /// Group size for `all`.
        #[arg(long)]
        batch_size: Option<usize>,
    },

    /// Validate and classify pending records.
    Process {
        /// Maximum number of records to process.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Move every failed record back to pending.
    ReprocessFailed,

    /// Reactivate a source in `error` status.
    ResetSource {
        /// Source id.
        source: String,
    },

    /// Show recent sync history.
    History {
        /// Only show cycles for this source.
        #[arg(long)]
        source: Option<String>,

        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Show recent change events.
    Events {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Geocoding: batch, lookup, and cache management.
    Geocode {
        #[command(subcommand)]
        action: GeocodeAction,
    },

    /// Cluster geolocated cases and print the clusters as JSON.
    Cluster {
        /// density, kmeans, hierarchical or risk.
        #[arg(long)]
        algorithm: Option<String>,

        /// Neighbor / merge distance in kilometers.
        #[arg(long)]
        max_distance: Option<f64>,

        /// Minimum cluster size.
        #[arg(long)]
        min_points: Option<usize>,
    },

    /// Run the scheduler until Ctrl-C.
    Run,

    /// Show store statistics.
    Stats,
}

#[derive(Subcommand)]
enum GeocodeAction {
    /// Geocode stored cases that have no coordinates.
    Pending {
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Resolve one city/state pair.
    Lookup {
        city: String,
        state: String,
        #[arg(long, default_value = "USA")]
        country: String,
    },
    /// Show cache statistics.
    Stats,
    /// Delete every cache entry.
    Clear,
}

async fn open_store(cfg: &Config) -> Result<Arc<SqliteStore>> {
    let pool = db::connect(cfg).await?;
    migrate::migrate_pool(&pool).await?;
    Ok(Arc::new(SqliteStore::new(pool)))
}

fn progress_reporter() -> Arc<dyn SyncProgressReporter> {
    Arc::from(ProgressMode::default_for_tty().reporter())
}

fn print_sync_result(result: &SyncResult) {
    if result.success {
        println!(
            "{:<20} ok      {} records ({} added, {} updated, {} skipped) in {}ms",
            result.source_id,
            format_number(result.records_processed),
            result.records_added,
            result.records_updated,
            result.records_skipped,
            result.duration_ms()
        );
    } else {
        println!(
            "{:<20} FAILED  {}",
            result.source_id,
            result.errors.join("; ")
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    logging::init(&cfg.logging)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Sources => {
            let store = open_store(&cfg).await?;
            let scheduler =
                Scheduler::from_config(&cfg, store, Arc::new(RateLimiter::new()), progress_reporter())
                    .await?;
            sources::list_sources(&scheduler);
        }
        Commands::Sync { source, batch_size } => {
            let store = open_store(&cfg).await?;
            let scheduler =
                Scheduler::from_config(&cfg, store, Arc::new(RateLimiter::new()), progress_reporter())
                    .await?;
            let results = match (source.as_str(), batch_size) {
                ("all", Some(size)) => scheduler.run_batch_processing(size).await,
                ("all", None) => scheduler.run_parallel_collection(None).await?,
                (_, Some(_)) => bail!("--batch-size only applies to `cw sync all`"),
                (id, None) => vec![scheduler.trigger_manual_sync(id).await?],
            };
            if results.is_empty() {
                println!("No active sources to sync.");
            }
            for result in &results {
                print_sync_result(result);
            }
        }
        Commands::Process { limit } => {
            let store = open_store(&cfg).await?;
            let geocoder = GeocodeResolver::from_config(
                &cfg.geocoding,
                &cfg.http,
                Arc::new(RateLimiter::new()),
            )?;
            let processor = Processor::new(store, &cfg.validation, Arc::new(LogAlertSink))
                .with_geocoder(Arc::new(geocoder));
            let progress = ProgressMode::default_for_tty().reporter();
            let summary = processor
                .process_pending(cfg.scheduler.process_batch_size, limit, &*progress)
                .await?;
            println!(
                "Processed {} records: {} new cases, {} updated, {} unchanged, {} failed validation.",
                summary.processed,
                summary.new_cases,
                summary.updated_cases,
                summary.unchanged,
                summary.failed
            );
            println!(
                "Change events: {} ({} undelivered).",
                summary.events, summary.undelivered
            );
        }
        Commands::ReprocessFailed => {
            let store = open_store(&cfg).await?;
            let moved = store.reset_failed().await?;
            println!("Moved {} failed records back to pending.", moved);
        }
        Commands::ResetSource { source } => {
            let store = open_store(&cfg).await?;
            let scheduler = Scheduler::from_config(
                &cfg,
                store,
                Arc::new(RateLimiter::new()),
                progress_reporter(),
            )
            .await?;
            scheduler.reset_source(&source).await?;
            println!("Source '{}' reset to active.", source);
        }
        Commands::History { source, limit } => {
            let store = open_store(&cfg).await?;
            let history = store.recent_sync_history(source.as_deref(), limit).await?;
            if history.is_empty() {
                println!("No sync history.");
            } else {
                println!(
                    "{:<17} {:<20} {:<6} {:>8} {:>6} {:>8} {:>8}   ERRORS",
                    "STARTED", "SOURCE", "RESULT", "RECORDS", "ADDED", "UPDATED", "MS"
                );
                for h in &history {
                    println!(
                        "{:<17} {:<20} {:<6} {:>8} {:>6} {:>8} {:>8}   {}",
                        h.started_at.format("%Y-%m-%d %H:%M"),
                        h.source_id,
                        if h.success { "ok" } else { "failed" },
                        h.records_processed,
                        h.records_added,
                        h.records_updated,
                        h.duration_ms(),
                        h.errors.join("; ")
                    );
                }
            }
        }
        Commands::Events { limit } => {
            let store = open_store(&cfg).await?;
            let events = store.recent_change_events(limit).await?;
            if events.is_empty() {
                println!("No change events.");
            } else {
                println!(
                    "{:<17} {:<9} {:<14} {:<20} {:<24} {:>7}  DELIVERED",
                    "DETECTED", "PRIORITY", "TYPE", "SOURCE", "NAME", "CHANGES"
                );
                for e in &events {
                    println!(
                        "{:<17} {:<9} {:<14} {:<20} {:<24} {:>7}  {}",
                        e.detected_at.format("%Y-%m-%d %H:%M"),
                        e.priority.as_str(),
                        e.change_type.as_str(),
                        e.source_id,
                        e.record.name.as_deref().unwrap_or("(unnamed)"),
                        e.changes.len(),
                        if e.processed { "yes" } else { "no" }
                    );
                }
            }
        }
        Commands::Geocode { action } => {
            let resolver = GeocodeResolver::from_config(
                &cfg.geocoding,
                &cfg.http,
                Arc::new(RateLimiter::new()),
            )?;
            match action {
                GeocodeAction::Pending { limit } => {
                    let store = open_store(&cfg).await?;
                    let summary = resolver.geocode_pending(&*store, limit).await?;
                    println!(
                        "Geocoded {} of {} cases ({} unresolved, {} without city/state).",
                        summary.resolved, summary.considered, summary.unresolved, summary.skipped
                    );
                }
                GeocodeAction::Lookup {
                    city,
                    state,
                    country,
                } => {
                    let result = resolver.resolve(&city, &state, &country).await;
                    resolver.flush().await?;
                    match result {
                        Some(result) => println!("{}", serde_json::to_string_pretty(&result)?),
                        None => bail!("No geocoding result for {}, {}", city, state),
                    }
                }
                GeocodeAction::Stats => {
                    println!("{}", serde_json::to_string_pretty(&resolver.stats().await)?);
                }
                GeocodeAction::Clear => {
                    let removed = resolver.clear().await?;
                    println!("Cleared {} cached geocodes.", removed);
                }
            }
        }
        Commands::Cluster {
            algorithm,
            max_distance,
            min_points,
        } => {
            let mut params = cfg.clustering.params()?;
            if let Some(algorithm) = algorithm {
                params.algorithm = algorithm
                    .parse::<ClusterAlgorithm>()
                    .map_err(anyhow::Error::msg)?;
            }
            if let Some(km) = max_distance {
                if km <= 0.0 {
                    bail!("--max-distance must be > 0");
                }
                params.max_distance_km = km;
            }
            if let Some(n) = min_points {
                if n == 0 {
                    bail!("--min-points must be > 0");
                }
                params.min_points = n;
            }

            let store = open_store(&cfg).await?;
            let cases = store.list_cases().await?;
            let today = Utc::now().date_naive();
            let points = points_from_cases(&cases, today);
            let clusters = cluster_points(&points, &params, today);
            tracing::info!(
                cases = cases.len(),
                points = points.len(),
                clusters = clusters.len(),
                algorithm = %params.algorithm,
                "clustering finished"
            );
            println!("{}", serde_json::to_string_pretty(&clusters)?);
        }
        Commands::Run => {
            let store = open_store(&cfg).await?;
            let limiter = Arc::new(RateLimiter::new());
            let geocoder =
                GeocodeResolver::from_config(&cfg.geocoding, &cfg.http, limiter.clone())?;
            let processor = Processor::new(store.clone(), &cfg.validation, Arc::new(LogAlertSink))
                .with_geocoder(Arc::new(geocoder));
            let scheduler =
                Scheduler::from_config(&cfg, store, limiter, progress_reporter()).await?;

            let stopper = scheduler.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("interrupt received, stopping scheduler");
                    stopper.stop();
                }
            });

            scheduler.run(Some(Arc::new(processor))).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
    }

    Ok(())
}
