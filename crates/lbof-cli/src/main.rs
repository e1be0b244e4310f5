use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lbof_storage::ConsolidationStore;
use lbof_sync::{PairMode, RunConfig, SyncConfig};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "lbof")]
#[command(about = "Local business opportunity finder")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Acquire, score and consolidate every configured (city, niche) pair.
    Run {
        /// Re-test niches that already score well in the configured neighbour cities.
        #[arg(long)]
        from_best: bool,
        #[arg(long)]
        no_export: bool,
    },
    /// Write Parquet snapshots of the consolidated store.
    Export,
    /// List metrics scoring above the best-opportunity threshold.
    Best {
        #[arg(long)]
        threshold: Option<f64>,
        /// Also write the businesses of each best niche to `<data>/best_niches/`.
        #[arg(long)]
        companies: bool,
    },
    /// Compare niches across the cities they were measured in.
    Compare,
    /// Run on the configured cron expression until interrupted.
    Schedule {
        #[arg(long)]
        from_best: bool,
    },
}

fn pair_mode(from_best: bool) -> PairMode {
    if from_best {
        PairMode::FromBest
    } else {
        PairMode::Configured
    }
}

fn load_config_or_default(sync: &SyncConfig) -> Result<RunConfig> {
    if sync.config_path.exists() {
        Ok(RunConfig::load(&sync.config_path)?)
    } else {
        Ok(RunConfig::default())
    }
}

/// Cancels the token on the first Ctrl-C so in-flight pairs stop without merging.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; cancelling run");
            token.cancel();
        }
    });
    cancel
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("lbof=info".parse()?))
        .init();

    let cli = Cli::parse();
    let sync = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Run {
        from_best: false,
        no_export: false,
    }) {
        Commands::Run {
            from_best,
            no_export,
        } => {
            let cancel = cancel_on_ctrl_c();
            let summary =
                lbof_sync::run_sync_once_from_env(pair_mode(from_best), !no_export, &cancel).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Export => {
            let config = load_config_or_default(&sync)?;
            let store = ConsolidationStore::open(&sync.data_dir).await?;
            let dir = lbof_sync::export_snapshots(
                &sync.data_dir,
                Uuid::new_v4(),
                store.metrics(),
                store.raw_records(),
                config.best_score_threshold,
            )?;
            println!("snapshot written to {}", dir.display());
        }
        Commands::Best {
            threshold,
            companies,
        } => {
            let config = load_config_or_default(&sync)?;
            let threshold = threshold.unwrap_or(config.best_score_threshold);
            let store = ConsolidationStore::open(&sync.data_dir).await?;
            let best = lbof_sync::best_opportunities(store.metrics(), threshold);
            if best.is_empty() {
                println!("no pair scores above {threshold}");
            }
            for m in best {
                println!(
                    "{:.3}  {:<6}  {} / {}  companies={} reviews={}",
                    m.score,
                    m.classification.as_str(),
                    m.city,
                    m.niche,
                    m.company_count,
                    m.total_reviews
                );
            }
            if companies {
                let out = sync.data_dir.join("best_niches");
                for file in lbof_sync::export_niche_companies(&store, &out, threshold)? {
                    println!("{} rows -> {}", file.rows, out.join(&file.path).display());
                }
            }
        }
        Commands::Compare => {
            let store = ConsolidationStore::open(&sync.data_dir).await?;
            for row in lbof_sync::compare_niches(store.metrics()) {
                println!(
                    "{}  cities={} mean={:.3} std={:.3} replicable={:.1}%",
                    row.niche, row.cities, row.mean_score, row.std_dev, row.replicability_pct
                );
            }
        }
        Commands::Schedule { from_best } => {
            let sync = SyncConfig {
                scheduler_enabled: true,
                ..sync
            };
            let config = RunConfig::load(&sync.config_path)?;
            let controller = std::sync::Arc::new(lbof_sync::build_controller(&sync, config).await?);
            let cancel = CancellationToken::new();
            let Some(mut sched) = lbof_sync::maybe_build_scheduler(
                controller,
                &sync,
                pair_mode(from_best),
                cancel.clone(),
            )
            .await?
            else {
                return Ok(());
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %sync.sync_cron, "scheduler started");

            tokio::signal::ctrl_c().await.context("waiting for interrupt")?;
            cancel.cancel();
            sched.shutdown().await.context("stopping scheduler")?;
            info!("scheduler stopped");
        }
    }

    Ok(())
}
