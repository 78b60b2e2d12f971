use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;

mod cli;
mod jobs;
mod metrics;
mod scheduler;

const WAL_CHECKPOINT_INTERVAL: Duration = Duration::from_secs(15 * 60);
const SQLITE_STATS_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    let config = common::config::Config::load()?;

    let (dispatch, _otel_guard) =
        common::observability::build_dispatch("evaluator", &config.general.log_level);
    tracing::dispatcher::set_global_default(dispatch).map_err(anyhow::Error::msg)?;

    if let Some(parent) = std::path::Path::new(&config.database.path).parent() {
        std::fs::create_dir_all(parent)?;
    }

    let cmd = cli::parse_args(std::env::args()).map_err(anyhow::Error::msg)?;
    let db = common::db::AsyncDb::open(&config.database.path).await?;

    if cmd != cli::Command::Run {
        return cli::run_command(&db, &config, cmd).await;
    }

    tracing::info!("trusttrade evaluator starting");

    metrics::install_prometheus(config.observability.prometheus_port)?;
    metrics::describe();

    let cfg = Arc::new(config);
    let holdings = Arc::new(common::holdings::SqliteHoldingsRepository::new(db.clone()));

    let (recheck_tx, mut recheck_rx) = tokio::sync::mpsc::channel::<()>(8);
    let (wal_checkpoint_tx, mut wal_checkpoint_rx) = tokio::sync::mpsc::channel::<()>(8);
    let (sqlite_stats_tx, mut sqlite_stats_rx) = tokio::sync::mpsc::channel::<()>(8);

    let mut scheduler_jobs = vec![
        scheduler::JobSpec {
            name: "wal_checkpoint".to_string(),
            interval: WAL_CHECKPOINT_INTERVAL,
            tick: wal_checkpoint_tx,
            run_immediately: false,
        },
        scheduler::JobSpec {
            name: "sqlite_stats".to_string(),
            interval: SQLITE_STATS_INTERVAL,
            tick: sqlite_stats_tx,
            run_immediately: true,
        },
    ];
    if cfg.verification.recheck_enabled {
        scheduler_jobs.push(scheduler::JobSpec {
            name: "verification_recheck".to_string(),
            interval: Duration::from_secs(cfg.verification.recheck_interval_secs),
            tick: recheck_tx,
            run_immediately: true,
        });
    } else {
        tracing::info!("verification re-check disabled");
        drop(recheck_tx);
    }

    // Workers first, so ticks sent at startup are received.
    tokio::spawn({
        let db = db.clone();
        let holdings = holdings.clone();
        async move {
            while recheck_rx.recv().await.is_some() {
                let span = tracing::info_span!("job_run", job = "verification_recheck");
                match jobs::run_verification_recheck_once(&db, holdings.as_ref())
                    .instrument(span)
                    .await
                {
                    Ok(s) => tracing::info!(
                        checked = s.checked,
                        changed = s.changed,
                        failed = s.failed,
                        "verification_recheck done"
                    ),
                    Err(e) => tracing::error!(error = %e, "verification_recheck failed"),
                }
            }
        }
    });

    tokio::spawn({
        let db = db.clone();
        async move {
            while wal_checkpoint_rx.recv().await.is_some() {
                let span = tracing::info_span!("job_run", job = "wal_checkpoint");
                if let Err(e) = jobs::run_wal_checkpoint_once(&db).instrument(span).await {
                    tracing::error!(error = %e, "wal_checkpoint failed");
                }
            }
        }
    });

    tokio::spawn({
        let db = db.clone();
        let db_path = cfg.database.path.clone();
        async move {
            while sqlite_stats_rx.recv().await.is_some() {
                let span = tracing::info_span!("job_run", job = "sqlite_stats");
                if let Err(e) = jobs::run_sqlite_stats_once(&db, &db_path)
                    .instrument(span)
                    .await
                {
                    tracing::error!(error = %e, "sqlite_stats failed");
                }
            }
        }
    });

    let _scheduler_handles = scheduler::start(scheduler_jobs);
    tracing::info!(
        recheck_interval_secs = cfg.verification.recheck_interval_secs,
        "scheduler started"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down (force exit in 5s)");

    tokio::spawn(async {
        tokio::time::sleep(Duration::from_secs(5)).await;
        tracing::warn!("force exit after timeout");
        std::process::exit(0);
    });

    Ok(())
}
