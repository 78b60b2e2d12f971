use anyhow::Result;
use common::db::AsyncDb;

/// Fold the WAL back into the main database file.
///
/// TRUNCATE mode resets the WAL to zero bytes once every page is checkpointed.
/// Returns `(wal_pages, checkpointed_pages)`.
pub async fn run_wal_checkpoint_once(db: &AsyncDb) -> Result<(i64, i64)> {
    let (busy, log, checkpointed) = db
        .call_named("wal_checkpoint.run", |conn| {
            Ok(conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?)
        })
        .await?;

    if busy != 0 {
        tracing::warn!(
            busy,
            log,
            checkpointed,
            "WAL checkpoint: database was busy, partial checkpoint"
        );
        metrics::counter!("trusttrade_wal_checkpoint_total", "status" => "busy").increment(1);
    } else {
        tracing::info!(log, checkpointed, "WAL checkpoint complete");
        metrics::counter!("trusttrade_wal_checkpoint_total", "status" => "ok").increment(1);
    }
    metrics::gauge!("trusttrade_wal_checkpoint_pages").set(checkpointed as f64);
    Ok((log, checkpointed))
}

/// Record SQLite file sizes and page statistics as gauges.
pub async fn run_sqlite_stats_once(db: &AsyncDb, db_path: &str) -> Result<()> {
    let db_file_size = std::fs::metadata(db_path).map(|m| m.len()).unwrap_or(0);
    let wal_file_size = std::fs::metadata(format!("{db_path}-wal"))
        .map(|m| m.len())
        .unwrap_or(0);

    metrics::gauge!("trusttrade_db_file_size_bytes").set(db_file_size as f64);
    metrics::gauge!("trusttrade_db_wal_size_bytes").set(wal_file_size as f64);

    let (page_count, page_size, freelist_count) = db
        .call_named("sqlite_stats.pragmas", |conn| {
            let page_count: i64 = conn.query_row("PRAGMA page_count", [], |r| r.get(0))?;
            let page_size: i64 = conn.query_row("PRAGMA page_size", [], |r| r.get(0))?;
            let freelist_count: i64 = conn.query_row("PRAGMA freelist_count", [], |r| r.get(0))?;
            Ok((page_count, page_size, freelist_count))
        })
        .await?;

    metrics::gauge!("trusttrade_db_page_count").set(page_count as f64);
    metrics::gauge!("trusttrade_db_page_size_bytes").set(page_size as f64);
    metrics::gauge!("trusttrade_db_freelist_count").set(freelist_count as f64);

    tracing::debug!(
        db_file_size,
        wal_file_size,
        page_count,
        page_size,
        freelist_count,
        "sqlite stats collected"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_exporter_prometheus::PrometheusBuilder;

    fn current_thread() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
    }

    #[test]
    fn test_sqlite_stats_records_gauges() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        let rt = current_thread();
        metrics::with_local_recorder(&recorder, || {
            rt.block_on(async {
                let tmp = tempfile::NamedTempFile::new().unwrap();
                let path = tmp.path().to_str().unwrap();
                let db = AsyncDb::open(path).await.unwrap();

                run_sqlite_stats_once(&db, path).await.unwrap();
            });
        });

        let rendered = handle.render();
        for name in [
            "trusttrade_db_file_size_bytes",
            "trusttrade_db_page_count",
            "trusttrade_db_page_size_bytes",
            "trusttrade_db_freelist_count",
        ] {
            assert!(rendered.contains(name), "expected {name}, got:\n{rendered}");
        }
    }

    #[test]
    fn test_wal_checkpoint_on_file_database() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        let rt = current_thread();
        metrics::with_local_recorder(&recorder, || {
            rt.block_on(async {
                let tmp = tempfile::NamedTempFile::new().unwrap();
                let db = AsyncDb::open(tmp.path().to_str().unwrap()).await.unwrap();
                common::users::UserRepository::new(db.clone())
                    .create_user("alice", true)
                    .await
                    .unwrap();

                let (_log, checkpointed) = run_wal_checkpoint_once(&db).await.unwrap();
                assert!(checkpointed >= 0);
            });
        });

        let rendered = handle.render();
        assert!(
            rendered.contains("trusttrade_wal_checkpoint_total{status=\"ok\"} 1"),
            "got:\n{rendered}"
        );
    }
}
