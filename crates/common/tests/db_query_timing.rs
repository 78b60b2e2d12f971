use metrics_exporter_prometheus::PrometheusBuilder;

#[test]
fn asyncdb_call_named_records_latency_and_errors() {
    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    metrics::with_local_recorder(&recorder, || {
        rt.block_on(async {
            let tmp = tempfile::NamedTempFile::new().unwrap();
            let db = common::db::AsyncDb::open(tmp.path().to_str().unwrap())
                .await
                .unwrap();

            // Success path should record a histogram sample.
            let v: i64 = db.call_named("test.ok", |_conn| Ok(1)).await.unwrap();
            assert_eq!(v, 1);

            // Error path should increment errors counter and record latency with status=err.
            let err: anyhow::Result<()> = db
                .call_named("test.err", |conn| {
                    let _ = conn.execute("SELECT * FROM definitely_missing_table", [])?;
                    Ok(())
                })
                .await;
            assert!(err.is_err());
        });
    });

    let rendered = handle.render();
    assert!(
        rendered.contains("trusttrade_db_query_latency_ms"),
        "expected trusttrade_db_query_latency_ms in rendered metrics, got:\n{rendered}"
    );
    assert!(
        rendered.contains("trusttrade_db_query_errors_total"),
        "expected trusttrade_db_query_errors_total in rendered metrics, got:\n{rendered}"
    );
}

#[test]
fn repository_calls_are_labelled_by_operation() {
    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    metrics::with_local_recorder(&recorder, || {
        rt.block_on(async {
            let db = common::db::AsyncDb::open(":memory:").await.unwrap();
            let users = common::users::UserRepository::new(db);
            let id = users.create_user("alice", true).await.unwrap();
            users.get_user(id).await.unwrap();
        });
    });

    let rendered = handle.render();
    assert!(rendered.contains("op=\"users.create\""), "got:\n{rendered}");
    assert!(rendered.contains("op=\"users.get\""), "got:\n{rendered}");
}
