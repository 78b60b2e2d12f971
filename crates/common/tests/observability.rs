use metrics_exporter_prometheus::PrometheusBuilder;

// NOTE: This is an integration test so it exercises the public API surface
// (`common::observability`) instead of reaching into private internals.

#[test]
fn tracing_error_events_counter_increments_on_error_event() {
    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();

    metrics::with_local_recorder(&recorder, || {
        // Build a subscriber that includes the error-counter layer.
        let (dispatch, _otel_guard) = common::observability::build_dispatch("test-service", "info");

        tracing::dispatcher::with_default(&dispatch, || {
            tracing::error!(foo = 123, "boom");
        });
    });

    let rendered = handle.render();
    assert!(
        rendered.contains("tracing_error_events"),
        "expected tracing_error_events in rendered metrics, got:\n{rendered}"
    );
}

struct UnreachableBrokerage;

impl common::holdings::HoldingsRepository for UnreachableBrokerage {
    async fn get_holdings_for_user(
        &self,
        _user_id: i64,
    ) -> anyhow::Result<Vec<common::types::InvestmentPosition>> {
        Err(anyhow::anyhow!("connection reset by peer"))
    }

    async fn refresh_holdings(&self, _user_id: i64) -> anyhow::Result<bool> {
        Ok(false)
    }
}

#[test]
fn holdings_failure_logs_one_error_and_scores_unrated() {
    use common::holdings::SqliteHoldingsRepository;
    use common::performance::{PerformanceScoreRepository, ScoringSettings};
    use common::posts::{NewPost, PostRepository};
    use common::types::{NewInvestmentPosition, PerformanceScore};
    use rust_decimal_macros::dec;

    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();

    let score = metrics::with_local_recorder(&recorder, || {
        let (dispatch, _otel_guard) = common::observability::build_dispatch("test-service", "info");
        tracing::dispatcher::with_default(&dispatch, || {
            rt.block_on(async {
                let db = common::db::AsyncDb::open(":memory:").await.unwrap();
                let user_id = common::users::UserRepository::new(db.clone())
                    .create_user("alice", true)
                    .await
                    .unwrap();
                PostRepository::new(db.clone())
                    .create_post(NewPost {
                        user_id,
                        title: "hello".to_string(),
                        content: "first post".to_string(),
                        ..NewPost::default()
                    })
                    .await
                    .unwrap();
                let stored = SqliteHoldingsRepository::new(db.clone());
                let connection_id = stored.add_connection(user_id, "Broker").await.unwrap();
                stored
                    .replace_positions(
                        connection_id,
                        vec![NewInvestmentPosition {
                            symbol: Some("AAPL".to_string()),
                            quantity: dec!(1),
                            cost_basis: dec!(100),
                            current_price: dec!(150),
                        }],
                    )
                    .await
                    .unwrap();

                let repo = PerformanceScoreRepository::new(
                    db,
                    UnreachableBrokerage,
                    ScoringSettings::default(),
                );
                repo.calculate_performance_score(user_id).await
            })
        })
    });

    assert_eq!(score, PerformanceScore::unrated());

    let rendered = handle.render();
    assert!(
        rendered.lines().any(|l| l == "tracing_error_events 1"),
        "expected exactly one ERROR event, got:\n{rendered}"
    );
    assert!(
        rendered.contains("trusttrade_performance_scores_total{outcome=\"holdings_error\"} 1"),
        "got:\n{rendered}"
    );
}
