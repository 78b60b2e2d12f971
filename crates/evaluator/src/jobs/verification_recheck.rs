use anyhow::{Context, Result};
use common::db::AsyncDb;
use common::holdings::HoldingsRepository;
use common::users::UserRepository;
use common::verification::VerificationHistoryRepository;

use super::tracker::JobTracker;

pub const RECHECK_REASON: &str = "Scheduled re-check";
pub const RECHECK_SOURCE: &str = "scheduler";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecheckSummary {
    pub checked: u64,
    pub changed: u64,
    pub failed: u64,
}

/// Re-derive every user's verification status (Plaid linked and holding at
/// least one position) and log transitions. Users whose holdings cannot be
/// read keep their current status.
pub async fn run_verification_recheck_once<H>(db: &AsyncDb, holdings: &H) -> Result<RecheckSummary>
where
    H: HoldingsRepository + Sync,
{
    let tracker = JobTracker::start(db, "verification_recheck").await?;
    match recheck_all(db, holdings).await {
        Ok(summary) => {
            tracker
                .success(Some(serde_json::json!({
                    "checked": summary.checked,
                    "changed": summary.changed,
                    "failed": summary.failed,
                })))
                .await?;
            Ok(summary)
        }
        Err(e) => {
            tracker.fail(&e).await?;
            Err(e)
        }
    }
}

async fn recheck_all<H>(db: &AsyncDb, holdings: &H) -> Result<RecheckSummary>
where
    H: HoldingsRepository + Sync,
{
    let users = UserRepository::new(db.clone());
    let history = VerificationHistoryRepository::new(db.clone());
    let mut summary = RecheckSummary::default();

    for user_id in users.list_user_ids().await.context("list users")? {
        let Some(user) = users.get_user(user_id).await? else {
            continue;
        };
        summary.checked += 1;

        let positions = match holdings.refresh_holdings(user_id).await {
            Ok(_) => holdings.get_holdings_for_user(user_id).await,
            Err(e) => Err(e),
        };
        let positions = match positions {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(user_id, error = %e, "holdings unavailable; keeping current status");
                metrics::counter!("trusttrade_verification_recheck_failures_total").increment(1);
                summary.failed += 1;
                continue;
            }
        };

        let expected = user.plaid_enabled && !positions.is_empty();
        let previous = history
            .get_most_recent_status(user_id)
            .await?
            .map(|r| r.is_verified);

        if previous != Some(expected) {
            history
                .add_verification_record(
                    user_id,
                    expected,
                    Some(RECHECK_REASON.to_string()),
                    Some(RECHECK_SOURCE.to_string()),
                )
                .await
                .with_context(|| format!("record verification for user {user_id}"))?;
            let status = if expected { "verified" } else { "unverified" };
            metrics::counter!("trusttrade_verification_changes_total", "status" => status)
                .increment(1);
            summary.changed += 1;
        }

        if user.is_verified != expected {
            users.set_verified(user_id, expected).await?;
        }
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::holdings::SqliteHoldingsRepository;
    use common::types::{InvestmentPosition, NewInvestmentPosition};
    use rust_decimal_macros::dec;

    struct BrokenFor(i64, SqliteHoldingsRepository);

    impl HoldingsRepository for BrokenFor {
        async fn get_holdings_for_user(&self, user_id: i64) -> Result<Vec<InvestmentPosition>> {
            if user_id == self.0 {
                anyhow::bail!("item login required");
            }
            self.1.get_holdings_for_user(user_id).await
        }

        async fn refresh_holdings(&self, user_id: i64) -> Result<bool> {
            self.1.refresh_holdings(user_id).await
        }
    }

    fn position() -> NewInvestmentPosition {
        NewInvestmentPosition {
            symbol: Some("VTI".to_string()),
            quantity: dec!(3),
            cost_basis: dec!(200),
            current_price: dec!(210),
        }
    }

    async fn setup() -> (AsyncDb, SqliteHoldingsRepository, i64, i64) {
        let db = AsyncDb::open(":memory:").await.unwrap();
        let users = UserRepository::new(db.clone());
        let linked = users.create_user("linked", true).await.unwrap();
        let unlinked = users.create_user("unlinked", false).await.unwrap();
        let holdings = SqliteHoldingsRepository::new(db.clone());
        let c = holdings.add_connection(linked, "Broker").await.unwrap();
        holdings.replace_positions(c, vec![position()]).await.unwrap();
        (db, holdings, linked, unlinked)
    }

    #[tokio::test]
    async fn test_recheck_records_transitions_once() {
        let (db, holdings, linked, unlinked) = setup().await;

        let first = run_verification_recheck_once(&db, &holdings).await.unwrap();
        assert_eq!(
            first,
            RecheckSummary {
                checked: 2,
                changed: 2,
                failed: 0
            }
        );

        let history = VerificationHistoryRepository::new(db.clone());
        let rec = history.get_most_recent_status(linked).await.unwrap().unwrap();
        assert!(rec.is_verified);
        assert_eq!(rec.reason.as_deref(), Some(RECHECK_REASON));
        assert_eq!(rec.source.as_deref(), Some(RECHECK_SOURCE));
        assert!(!history.get_most_recent_status(unlinked).await.unwrap().unwrap().is_verified);

        let users = UserRepository::new(db.clone());
        assert!(users.get_user(linked).await.unwrap().unwrap().is_verified);

        // Nothing changed, so nothing new is logged.
        let second = run_verification_recheck_once(&db, &holdings).await.unwrap();
        assert_eq!(second.changed, 0);
        assert_eq!(history.get_history_for_user(linked).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_recheck_unverifies_user_whose_holdings_are_gone() {
        let (db, holdings, linked, _unlinked) = setup().await;
        run_verification_recheck_once(&db, &holdings).await.unwrap();

        db.call(|conn| {
            conn.execute("DELETE FROM investment_positions", [])?;
            Ok(())
        })
        .await
        .unwrap();
        let summary = run_verification_recheck_once(&db, &holdings).await.unwrap();
        assert_eq!(summary.changed, 1);

        let history = VerificationHistoryRepository::new(db.clone())
            .get_history_for_user(linked)
            .await
            .unwrap();
        let flags: Vec<bool> = history.iter().map(|r| r.is_verified).collect();
        assert_eq!(flags, vec![true, false]);
        assert!(!UserRepository::new(db).get_user(linked).await.unwrap().unwrap().is_verified);
    }

    #[tokio::test]
    async fn test_disabling_plaid_unverifies_even_with_holdings() {
        let (db, holdings, linked, _unlinked) = setup().await;
        run_verification_recheck_once(&db, &holdings).await.unwrap();

        let users = UserRepository::new(db.clone());
        assert!(users.set_plaid_enabled(linked, false).await.unwrap());
        assert!(!users.set_plaid_enabled(999, false).await.unwrap());

        let summary = run_verification_recheck_once(&db, &holdings).await.unwrap();
        assert_eq!(summary.changed, 1);
        let rec = VerificationHistoryRepository::new(db.clone())
            .get_most_recent_status(linked)
            .await
            .unwrap()
            .unwrap();
        assert!(!rec.is_verified);
    }

    #[tokio::test]
    async fn test_holdings_failure_skips_user_and_job_still_succeeds() {
        let (db, holdings, linked, unlinked) = setup().await;
        let broken = BrokenFor(linked, holdings);

        let summary = run_verification_recheck_once(&db, &broken).await.unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.changed, 1);

        let history = VerificationHistoryRepository::new(db.clone());
        assert!(history.get_history_for_user(linked).await.unwrap().is_empty());
        assert_eq!(history.get_history_for_user(unlinked).await.unwrap().len(), 1);

        let status: String = db
            .call(|conn| {
                Ok(conn.query_row(
                    "SELECT status FROM job_status WHERE job_name = 'verification_recheck'",
                    [],
                    |row| row.get(0),
                )?)
            })
            .await
            .unwrap();
        assert_eq!(status, "idle");
    }
}
