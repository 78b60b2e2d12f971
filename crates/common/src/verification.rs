//! Append-only log of verification-status transitions and the durations derived from it.

use anyhow::Result;
use chrono::{DateTime, Duration, SubsecRound, Utc};
use rusqlite::{OptionalExtension, TransactionBehavior};

use crate::db::{get_ts, ts_to_sql, AsyncDb};
use crate::types::{VerificationDates, VerificationHistory};

const SELECT_COLUMNS: &str = "SELECT id, user_id, is_verified, timestamp, reason, source
                              FROM verification_history";

fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<VerificationHistory> {
    Ok(VerificationHistory {
        id: row.get(0)?,
        user_id: row.get(1)?,
        is_verified: row.get(2)?,
        timestamp: get_ts(row, 3)?,
        reason: row.get(4)?,
        source: row.get(5)?,
    })
}

fn most_recent(
    conn: &rusqlite::Connection,
    user_id: i64,
) -> rusqlite::Result<Option<VerificationHistory>> {
    conn.query_row(
        &format!("{SELECT_COLUMNS} WHERE user_id = ?1 ORDER BY timestamp DESC, id DESC LIMIT 1"),
        [user_id],
        map_row,
    )
    .optional()
}

/// Total verified time in `history`: every `true` closed by a later `false`,
/// plus a trailing open `true` closed by `now`.
///
/// Records are sorted by timestamp first, so the result does not depend on
/// insertion order. A repeated `true` inside an open interval does not restart
/// it, and a `false` with no open interval is ignored.
pub fn verified_duration(history: &[VerificationHistory], now: DateTime<Utc>) -> Duration {
    let mut events: Vec<&VerificationHistory> = history.iter().collect();
    events.sort_by_key(|r| (r.timestamp, r.id));

    let mut total = Duration::zero();
    let mut open_since: Option<DateTime<Utc>> = None;

    for record in events {
        match (record.is_verified, open_since) {
            (true, None) => open_since = Some(record.timestamp),
            (false, Some(start)) => {
                total += record.timestamp - start;
                open_since = None;
            }
            _ => {}
        }
    }

    if let Some(start) = open_since {
        if now > start {
            total += now - start;
        }
    }
    total
}

#[derive(Clone)]
pub struct VerificationHistoryRepository {
    db: AsyncDb,
}

impl VerificationHistoryRepository {
    pub fn new(db: AsyncDb) -> Self {
        Self { db }
    }

    /// All records for the user, oldest first. Empty when none exist.
    pub async fn get_history_for_user(&self, user_id: i64) -> Result<Vec<VerificationHistory>> {
        self.db
            .call_named("verification.history", move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "{SELECT_COLUMNS} WHERE user_id = ?1 ORDER BY timestamp ASC, id ASC"
                ))?;
                let rows = stmt
                    .query_map([user_id], map_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// Append a transition stamped with the current time.
    /// See [`Self::add_verification_record_at`].
    pub async fn add_verification_record(
        &self,
        user_id: i64,
        is_verified: bool,
        reason: Option<String>,
        source: Option<String>,
    ) -> Result<VerificationHistory> {
        self.add_verification_record_at(user_id, is_verified, reason, source, Utc::now())
            .await
    }

    /// Append a transition unless the user's latest record already has the same
    /// status, in which case that record is returned unchanged and nothing is written.
    ///
    /// The check and the insert share one IMMEDIATE transaction, so two writers
    /// cannot both append the same transition.
    pub async fn add_verification_record_at(
        &self,
        user_id: i64,
        is_verified: bool,
        reason: Option<String>,
        source: Option<String>,
        timestamp: DateTime<Utc>,
    ) -> Result<VerificationHistory> {
        // Stored at millisecond precision; return what a read-back would see.
        let timestamp = timestamp.trunc_subsecs(3);
        let (record, inserted) = self
            .db
            .call_named("verification.add", move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

                if let Some(latest) = most_recent(&tx, user_id)? {
                    if latest.is_verified == is_verified {
                        return Ok((latest, false));
                    }
                }

                tx.execute(
                    "INSERT INTO verification_history (user_id, is_verified, timestamp, reason, source)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    rusqlite::params![user_id, is_verified, ts_to_sql(timestamp), reason, source],
                )?;
                let id = tx.last_insert_rowid();
                tx.commit()?;

                Ok((
                    VerificationHistory {
                        id,
                        user_id,
                        is_verified,
                        timestamp,
                        reason,
                        source,
                    },
                    true,
                ))
            })
            .await?;

        if inserted {
            tracing::info!(
                user_id,
                is_verified,
                source = record.source.as_deref().unwrap_or(""),
                "verification status changed"
            );
        } else {
            tracing::debug!(user_id, is_verified, "verification status unchanged; not logged");
        }
        Ok(record)
    }

    /// The latest record for the user, if any.
    pub async fn get_most_recent_status(&self, user_id: i64) -> Result<Option<VerificationHistory>> {
        self.db
            .call_named("verification.most_recent", move |conn| {
                Ok(most_recent(conn, user_id)?)
            })
            .await
    }

    pub async fn calculate_verified_duration(&self, user_id: i64) -> Result<Duration> {
        self.calculate_verified_duration_at(user_id, Utc::now()).await
    }

    /// Verified duration recomputed from the raw log, with open intervals closed at `now`.
    pub async fn calculate_verified_duration_at(
        &self,
        user_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Duration> {
        let history = self.get_history_for_user(user_id).await?;
        Ok(verified_duration(&history, now))
    }

    /// First and most recent timestamps at which the user became verified.
    pub async fn get_verification_dates(&self, user_id: i64) -> Result<VerificationDates> {
        self.db
            .call_named("verification.dates", move |conn| {
                let (first, last): (Option<String>, Option<String>) = conn.query_row(
                    "SELECT MIN(timestamp), MAX(timestamp) FROM verification_history
                     WHERE user_id = ?1 AND is_verified = 1",
                    [user_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?;
                Ok(VerificationDates {
                    first_verified: first.as_deref().and_then(crate::db::parse_ts),
                    most_recent_verified: last.as_deref().and_then(crate::db::parse_ts),
                })
            })
            .await
    }
}
