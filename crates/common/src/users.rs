use anyhow::Result;
use rusqlite::OptionalExtension;

use crate::db::{get_opt_decimal, get_ts, AsyncDb};
use crate::types::{User, UserScoringProfile};

#[derive(Clone)]
pub struct UserRepository {
    db: AsyncDb,
}

impl UserRepository {
    pub fn new(db: AsyncDb) -> Self {
        Self { db }
    }

    pub async fn create_user(&self, username: &str, plaid_enabled: bool) -> Result<i64> {
        let username = username.to_string();
        self.db
            .call_named("users.create", move |conn| {
                conn.execute(
                    "INSERT INTO users (username, plaid_enabled) VALUES (?1, ?2)",
                    rusqlite::params![username, plaid_enabled],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await
    }

    pub async fn get_user(&self, user_id: i64) -> Result<Option<User>> {
        self.db
            .call_named("users.get", move |conn| {
                let user = conn
                    .query_row(
                        "SELECT id, username, plaid_enabled, is_verified, created_at
                         FROM users WHERE id = ?1",
                        [user_id],
                        |row| {
                            Ok(User {
                                id: row.get(0)?,
                                username: row.get(1)?,
                                plaid_enabled: row.get(2)?,
                                is_verified: row.get(3)?,
                                created_at: get_ts(row, 4)?,
                            })
                        },
                    )
                    .optional()?;
                Ok(user)
            })
            .await
    }

    pub async fn list_user_ids(&self) -> Result<Vec<i64>> {
        self.db
            .call_named("users.list_ids", |conn| {
                let mut stmt = conn.prepare("SELECT id FROM users ORDER BY id")?;
                let ids = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<std::result::Result<Vec<i64>, _>>()?;
                Ok(ids)
            })
            .await
    }

    pub async fn set_plaid_enabled(&self, user_id: i64, enabled: bool) -> Result<bool> {
        self.db
            .call_named("users.set_plaid_enabled", move |conn| {
                let n = conn.execute(
                    "UPDATE users SET plaid_enabled = ?2 WHERE id = ?1",
                    rusqlite::params![user_id, enabled],
                )?;
                Ok(n > 0)
            })
            .await
    }

    /// Update the cached verification flag. Returns false when the user does not exist.
    pub async fn set_verified(&self, user_id: i64, is_verified: bool) -> Result<bool> {
        self.db
            .call_named("users.set_verified", move |conn| {
                let n = conn.execute(
                    "UPDATE users SET is_verified = ?2 WHERE id = ?1",
                    rusqlite::params![user_id, is_verified],
                )?;
                Ok(n > 0)
            })
            .await
    }

    /// Load the snapshot the minimum-requirements gate and growth metric read.
    /// `None` when the user does not exist.
    pub async fn scoring_profile(&self, user_id: i64) -> Result<Option<UserScoringProfile>> {
        self.db
            .call_named("users.scoring_profile", move |conn| {
                let profile = conn
                    .query_row(
                        "SELECT u.id, u.plaid_enabled,
                                (SELECT COUNT(*) FROM posts p WHERE p.user_id = u.id),
                                (SELECT COUNT(*) FROM investment_positions ip
                                   JOIN plaid_connections pc ON pc.id = ip.plaid_connection_id
                                  WHERE pc.user_id = u.id),
                                (SELECT p.portfolio_value_at_posting FROM posts p
                                  WHERE p.user_id = u.id
                                  ORDER BY p.created_at DESC, p.id DESC LIMIT 1)
                         FROM users u WHERE u.id = ?1",
                        [user_id],
                        |row| {
                            Ok(UserScoringProfile {
                                user_id: row.get(0)?,
                                plaid_enabled: row.get(1)?,
                                post_count: row.get(2)?,
                                holdings_count: row.get(3)?,
                                last_post_portfolio_value: get_opt_decimal(row, 4)?,
                            })
                        },
                    )
                    .optional()?;
                Ok(profile)
            })
            .await
    }
}
