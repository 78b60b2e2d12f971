use anyhow::Result;
use chrono::Utc;

use crate::db::{get_decimal, ts_to_sql, AsyncDb};
use crate::types::{InvestmentPosition, NewInvestmentPosition};

/// Source of a user's brokerage holdings, as consumed by performance scoring.
pub trait HoldingsRepository {
    /// All positions across every brokerage connection the user has linked.
    fn get_holdings_for_user(
        &self,
        user_id: i64,
    ) -> impl std::future::Future<Output = Result<Vec<InvestmentPosition>>> + Send;

    /// Mark the user's holdings as refreshed. Returns false when the user has
    /// no linked brokerage connection.
    fn refresh_holdings(&self, user_id: i64)
        -> impl std::future::Future<Output = Result<bool>> + Send;
}

/// Holdings stored locally by the brokerage sync.
#[derive(Clone)]
pub struct SqliteHoldingsRepository {
    db: AsyncDb,
}

impl SqliteHoldingsRepository {
    pub fn new(db: AsyncDb) -> Self {
        Self { db }
    }

    pub async fn add_connection(&self, user_id: i64, institution_name: &str) -> Result<i64> {
        let institution_name = institution_name.to_string();
        self.db
            .call_named("holdings.add_connection", move |conn| {
                conn.execute(
                    "INSERT INTO plaid_connections (user_id, institution_name) VALUES (?1, ?2)",
                    rusqlite::params![user_id, institution_name],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await
    }

    /// Replace every position of one connection with `positions` in a single
    /// transaction. Returns the number of positions written.
    pub async fn replace_positions(
        &self,
        connection_id: i64,
        positions: Vec<NewInvestmentPosition>,
    ) -> Result<usize> {
        self.db
            .call_named("holdings.replace_positions", move |conn| {
                let tx = conn.transaction()?;
                let exists: bool = tx.query_row(
                    "SELECT COUNT(*) > 0 FROM plaid_connections WHERE id = ?1",
                    [connection_id],
                    |row| row.get(0),
                )?;
                anyhow::ensure!(exists, "plaid connection {connection_id} not found");

                tx.execute(
                    "DELETE FROM investment_positions WHERE plaid_connection_id = ?1",
                    [connection_id],
                )?;
                {
                    let mut stmt = tx.prepare(
                        "INSERT INTO investment_positions
                           (plaid_connection_id, symbol, quantity, cost_basis, current_price)
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                    )?;
                    for p in &positions {
                        stmt.execute(rusqlite::params![
                            connection_id,
                            p.symbol,
                            p.quantity.to_string(),
                            p.cost_basis.to_string(),
                            p.current_price.to_string(),
                        ])?;
                    }
                }
                tx.execute(
                    "UPDATE plaid_connections SET last_synced_at = ?2 WHERE id = ?1",
                    rusqlite::params![connection_id, ts_to_sql(Utc::now())],
                )?;
                tx.commit()?;
                Ok(positions.len())
            })
            .await
    }
}

impl HoldingsRepository for SqliteHoldingsRepository {
    async fn get_holdings_for_user(&self, user_id: i64) -> Result<Vec<InvestmentPosition>> {
        self.db
            .call_named("holdings.for_user", move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT ip.id, ip.plaid_connection_id, ip.symbol,
                            ip.quantity, ip.cost_basis, ip.current_price
                     FROM investment_positions ip
                     JOIN plaid_connections pc ON pc.id = ip.plaid_connection_id
                     WHERE pc.user_id = ?1
                     ORDER BY ip.id",
                )?;
                let rows = stmt
                    .query_map([user_id], |row| {
                        Ok(InvestmentPosition {
                            id: row.get(0)?,
                            plaid_connection_id: row.get(1)?,
                            symbol: row.get(2)?,
                            quantity: get_decimal(row, 3)?,
                            cost_basis: get_decimal(row, 4)?,
                            current_price: get_decimal(row, 5)?,
                        })
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    async fn refresh_holdings(&self, user_id: i64) -> Result<bool> {
        let refreshed = self
            .db
            .call_named("holdings.refresh", move |conn| {
                let n = conn.execute(
                    "UPDATE plaid_connections SET last_synced_at = ?2 WHERE user_id = ?1",
                    rusqlite::params![user_id, ts_to_sql(Utc::now())],
                )?;
                Ok(n > 0)
            })
            .await?;
        tracing::debug!(user_id, refreshed, "holdings refresh");
        Ok(refreshed)
    }
}
