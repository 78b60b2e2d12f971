use anyhow::Result;
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, Row};
use rust_decimal::Decimal;
use std::str::FromStr;

/// Async database wrapper around `tokio_rusqlite::Connection`.
///
/// Runs all SQLite operations on a dedicated background thread via
/// `tokio_rusqlite`, keeping the Tokio runtime cooperative. Clone is
/// cheap (shared mpsc sender to the background thread), and every clone
/// funnels into the same connection, so calls are serialized.
#[derive(Clone)]
pub struct AsyncDb {
    conn: tokio_rusqlite::Connection,
}

impl AsyncDb {
    /// Open a database at `path` (or `:memory:`), set PRAGMAs and run migrations
    /// on the background thread.
    pub async fn open(path: &str) -> Result<Self> {
        let conn = tokio_rusqlite::Connection::open(path).await?;

        let res = conn
            .call(|conn| -> std::result::Result<(), rusqlite::Error> {
                conn.busy_timeout(std::time::Duration::from_secs(30))?;
                conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
                run_migrations(conn)?;
                Ok(())
            })
            .await;

        match res {
            Ok(()) => {}
            Err(tokio_rusqlite::Error::Error(err)) => {
                return Err(anyhow::Error::from(err).context("AsyncDb::open: migration failed"));
            }
            Err(other) => return Err(anyhow::anyhow!("AsyncDb::open: {other}")),
        }

        tracing::debug!(path, "database opened");
        Ok(Self { conn })
    }

    /// Run a closure on the background SQLite thread and return the result.
    pub async fn call<F, R>(&self, function: F) -> Result<R>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.conn.call(move |conn| function(conn)).await.map_err(
            |e: tokio_rusqlite::Error<anyhow::Error>| match e {
                tokio_rusqlite::Error::ConnectionClosed => {
                    anyhow::anyhow!("database connection closed")
                }
                tokio_rusqlite::Error::Close((_, err)) => {
                    anyhow::anyhow!("database close error: {err}")
                }
                tokio_rusqlite::Error::Error(err) => err,
                other => anyhow::anyhow!("database error: {other}"),
            },
        )
    }

    /// Like [`Self::call`], but records Prometheus metrics for DB latency and errors.
    ///
    /// Measures the full wall-clock time of the operation, including queueing
    /// on the dedicated SQLite thread.
    pub async fn call_named<F, R>(&self, op: &'static str, function: F) -> Result<R>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let start = std::time::Instant::now();
        let res = self.call(function).await;
        let ms = start.elapsed().as_secs_f64() * 1000.0;

        let status = if res.is_ok() { "ok" } else { "err" };
        metrics::histogram!(
            "trusttrade_db_query_latency_ms",
            "op" => op,
            "status" => status
        )
        .record(ms);
        if res.is_err() {
            metrics::counter!("trusttrade_db_query_errors_total", "op" => op).increment(1);
        }

        res
    }
}

fn run_migrations(conn: &Connection) -> std::result::Result<(), rusqlite::Error> {
    conn.execute_batch(SCHEMA)?;
    migrate_posts_portfolio_value(conn)?;
    migrate_connections_last_synced(conn)?;
    migrate_tags_key(conn)?;
    Ok(())
}

fn has_column(
    conn: &Connection,
    table: &str,
    column: &str,
) -> std::result::Result<bool, rusqlite::Error> {
    let n: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM pragma_table_info('{table}') WHERE name=?1"),
        rusqlite::params![column],
        |row| row.get(0),
    )?;
    Ok(n > 0)
}

/// Posts created before growth scoring have no portfolio snapshot column.
fn migrate_posts_portfolio_value(conn: &Connection) -> std::result::Result<(), rusqlite::Error> {
    if !has_column(conn, "posts", "portfolio_value_at_posting")? {
        conn.execute(
            "ALTER TABLE posts ADD COLUMN portfolio_value_at_posting TEXT",
            [],
        )?;
    }
    Ok(())
}

fn migrate_connections_last_synced(
    conn: &Connection,
) -> std::result::Result<(), rusqlite::Error> {
    if !has_column(conn, "plaid_connections", "last_synced_at")? {
        conn.execute(
            "ALTER TABLE plaid_connections ADD COLUMN last_synced_at TEXT",
            [],
        )?;
    }
    Ok(())
}

/// Tags are matched on a Unicode-lowercased key; `COLLATE NOCASE` only folds ASCII.
fn migrate_tags_key(conn: &Connection) -> std::result::Result<(), rusqlite::Error> {
    if !has_column(conn, "tags", "tag_key")? {
        conn.execute("ALTER TABLE tags ADD COLUMN tag_key TEXT", [])?;
    }
    let missing = {
        let mut stmt = conn.prepare("SELECT id, tag_name FROM tags WHERE tag_key IS NULL")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows
    };
    for (id, name) in missing {
        conn.execute(
            "UPDATE tags SET tag_key = ?2 WHERE id = ?1",
            rusqlite::params![id, crate::posts::tag_key(&name)],
        )?;
    }
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_tags_key ON tags(tag_key)",
        [],
    )?;
    Ok(())
}

// Timestamps are fixed-width RFC 3339 with millisecond precision so that
// TEXT ordering matches chronological ordering.
const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    username TEXT NOT NULL UNIQUE,
    plaid_enabled INTEGER NOT NULL DEFAULT 0,
    is_verified INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);

CREATE TABLE IF NOT EXISTS posts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL REFERENCES users(id),
    title TEXT NOT NULL,
    content TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    portfolio_value_at_posting TEXT       -- decimal as text, NULL when not captured
);

CREATE TABLE IF NOT EXISTS tags (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    tag_name TEXT NOT NULL UNIQUE COLLATE NOCASE,
    tag_key TEXT                          -- lowercased tag_name, used for matching
);

CREATE TABLE IF NOT EXISTS post_tags (
    post_id INTEGER NOT NULL REFERENCES posts(id) ON DELETE CASCADE,
    tag_id INTEGER NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
    PRIMARY KEY (post_id, tag_id)
);

CREATE TABLE IF NOT EXISTS plaid_connections (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL REFERENCES users(id),
    institution_name TEXT,
    item_id TEXT,
    last_synced_at TEXT
);

CREATE TABLE IF NOT EXISTS investment_positions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    plaid_connection_id INTEGER NOT NULL REFERENCES plaid_connections(id) ON DELETE CASCADE,
    symbol TEXT,
    quantity TEXT NOT NULL,               -- decimals as text
    cost_basis TEXT NOT NULL,             -- per unit
    current_price TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS verification_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL REFERENCES users(id),
    is_verified INTEGER NOT NULL,
    timestamp TEXT NOT NULL,
    reason TEXT,
    source TEXT                           -- admin, scheduler, import
);

CREATE TABLE IF NOT EXISTS job_status (
    job_name TEXT PRIMARY KEY,
    status TEXT NOT NULL,                 -- running, idle, failed
    last_run_at TEXT,
    duration_ms INTEGER,
    last_error TEXT,
    metadata TEXT,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_posts_user_created ON posts(user_id, created_at);
CREATE INDEX IF NOT EXISTS idx_posts_created ON posts(created_at);
CREATE INDEX IF NOT EXISTS idx_post_tags_tag ON post_tags(tag_id);
CREATE INDEX IF NOT EXISTS idx_connections_user ON plaid_connections(user_id);
CREATE INDEX IF NOT EXISTS idx_positions_connection ON investment_positions(plaid_connection_id);
CREATE INDEX IF NOT EXISTS idx_verification_user_ts ON verification_history(user_id, timestamp);
";

pub fn ts_to_sql(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a stored timestamp. Accepts RFC 3339 and SQLite's `YYYY-MM-DD HH:MM:SS`.
pub fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

fn conversion_error(
    idx: usize,
    msg: String,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, msg.into())
}

pub(crate) fn get_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    parse_ts(&s).ok_or_else(|| conversion_error(idx, format!("bad timestamp: {s}")))
}

pub(crate) fn get_decimal(row: &Row<'_>, idx: usize) -> rusqlite::Result<Decimal> {
    let s: String = row.get(idx)?;
    Decimal::from_str(&s).map_err(|e| conversion_error(idx, format!("bad decimal {s:?}: {e}")))
}

pub(crate) fn get_opt_decimal(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Decimal>> {
    let s: Option<String> = row.get(idx)?;
    s.map(|s| {
        Decimal::from_str(&s).map_err(|e| conversion_error(idx, format!("bad decimal {s:?}: {e}")))
    })
    .transpose()
}
