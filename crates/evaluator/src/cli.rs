use anyhow::{Context, Result};
use common::config::Config;
use common::db::AsyncDb;
use common::holdings::SqliteHoldingsRepository;
use common::performance::{PerformanceScoreRepository, ScoringSettings};
use common::posts::{PostFeedPage, PostRepository, PostService};
use common::types::{
    NewInvestmentPosition, PerformanceScore, PostSortOrder, VerificationDates, VerificationHistory,
};
use common::verification::VerificationHistoryRepository;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Run,
    Score { user_id: i64 },
    History { user_id: i64 },
    Feed {
        category: Option<String>,
        page: u32,
        sort: PostSortOrder,
    },
    ImportHoldings { connection_id: i64, path: PathBuf },
}

fn parse_id(arg: Option<String>, usage: &str) -> std::result::Result<i64, String> {
    let raw = arg.ok_or_else(|| usage.to_string())?;
    raw.parse()
        .map_err(|e| format!("invalid id {raw:?} ({e}); {usage}"))
}

pub fn parse_args<I>(mut args: I) -> std::result::Result<Command, String>
where
    I: Iterator<Item = String>,
{
    // Drop argv[0].
    let _ = args.next();

    let Some(cmd) = args.next() else {
        return Ok(Command::Run);
    };

    match cmd.as_str() {
        "run" => Ok(Command::Run),
        "score" => Ok(Command::Score {
            user_id: parse_id(args.next(), "usage: evaluator score <user_id>")?,
        }),
        "history" => Ok(Command::History {
            user_id: parse_id(args.next(), "usage: evaluator history <user_id>")?,
        }),
        "feed" => {
            // `-` skips the category filter so a page can still be given.
            let category = args.next().filter(|c| c != "-");
            let page = match args.next() {
                Some(p) => p.parse().map_err(|e| {
                    format!("invalid page {p:?} ({e}); usage: evaluator feed [category|-] [page] [sort]")
                })?,
                None => 1,
            };
            let sort = PostSortOrder::parse(args.next().as_deref());
            Ok(Command::Feed {
                category,
                page,
                sort,
            })
        }
        "import-holdings" => {
            let usage = "usage: evaluator import-holdings <connection_id> <file.json>";
            let connection_id = parse_id(args.next(), usage)?;
            let path = args.next().ok_or_else(|| usage.to_string())?;
            Ok(Command::ImportHoldings {
                connection_id,
                path: PathBuf::from(path),
            })
        }
        other => Err(format!("unknown command: {other}")),
    }
}

pub async fn run_command(db: &AsyncDb, cfg: &Config, cmd: Command) -> Result<()> {
    match cmd {
        Command::Run => Ok(()),
        Command::Score { user_id } => {
            let repo = PerformanceScoreRepository::new(
                db.clone(),
                SqliteHoldingsRepository::new(db.clone()),
                ScoringSettings::from(&cfg.performance_score),
            );
            let score = repo.calculate_performance_score(user_id).await;
            print!("{}", render_score(user_id, &score));
            Ok(())
        }
        Command::History { user_id } => {
            let repo = VerificationHistoryRepository::new(db.clone());
            let history = repo.get_history_for_user(user_id).await?;
            let verified = repo.calculate_verified_duration(user_id).await?;
            let dates = repo.get_verification_dates(user_id).await?;
            print!("{}", render_history(user_id, &history, verified, &dates));
            Ok(())
        }
        Command::Feed {
            category,
            page,
            sort,
        } => {
            let service = PostService::new(PostRepository::new(db.clone()), cfg.feed.clone());
            let feed = service.get_feed_page(category.as_deref(), page, sort).await?;
            print!("{}", render_feed(&feed));
            Ok(())
        }
        Command::ImportHoldings {
            connection_id,
            path,
        } => {
            let n = import_holdings(db, connection_id, &path).await?;
            println!("imported {n} positions into connection {connection_id}");
            Ok(())
        }
    }
}

/// Replace a connection's positions with the JSON array in `path`.
pub async fn import_holdings(db: &AsyncDb, connection_id: i64, path: &Path) -> Result<usize> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read holdings file: {}", path.display()))?;
    let positions: Vec<NewInvestmentPosition> =
        serde_json::from_str(&raw).context("holdings file must be a JSON array of positions")?;
    let n = SqliteHoldingsRepository::new(db.clone())
        .replace_positions(connection_id, positions)
        .await?;
    tracing::info!(connection_id, positions = n, "holdings imported");
    Ok(n)
}

pub fn render_score(user_id: i64, score: &PerformanceScore) -> String {
    let mut out = String::new();
    if !score.is_rated {
        let _ = writeln!(out, "User {user_id}: not rated");
        return out;
    }
    let _ = writeln!(out, "User {user_id}: score {}", score.score);
    for (name, value) in &score.breakdown {
        let _ = writeln!(out, "  {name:<24}{value:>7}");
    }
    out
}

pub fn render_history(
    user_id: i64,
    history: &[VerificationHistory],
    verified: chrono::Duration,
    dates: &VerificationDates,
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Verification history for user {user_id}:");
    if history.is_empty() {
        let _ = writeln!(out, "  (no records)");
    }
    for r in history {
        let _ = writeln!(
            out,
            "  {}  {:<10}  source={}  reason={}",
            common::db::ts_to_sql(r.timestamp),
            if r.is_verified { "verified" } else { "unverified" },
            r.source.as_deref().unwrap_or("-"),
            r.reason.as_deref().unwrap_or("-"),
        );
    }
    let _ = writeln!(
        out,
        "  verified for {}d {}h",
        verified.num_days(),
        verified.num_hours() % 24
    );
    let fmt = |d: Option<chrono::DateTime<chrono::Utc>>| {
        d.map_or_else(|| "-".to_string(), common::db::ts_to_sql)
    };
    let _ = writeln!(
        out,
        "  first verified {}  most recent {}",
        fmt(dates.first_verified),
        fmt(dates.most_recent_verified)
    );
    out
}

pub fn render_feed(feed: &PostFeedPage) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Posts{} sorted {} (page {}/{}, {} total):",
        feed.category
            .as_deref()
            .map_or_else(String::new, |c| format!(" in {c:?}")),
        feed.sort.as_str(),
        feed.current_page,
        feed.total_pages,
        feed.total_posts,
    );
    for p in &feed.posts {
        let _ = writeln!(
            out,
            "  #{:<5} {}  {}  by {}  [{}]",
            p.id,
            common::db::ts_to_sql(p.created_at),
            p.title,
            p.author,
            p.tags.join(", ")
        );
    }
    let pages: Vec<String> = feed
        .pages
        .iter()
        .map(|n| {
            if *n == feed.current_page {
                format!("[{n}]")
            } else {
                n.to_string()
            }
        })
        .collect();
    if !pages.is_empty() {
        let _ = writeln!(out, "  pages: {}", pages.join(" "));
    }
    out
}
