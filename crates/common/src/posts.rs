use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rust_decimal::Decimal;
use serde::Serialize;

use crate::config;
use crate::db::{get_opt_decimal, get_ts, ts_to_sql, AsyncDb};
use crate::pagination::{get_pagination, total_pages};
use crate::types::{Post, PostSortOrder};

/// Tag filter shared by the page query and the count query, so both see the same set.
const CATEGORY_FILTER: &str = "EXISTS (SELECT 1 FROM post_tags pt
                                      JOIN tags t ON t.id = pt.tag_id
                                     WHERE pt.post_id = p.id AND t.tag_key = ?1)";

/// Matching key for a tag name: trimmed and lowercased (full Unicode).
pub fn tag_key(name: &str) -> String {
    name.trim().to_lowercase()
}

fn normalize_category(category: Option<&str>) -> Option<String> {
    category
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(tag_key)
}

#[derive(Debug, Clone, Default)]
pub struct NewPost {
    pub user_id: i64,
    pub title: String,
    pub content: String,
    pub tags: Vec<String>,
    pub portfolio_value_at_posting: Option<Decimal>,
    /// Defaults to the insert time.
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct PostRepository {
    db: AsyncDb,
}

impl PostRepository {
    pub fn new(db: AsyncDb) -> Self {
        Self { db }
    }

    pub async fn create_post(&self, post: NewPost) -> Result<i64> {
        self.db
            .call_named("posts.create", move |conn| {
                let tx = conn.transaction()?;
                let created_at = ts_to_sql(post.created_at.unwrap_or_else(Utc::now));
                tx.execute(
                    "INSERT INTO posts (user_id, title, content, created_at, portfolio_value_at_posting)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    rusqlite::params![
                        post.user_id,
                        post.title,
                        post.content,
                        created_at,
                        post.portfolio_value_at_posting.map(|v| v.to_string()),
                    ],
                )?;
                let post_id = tx.last_insert_rowid();

                for tag in post.tags.iter().map(|t| t.trim()).filter(|t| !t.is_empty()) {
                    // First spelling of a tag wins; later ones differing only in case reuse it.
                    let key = tag_key(tag);
                    tx.execute(
                        "INSERT INTO tags (tag_name, tag_key)
                         SELECT ?1, ?2
                          WHERE NOT EXISTS (SELECT 1 FROM tags WHERE tag_key = ?2)",
                        rusqlite::params![tag, key],
                    )?;
                    tx.execute(
                        "INSERT OR IGNORE INTO post_tags (post_id, tag_id)
                         SELECT ?1, id FROM tags WHERE tag_key = ?2 ORDER BY id LIMIT 1",
                        rusqlite::params![post_id, key],
                    )?;
                }
                tx.commit()?;
                Ok(post_id)
            })
            .await
    }

    /// One page of posts, optionally restricted to a tag (case-insensitive).
    /// Pages are 1-based; anything below 1 is read as page 1.
    pub async fn get_paged_posts(
        &self,
        category: Option<&str>,
        page: u32,
        page_size: u32,
        sort: PostSortOrder,
    ) -> Result<Vec<Post>> {
        let category = normalize_category(category);
        let limit = i64::from(page_size);
        let offset = i64::from(page.max(1) - 1) * limit;

        self.db
            .call_named("posts.paged", move |conn| {
                let filter = if category.is_some() {
                    format!("WHERE {CATEGORY_FILTER}")
                } else {
                    String::new()
                };
                let sql = format!(
                    "SELECT p.id, p.user_id, u.username, p.title, p.content,
                            p.created_at, p.portfolio_value_at_posting
                     FROM posts p
                     JOIN users u ON u.id = p.user_id
                     {filter}
                     ORDER BY {order}
                     LIMIT {limit} OFFSET {offset}",
                    order = sort.order_by_sql(),
                );
                let params: Vec<Value> = category.into_iter().map(Value::Text).collect();

                let mut stmt = conn.prepare(&sql)?;
                let mut posts = stmt
                    .query_map(rusqlite::params_from_iter(params), |row| {
                        Ok(Post {
                            id: row.get(0)?,
                            user_id: row.get(1)?,
                            author: row.get(2)?,
                            title: row.get(3)?,
                            content: row.get(4)?,
                            created_at: get_ts(row, 5)?,
                            portfolio_value_at_posting: get_opt_decimal(row, 6)?,
                            tags: Vec::new(),
                        })
                    })?
                    .collect::<std::result::Result<Vec<_>, _>>()?;

                let mut tag_stmt = conn.prepare_cached(
                    "SELECT t.tag_name FROM post_tags pt
                     JOIN tags t ON t.id = pt.tag_id
                     WHERE pt.post_id = ?1
                     ORDER BY t.tag_name COLLATE NOCASE",
                )?;
                for post in &mut posts {
                    post.tags = tag_stmt
                        .query_map([post.id], |row| row.get(0))?
                        .collect::<std::result::Result<Vec<String>, _>>()?;
                }
                Ok(posts)
            })
            .await
    }

    /// Number of posts matching the same filter as [`Self::get_paged_posts`].
    pub async fn get_total_posts(&self, category: Option<&str>) -> Result<i64> {
        let category = normalize_category(category);
        self.db
            .call_named("posts.total", move |conn| {
                let n = match category {
                    Some(c) => conn.query_row(
                        &format!("SELECT COUNT(*) FROM posts p WHERE {CATEGORY_FILTER}"),
                        [c],
                        |row| row.get(0),
                    )?,
                    None => conn.query_row("SELECT COUNT(*) FROM posts", [], |row| row.get(0))?,
                };
                Ok(n)
            })
            .await
    }
}

/// A feed page together with what a page navigator needs.
#[derive(Debug, Clone, Serialize)]
pub struct PostFeedPage {
    pub posts: Vec<Post>,
    pub category: Option<String>,
    pub sort: PostSortOrder,
    pub current_page: u32,
    pub page_size: u32,
    pub total_posts: i64,
    pub total_pages: u32,
    /// Page numbers to render, centered on `current_page`.
    pub pages: Vec<u32>,
}

#[derive(Clone)]
pub struct PostService {
    posts: PostRepository,
    feed: config::Feed,
}

impl PostService {
    pub fn new(posts: PostRepository, feed: config::Feed) -> Self {
        Self { posts, feed }
    }

    pub async fn get_feed_page(
        &self,
        category: Option<&str>,
        page: u32,
        sort: PostSortOrder,
    ) -> Result<PostFeedPage> {
        self.get_feed_page_sized(category, page, None, sort).await
    }

    /// Like [`Self::get_feed_page`] with a caller-chosen page size, capped at
    /// the configured maximum. The requested page is clamped into range.
    pub async fn get_feed_page_sized(
        &self,
        category: Option<&str>,
        page: u32,
        page_size: Option<u32>,
        sort: PostSortOrder,
    ) -> Result<PostFeedPage> {
        let page_size = page_size
            .unwrap_or(self.feed.page_size)
            .clamp(1, self.feed.max_page_size.max(1));
        let category = normalize_category(category);

        let total_posts = self.posts.get_total_posts(category.as_deref()).await?;
        let total_pages = total_pages(u64::try_from(total_posts).unwrap_or(0), page_size);
        let current_page = page.clamp(1, total_pages.max(1));

        let posts = self
            .posts
            .get_paged_posts(category.as_deref(), current_page, page_size, sort)
            .await?;
        let pages = get_pagination(current_page, total_pages, self.feed.max_pages_to_show);

        tracing::debug!(
            category = category.as_deref().unwrap_or(""),
            current_page,
            total_pages,
            returned = posts.len(),
            "feed page"
        );

        Ok(PostFeedPage {
            posts,
            category,
            sort,
            current_page,
            page_size,
            total_posts,
            total_pages,
            pages,
        })
    }
}
