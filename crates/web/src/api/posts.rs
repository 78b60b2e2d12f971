use axum::{
    extract::{Query, State},
    Json,
};
use common::posts::PostFeedPage;
use common::types::PostSortOrder;
use serde::Deserialize;
use std::sync::Arc;

use crate::api::{internal_error, ApiError, AppState};

#[derive(Debug, Deserialize)]
pub struct FeedQuery {
    pub category: Option<String>,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
    pub sort: Option<String>,
}

pub async fn get_feed(
    State(state): State<Arc<AppState>>,
    Query(q): Query<FeedQuery>,
) -> Result<Json<PostFeedPage>, ApiError> {
    let sort = PostSortOrder::parse(q.sort.as_deref());
    let page = state
        .posts
        .get_feed_page_sized(q.category.as_deref(), q.page.unwrap_or(1), q.page_size, sort)
        .await
        .map_err(|e| internal_error(&e))?;
    Ok(Json(page))
}

#[cfg(test)]
mod tests {
    use crate::api::test_support::{get, send, test_state};
    use axum::http::StatusCode;
    use chrono::TimeZone;
    use common::posts::{NewPost, PostRepository};
    use common::users::UserRepository;

    async fn seed(db: &common::db::AsyncDb, n: u32) {
        let user_id = UserRepository::new(db.clone())
            .create_user("alice", true)
            .await
            .unwrap();
        let repo = PostRepository::new(db.clone());
        for i in 1..=n {
            let tags = if i % 2 == 0 { vec!["Crypto".to_string()] } else { vec![] };
            repo.create_post(NewPost {
                user_id,
                title: format!("post {i:02}"),
                content: "body".to_string(),
                tags,
                created_at: Some(chrono::Utc.with_ymd_and_hms(2025, 1, i, 9, 0, 0).unwrap()),
                ..NewPost::default()
            })
            .await
            .unwrap();
        }
    }

    #[tokio::test]
    async fn test_feed_defaults() {
        let (db, state) = test_state(None).await;
        seed(&db, 12).await;

        let (status, json) = send(&state, get("/api/posts")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["current_page"], 1);
        assert_eq!(json["page_size"], 10);
        assert_eq!(json["total_posts"], 12);
        assert_eq!(json["total_pages"], 2);
        assert_eq!(json["sort"], "DateDesc");
        assert_eq!(json["posts"].as_array().unwrap().len(), 10);
        assert_eq!(json["posts"][0]["title"], "post 12");
        assert_eq!(json["pages"], serde_json::json!([1, 2]));
    }

    #[tokio::test]
    async fn test_feed_category_page_and_sort() {
        let (db, state) = test_state(None).await;
        seed(&db, 12).await;

        let (status, json) = send(
            &state,
            get("/api/posts?category=crypto&page=2&page_size=4&sort=DateAsc"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["total_posts"], 6);
        assert_eq!(json["total_pages"], 2);
        assert_eq!(json["category"], "crypto");
        let titles: Vec<&str> = json["posts"]
            .as_array()
            .unwrap()
            .iter()
            .map(|p| p["title"].as_str().unwrap())
            .collect();
        assert_eq!(titles, vec!["post 10", "post 12"]);
        assert_eq!(json["posts"][0]["tags"], serde_json::json!(["Crypto"]));
    }

    #[tokio::test]
    async fn test_feed_unknown_sort_and_out_of_range_page() {
        let (db, state) = test_state(None).await;
        seed(&db, 3).await;

        let (status, json) = send(&state, get("/api/posts?sort=Popular&page=99")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["sort"], "DateDesc");
        assert_eq!(json["current_page"], 1);
        assert_eq!(json["posts"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_feed_rejects_non_numeric_page() {
        let (_db, state) = test_state(None).await;
        let (status, _) = send(&state, get("/api/posts?page=two")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
