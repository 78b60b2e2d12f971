pub mod config;
pub mod db;
pub mod holdings;
pub mod observability;
pub mod pagination;
pub mod performance;
pub mod posts;
pub mod types;
pub mod users;
pub mod verification;
