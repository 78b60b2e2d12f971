use anyhow::{Context, Result};
use serde::Deserialize;
use std::str::FromStr;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub general: General,
    pub database: Database,
    pub feed: Feed,
    pub performance_score: PerformanceScore,
    pub verification: Verification,
    pub observability: Observability,
    pub web: Option<Web>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct General {
    pub log_level: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Database {
    pub path: String,
}

/// Post feed paging.
#[derive(Debug, Clone, Deserialize)]
pub struct Feed {
    pub page_size: u32,
    pub max_page_size: u32,
    pub max_pages_to_show: u32,
}

impl Default for Feed {
    fn default() -> Self {
        Self {
            page_size: 10,
            max_page_size: 100,
            max_pages_to_show: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PerformanceScore {
    pub holdings_in_green_weight: f64,
    pub portfolio_growth_weight: f64,
    pub verification_duration_weight: f64,
    /// Portfolio growth (percent) that maps to a full 100 sub-score; the
    /// symmetric decline maps to 0.
    pub growth_full_scale_pct: f64,
    /// Verified tenure (days) that earns the full verification sub-score.
    pub verification_ceiling_days: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Verification {
    pub recheck_enabled: bool,
    pub recheck_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Observability {
    pub prometheus_port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Web {
    pub port: u16,
    pub host: String,
    pub api_key: Option<String>,
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from("config/default.toml")
    }

    pub fn load_from(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {path}"))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s).context("failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.feed.page_size > 0, "feed.page_size must be > 0");
        anyhow::ensure!(
            self.feed.max_page_size >= self.feed.page_size,
            "feed.max_page_size must be >= feed.page_size"
        );
        anyhow::ensure!(
            self.feed.max_pages_to_show > 0,
            "feed.max_pages_to_show must be > 0"
        );

        let ps = &self.performance_score;
        for (name, w) in [
            ("holdings_in_green_weight", ps.holdings_in_green_weight),
            ("portfolio_growth_weight", ps.portfolio_growth_weight),
            ("verification_duration_weight", ps.verification_duration_weight),
        ] {
            anyhow::ensure!(w >= 0.0, "performance_score.{name} must be >= 0");
        }
        anyhow::ensure!(
            ps.holdings_in_green_weight + ps.portfolio_growth_weight + ps.verification_duration_weight
                > 0.0,
            "performance_score weights must not all be zero"
        );
        anyhow::ensure!(
            ps.growth_full_scale_pct > 0.0,
            "performance_score.growth_full_scale_pct must be > 0"
        );
        anyhow::ensure!(
            ps.verification_ceiling_days > 0,
            "performance_score.verification_ceiling_days must be > 0"
        );
        anyhow::ensure!(
            self.verification.recheck_interval_secs > 0,
            "verification.recheck_interval_secs must be > 0"
        );
        Ok(())
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::from_toml_str(s)
    }
}
