//! Composite trust score for a user's investment performance.
//!
//! Three sub-scores on a 0-100 scale are combined by weight:
//! share of holdings in the green, portfolio growth since the user's latest
//! post, and how long the user has held verified status.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::BTreeMap;

use crate::config;
use crate::db::AsyncDb;
use crate::holdings::HoldingsRepository;
use crate::types::{InvestmentPosition, PerformanceScore, UserScoringProfile};
use crate::users::UserRepository;
use crate::verification::VerificationHistoryRepository;

pub const HOLDINGS_IN_GREEN: &str = "Holdings in Green";
pub const PORTFOLIO_GROWTH: &str = "Portfolio Growth";
pub const VERIFICATION_DURATION: &str = "Verification Duration";

const HUNDRED: Decimal = dec!(100);
const NEUTRAL: Decimal = dec!(50);
const SECONDS_PER_DAY: Decimal = dec!(86400);

/// Why a user has no score.
#[derive(Debug, thiserror::Error)]
pub enum NotRated {
    #[error("user {0} not found")]
    UnknownUser(i64),
    #[error("plaid is not enabled")]
    PlaidDisabled,
    #[error("user has no posts")]
    NoPosts,
    #[error("user has no holdings")]
    NoHoldings,
    #[error("holdings unavailable: {0:#}")]
    HoldingsUnavailable(anyhow::Error),
    #[error("portfolio value out of range")]
    PortfolioValueOverflow,
    #[error("storage error: {0:#}")]
    Storage(anyhow::Error),
}

impl NotRated {
    /// Metric label for this outcome.
    pub fn outcome(&self) -> &'static str {
        match self {
            Self::UnknownUser(_) => "unknown_user",
            Self::PlaidDisabled | Self::NoPosts | Self::NoHoldings => "ineligible",
            Self::HoldingsUnavailable(_) | Self::PortfolioValueOverflow => "holdings_error",
            Self::Storage(_) => "storage_error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScoreWeights {
    pub holdings_in_green: Decimal,
    pub portfolio_growth: Decimal,
    pub verification_duration: Decimal,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            holdings_in_green: dec!(0.50),
            portfolio_growth: dec!(0.30),
            verification_duration: dec!(0.20),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScoringSettings {
    pub weights: ScoreWeights,
    /// Growth percent that maps to a sub-score of 100.
    pub growth_full_scale_pct: Decimal,
    pub verification_ceiling_days: u32,
}

impl Default for ScoringSettings {
    fn default() -> Self {
        Self {
            weights: ScoreWeights::default(),
            growth_full_scale_pct: dec!(20),
            verification_ceiling_days: 365,
        }
    }
}

fn decimal_from_config(x: f64) -> Decimal {
    // Config values are validated non-negative and finite; 6 dp is plenty for weights.
    Decimal::try_from(x).unwrap_or(Decimal::ZERO).round_dp(6)
}

impl From<&config::PerformanceScore> for ScoringSettings {
    fn from(c: &config::PerformanceScore) -> Self {
        Self {
            weights: ScoreWeights {
                holdings_in_green: decimal_from_config(c.holdings_in_green_weight),
                portfolio_growth: decimal_from_config(c.portfolio_growth_weight),
                verification_duration: decimal_from_config(c.verification_duration_weight),
            },
            growth_full_scale_pct: decimal_from_config(c.growth_full_scale_pct),
            verification_ceiling_days: c.verification_ceiling_days,
        }
    }
}

/// Round to cents and fix the scale, so scores always carry two decimals.
fn two_dp(x: Decimal) -> Decimal {
    let mut v = x.round_dp(2);
    v.rescale(2);
    v
}

fn clamp_score(x: Decimal) -> Decimal {
    x.clamp(Decimal::ZERO, HUNDRED)
}

/// Account half of the gate: Plaid linked and at least one post.
fn check_account_requirements(profile: &UserScoringProfile) -> Result<(), NotRated> {
    if !profile.plaid_enabled {
        return Err(NotRated::PlaidDisabled);
    }
    if profile.post_count < 1 {
        return Err(NotRated::NoPosts);
    }
    Ok(())
}

/// Gate for scoring: Plaid linked, at least one post, at least one holding.
pub fn check_minimum_requirements(profile: &UserScoringProfile) -> Result<(), NotRated> {
    check_account_requirements(profile)?;
    if profile.holdings_count < 1 {
        return Err(NotRated::NoHoldings);
    }
    Ok(())
}

pub fn meets_minimum_requirements(profile: &UserScoringProfile) -> bool {
    check_minimum_requirements(profile).is_ok()
}

/// Percent of positions (by count) whose current price is above cost basis.
pub fn holdings_in_green_score(holdings: &[InvestmentPosition]) -> Decimal {
    if holdings.is_empty() {
        return Decimal::ZERO;
    }
    let green = holdings.iter().filter(|h| h.is_in_green()).count();
    clamp_score(Decimal::from(green) * HUNDRED / Decimal::from(holdings.len()))
}

/// 50 at zero growth, moving linearly to 100 at `+full_scale_pct` and 0 at
/// `-full_scale_pct`. Neutral without a positive baseline.
pub fn portfolio_growth_score(
    current_value: Decimal,
    baseline: Option<Decimal>,
    full_scale_pct: Decimal,
) -> Decimal {
    let Some(baseline) = baseline.filter(|b| *b > Decimal::ZERO) else {
        return NEUTRAL;
    };
    if full_scale_pct <= Decimal::ZERO {
        return NEUTRAL;
    }
    let score = current_value
        .checked_sub(baseline)
        .and_then(|diff| diff.checked_div(baseline))
        .and_then(|ratio| ratio.checked_mul(HUNDRED))
        .and_then(|growth_pct| growth_pct.checked_mul(NEUTRAL))
        .and_then(|x| x.checked_div(full_scale_pct))
        .and_then(|x| x.checked_add(NEUTRAL));
    match score {
        Some(score) => clamp_score(score),
        // Too large to represent, so far past either end of the scale.
        None if current_value > baseline => HUNDRED,
        None if current_value < baseline => Decimal::ZERO,
        None => NEUTRAL,
    }
}

/// Verified tenure as a share of `ceiling_days`, capped at 100.
pub fn verification_duration_score(verified: Duration, ceiling_days: u32) -> Decimal {
    if ceiling_days == 0 {
        return Decimal::ZERO;
    }
    let days = Decimal::from(verified.num_seconds().max(0)) / SECONDS_PER_DAY;
    clamp_score(days * HUNDRED / Decimal::from(ceiling_days))
}

/// Weighted mean of the three sub-scores, normalized by total weight.
pub fn combine(green: Decimal, growth: Decimal, verification: Decimal, w: &ScoreWeights) -> Decimal {
    let Some(total_w) = w
        .holdings_in_green
        .checked_add(w.portfolio_growth)
        .and_then(|t| t.checked_add(w.verification_duration))
        .filter(|t| *t > Decimal::ZERO)
    else {
        return Decimal::ZERO;
    };
    // Normalize weights first so each term stays within 0..=100.
    let weighted = [
        (w.holdings_in_green, green),
        (w.portfolio_growth, growth),
        (w.verification_duration, verification),
    ]
    .into_iter()
    .try_fold(Decimal::ZERO, |acc, (weight, score)| {
        let term = weight.checked_div(total_w)?.checked_mul(clamp_score(score))?;
        acc.checked_add(term)
    });
    weighted.map_or(Decimal::ZERO, clamp_score)
}

pub struct PerformanceScoreRepository<H> {
    users: UserRepository,
    verification: VerificationHistoryRepository,
    holdings: H,
    settings: ScoringSettings,
}

impl<H: HoldingsRepository + Sync> PerformanceScoreRepository<H> {
    pub fn new(db: AsyncDb, holdings: H, settings: ScoringSettings) -> Self {
        Self {
            users: UserRepository::new(db.clone()),
            verification: VerificationHistoryRepository::new(db),
            holdings,
            settings,
        }
    }

    /// The gate as scoring applies it: holdings are counted from the injected
    /// holdings source, not from the stored snapshot.
    pub async fn meets_minimum_requirements(&self, user_id: i64) -> anyhow::Result<bool> {
        let Some(profile) = self.users.scoring_profile(user_id).await? else {
            return Ok(false);
        };
        if check_account_requirements(&profile).is_err() {
            return Ok(false);
        }
        let holdings = self.holdings.get_holdings_for_user(user_id).await?;
        Ok(!holdings.is_empty())
    }

    /// Score for `user_id`. Never fails: users who cannot be scored, for any
    /// reason, get [`PerformanceScore::unrated`].
    pub async fn calculate_performance_score(&self, user_id: i64) -> PerformanceScore {
        self.calculate_performance_score_at(user_id, Utc::now()).await
    }

    pub async fn calculate_performance_score_at(
        &self,
        user_id: i64,
        now: DateTime<Utc>,
    ) -> PerformanceScore {
        let outcome = self.try_score(user_id, now).await;
        let label = match &outcome {
            Ok(_) => "rated",
            Err(e) => e.outcome(),
        };
        metrics::counter!("trusttrade_performance_scores_total", "outcome" => label).increment(1);

        match outcome {
            Ok(score) => {
                tracing::debug!(user_id, score = %score.score, "performance score calculated");
                score
            }
            Err(
                e @ (NotRated::HoldingsUnavailable(_)
                | NotRated::PortfolioValueOverflow
                | NotRated::Storage(_)),
            ) => {
                tracing::error!(user_id, error = %e, "performance score unavailable");
                PerformanceScore::unrated()
            }
            Err(e) => {
                tracing::debug!(user_id, reason = %e, "user not rated");
                PerformanceScore::unrated()
            }
        }
    }

    async fn try_score(&self, user_id: i64, now: DateTime<Utc>) -> Result<PerformanceScore, NotRated> {
        let profile = self
            .users
            .scoring_profile(user_id)
            .await
            .map_err(NotRated::Storage)?
            .ok_or(NotRated::UnknownUser(user_id))?;
        check_account_requirements(&profile)?;

        // Counted here rather than from `profile.holdings_count`, which only
        // sees positions stored in SQLite.
        let holdings = self
            .holdings
            .get_holdings_for_user(user_id)
            .await
            .map_err(NotRated::HoldingsUnavailable)?;
        if holdings.is_empty() {
            return Err(NotRated::NoHoldings);
        }

        let verified = self
            .verification
            .calculate_verified_duration_at(user_id, now)
            .await
            .map_err(NotRated::Storage)?;

        let current_value = holdings
            .iter()
            .try_fold(Decimal::ZERO, |acc, h| acc.checked_add(h.market_value()?))
            .ok_or(NotRated::PortfolioValueOverflow)?;

        let green = two_dp(holdings_in_green_score(&holdings));
        let growth = two_dp(portfolio_growth_score(
            current_value,
            profile.last_post_portfolio_value,
            self.settings.growth_full_scale_pct,
        ));
        let verification = two_dp(verification_duration_score(
            verified,
            self.settings.verification_ceiling_days,
        ));

        let score = two_dp(combine(green, growth, verification, &self.settings.weights));

        let breakdown = BTreeMap::from([
            (HOLDINGS_IN_GREEN.to_string(), green),
            (PORTFOLIO_GROWTH.to_string(), growth),
            (VERIFICATION_DURATION.to_string(), verification),
        ]);
        Ok(PerformanceScore {
            score,
            is_rated: true,
            breakdown,
        })
    }
}
