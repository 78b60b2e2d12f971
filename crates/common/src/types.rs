use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;

/// A holding: a quantity of a security at a per-unit cost basis and current price.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvestmentPosition {
    pub id: i64,
    pub plaid_connection_id: i64,
    pub symbol: Option<String>,
    pub quantity: Decimal,
    pub cost_basis: Decimal,
    pub current_price: Decimal,
}

impl InvestmentPosition {
    /// `None` when the product overflows `Decimal`.
    pub fn gain_loss(&self) -> Option<Decimal> {
        self.current_price
            .checked_sub(self.cost_basis)?
            .checked_mul(self.quantity)
    }

    /// `None` when the product overflows `Decimal`.
    pub fn market_value(&self) -> Option<Decimal> {
        self.quantity.checked_mul(self.current_price)
    }

    pub fn is_in_green(&self) -> bool {
        self.current_price > self.cost_basis
    }
}

/// Position data as delivered by a brokerage sync, before it has a row id.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
pub struct NewInvestmentPosition {
    pub symbol: Option<String>,
    pub quantity: Decimal,
    pub cost_basis: Decimal,
    pub current_price: Decimal,
}

/// One verification-status transition for a user. Never updated or deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationHistory {
    pub id: i64,
    pub user_id: i64,
    pub is_verified: bool,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
    pub source: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct VerificationDates {
    pub first_verified: Option<DateTime<Utc>>,
    pub most_recent_verified: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub plaid_enabled: bool,
    pub is_verified: bool,
    pub created_at: DateTime<Utc>,
}

/// Everything the minimum-requirements gate and the growth metric need about a user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserScoringProfile {
    pub user_id: i64,
    pub plaid_enabled: bool,
    pub post_count: i64,
    /// Positions across all of the user's linked brokerage connections.
    pub holdings_count: i64,
    /// `portfolio_value_at_posting` of the most recent post, if recorded.
    pub last_post_portfolio_value: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Post {
    pub id: i64,
    pub user_id: i64,
    pub author: String,
    pub title: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub portfolio_value_at_posting: Option<Decimal>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum PostSortOrder {
    #[default]
    DateDesc,
    DateAsc,
    TitleAsc,
}

impl PostSortOrder {
    /// Parse a sort key from a query string. Unknown or missing keys fall back to `DateDesc`.
    pub fn parse(s: Option<&str>) -> Self {
        match s.map(str::trim) {
            Some("DateAsc") => Self::DateAsc,
            Some("TitleAsc") => Self::TitleAsc,
            _ => Self::DateDesc,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DateDesc => "DateDesc",
            Self::DateAsc => "DateAsc",
            Self::TitleAsc => "TitleAsc",
        }
    }

    pub(crate) fn order_by_sql(&self) -> &'static str {
        match self {
            Self::DateDesc => "p.created_at DESC, p.id DESC",
            Self::DateAsc => "p.created_at ASC, p.id ASC",
            Self::TitleAsc => "p.title COLLATE NOCASE ASC, p.id ASC",
        }
    }
}

/// Composite trust score with its named sub-scores, all on a 0-100 scale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PerformanceScore {
    pub score: Decimal,
    pub is_rated: bool,
    pub breakdown: BTreeMap<String, Decimal>,
}

impl PerformanceScore {
    /// The result for users who cannot be scored: zero, not rated, no breakdown.
    pub fn unrated() -> Self {
        Self {
            score: Decimal::ZERO,
            is_rated: false,
            breakdown: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn position(cost_basis: Decimal, current_price: Decimal, quantity: Decimal) -> InvestmentPosition {
        InvestmentPosition {
            id: 1,
            plaid_connection_id: 1,
            symbol: Some("AAPL".to_string()),
            quantity,
            cost_basis,
            current_price,
        }
    }

    #[test]
    fn test_gain_loss_uses_per_unit_difference() {
        let p = position(dec!(100), dec!(110.50), dec!(2.5));
        assert_eq!(p.gain_loss(), Some(dec!(26.25)));
        assert_eq!(p.market_value(), Some(dec!(276.25)));
        assert!(p.is_in_green());
    }

    #[test]
    fn test_flat_position_is_not_green() {
        let p = position(dec!(50), dec!(50), dec!(1));
        assert!(!p.is_in_green());
        assert_eq!(p.gain_loss(), Some(Decimal::ZERO));
    }

    #[test]
    fn test_market_value_overflow_is_none() {
        let p = position(dec!(1), Decimal::MAX, dec!(2));
        assert_eq!(p.market_value(), None);
        assert_eq!(p.gain_loss(), None);
    }

    #[test]
    fn test_unrated_score_is_empty() {
        let s = PerformanceScore::unrated();
        assert_eq!(s.score, Decimal::ZERO);
        assert!(!s.is_rated);
        assert!(s.breakdown.is_empty());
    }

    #[test]
    fn test_sort_order_parse_falls_back_to_date_desc() {
        assert_eq!(PostSortOrder::parse(None), PostSortOrder::DateDesc);
        assert_eq!(PostSortOrder::parse(Some("DateAsc")), PostSortOrder::DateAsc);
        assert_eq!(PostSortOrder::parse(Some("TitleAsc")), PostSortOrder::TitleAsc);
        assert_eq!(PostSortOrder::parse(Some("Bogus")), PostSortOrder::DateDesc);
        assert_eq!(PostSortOrder::parse(Some("")), PostSortOrder::DateDesc);
    }

    #[test]
    fn test_sort_order_as_str_round_trips_through_parse() {
        for order in [
            PostSortOrder::DateDesc,
            PostSortOrder::DateAsc,
            PostSortOrder::TitleAsc,
        ] {
            assert_eq!(PostSortOrder::parse(Some(order.as_str())), order);
        }
    }
}
