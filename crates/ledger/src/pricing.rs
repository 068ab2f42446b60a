//! Pricing Calculator
//!
//! Pure functions converting tariff base prices and customer prices into owed
//! amounts for a given number of days. Amounts are whole currency units and
//! every proration rounds up.
//!
//! ## Terms
//!
//! - **owner share**: what the agent owes the owner for the days granted
//! - **customer total**: what the agent charges its customer for the same days
//! - **upgrade correction**: extra owner share when a client moves to a more
//!   expensive tariff while days remain on the cheaper one

use serde::Serialize;
use time::OffsetDateTime;

const SECONDS_PER_DAY: i64 = 86_400;

/// Ceiling division for a positive divisor.
fn ceil_div(numerator: i64, divisor: i64) -> i64 {
    let quotient = numerator / divisor;
    if numerator % divisor > 0 {
        quotient + 1
    } else {
        quotient
    }
}

/// Owner share for `days` of a tariff costing `base_price` per period.
///
/// Returns `base_price` unscaled when the period is not positive.
pub fn owner_share(days: i64, base_price: i64, period_days: i64) -> i64 {
    if period_days <= 0 {
        return base_price.max(0);
    }
    ceil_div(base_price.saturating_mul(days), period_days).max(0)
}

/// Amount charged to the customer for `days` at `monthly_price` per period. Never below 1.
pub fn customer_total(monthly_price: i64, days: i64, period_days: i64) -> i64 {
    if period_days <= 0 {
        return monthly_price.max(1);
    }
    ceil_div(monthly_price.saturating_mul(days), period_days).max(1)
}

/// Owner share for the price difference over the days left on the old tariff.
pub fn upgrade_correction(
    old_base_price: i64,
    new_base_price: i64,
    days_remaining: i64,
    period_days: i64,
) -> i64 {
    if new_base_price > old_base_price && days_remaining > 0 {
        owner_share(days_remaining, new_base_price - old_base_price, period_days)
    } else {
        0
    }
}

/// Customer-side counterpart of [`upgrade_correction`] for a raised customer price.
pub fn customer_correction(
    old_monthly_price: i64,
    new_monthly_price: i64,
    days_remaining: i64,
    period_days: i64,
) -> i64 {
    if new_monthly_price > old_monthly_price && days_remaining > 0 {
        customer_total(
            new_monthly_price - old_monthly_price,
            days_remaining,
            period_days,
        )
    } else {
        0
    }
}

/// Whole days until `expires_at`, rounded up. Zero when expired or unset.
pub fn days_left(expires_at: Option<OffsetDateTime>, now: OffsetDateTime) -> i64 {
    match expires_at {
        Some(expires_at) if expires_at > now => {
            ceil_div((expires_at - now).whole_seconds(), SECONDS_PER_DAY)
        }
        _ => 0,
    }
}

/// Price suggestions: the current price first, then the base price and a few markups.
pub fn amount_presets(base_price: i64, current_price: Option<i64>) -> Vec<i64> {
    let mut values = Vec::with_capacity(4);
    if let Some(current) = current_price.filter(|p| *p > 0) {
        values.push(current);
    }
    for value in [
        base_price,
        base_price + 30,
        base_price + 80,
        base_price.saturating_mul(2),
    ] {
        if value > 0 && !values.contains(&value) {
            values.push(value);
        }
    }
    values.truncate(4);
    values
}

/// Amounts for a new client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CreationQuote {
    pub days: i64,
    pub base_price: i64,
    pub monthly_price: i64,
    pub owner_share: i64,
    pub customer_total: i64,
    pub profit: i64,
}

impl CreationQuote {
    pub fn new(days: i64, base_price: i64, monthly_price: i64, period_days: i64) -> Self {
        let owner_share = owner_share(days, base_price, period_days);
        let customer_total = customer_total(monthly_price, days, period_days);
        Self {
            days,
            base_price,
            monthly_price,
            owner_share,
            customer_total,
            profit: customer_total - owner_share,
        }
    }
}

/// Amounts for a renewal, including tariff and price upgrade corrections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RenewalQuote {
    pub days: i64,
    pub days_left: i64,
    pub old_base_price: i64,
    pub base_price: i64,
    pub old_monthly_price: i64,
    pub monthly_price: i64,
    /// Part of `owner_share` caused by a more expensive tariff
    pub upgrade_correction: i64,
    /// Total charged to the agent
    pub owner_share: i64,
    /// Part of `customer_total` caused by a raised customer price
    pub customer_correction: i64,
    pub customer_total: i64,
    pub profit: i64,
}

/// Inputs for [`RenewalQuote::new`].
#[derive(Debug, Clone, Copy)]
pub struct RenewalTerms {
    pub days: i64,
    pub days_left: i64,
    pub old_base_price: i64,
    pub base_price: i64,
    pub old_monthly_price: i64,
    pub monthly_price: i64,
}

impl RenewalQuote {
    pub fn new(terms: RenewalTerms, period_days: i64) -> Self {
        let upgrade = upgrade_correction(
            terms.old_base_price,
            terms.base_price,
            terms.days_left,
            period_days,
        );
        let owner_share = owner_share(terms.days, terms.base_price, period_days) + upgrade;

        let customer_upgrade = customer_correction(
            terms.old_monthly_price,
            terms.monthly_price,
            terms.days_left,
            period_days,
        );
        let customer_total =
            customer_total(terms.monthly_price, terms.days, period_days) + customer_upgrade;

        Self {
            days: terms.days,
            days_left: terms.days_left,
            old_base_price: terms.old_base_price,
            base_price: terms.base_price,
            old_monthly_price: terms.old_monthly_price,
            monthly_price: terms.monthly_price,
            upgrade_correction: upgrade,
            owner_share,
            customer_correction: customer_upgrade,
            customer_total,
            profit: customer_total - owner_share,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    // =========================================================================
    // Owner share
    // =========================================================================

    #[test]
    fn test_owner_share_full_period() {
        assert_eq!(owner_share(30, 200, 30), 200);
    }

    #[test]
    fn test_owner_share_rounds_up() {
        assert_eq!(owner_share(10, 100, 30), 34);
        assert_eq!(owner_share(1, 200, 30), 7);
        assert_eq!(owner_share(90, 200, 30), 600);
    }

    #[test]
    fn test_owner_share_without_period_is_unscaled() {
        assert_eq!(owner_share(90, 200, 0), 200);
        assert_eq!(owner_share(90, 200, -5), 200);
    }

    #[test]
    fn test_owner_share_never_negative() {
        assert_eq!(owner_share(30, -50, 30), 0);
        assert_eq!(owner_share(-3, 200, 30), 0);
        assert_eq!(owner_share(0, 200, 30), 0);
    }

    #[test]
    fn test_owner_share_monotonic_in_days() {
        let mut previous = 0;
        for days in 0..=400 {
            let share = owner_share(days, 230, 30);
            assert!(share >= previous, "share dropped at {} days", days);
            previous = share;
        }
    }

    // =========================================================================
    // Customer total
    // =========================================================================

    #[test]
    fn test_customer_total_scales_with_days() {
        assert_eq!(customer_total(300, 90, 30), 900);
        assert_eq!(customer_total(300, 30, 30), 300);
        assert_eq!(customer_total(300, 7, 30), 70);
    }

    #[test]
    fn test_customer_total_at_least_one() {
        assert_eq!(customer_total(0, 30, 30), 1);
        assert_eq!(customer_total(1, 1, 30), 1);
        assert_eq!(customer_total(0, 30, 0), 1);
    }

    #[test]
    fn test_customer_total_monotonic_in_days() {
        let mut previous = 0;
        for days in 0..=400 {
            let total = customer_total(275, days, 30);
            assert!(total >= previous, "total dropped at {} days", days);
            previous = total;
        }
    }

    // =========================================================================
    // Upgrade corrections
    // =========================================================================

    #[test]
    fn test_upgrade_correction_example() {
        assert_eq!(upgrade_correction(200, 300, 10, 30), 34);
    }

    #[test]
    fn test_upgrade_correction_zero_for_downgrade_or_no_days() {
        assert_eq!(upgrade_correction(300, 200, 10, 30), 0);
        assert_eq!(upgrade_correction(200, 200, 10, 30), 0);
        assert_eq!(upgrade_correction(200, 300, 0, 30), 0);
    }

    #[test]
    fn test_customer_correction() {
        assert_eq!(customer_correction(300, 450, 10, 30), 50);
        assert_eq!(customer_correction(300, 300, 10, 30), 0);
        assert_eq!(customer_correction(300, 450, 0, 30), 0);
    }

    // =========================================================================
    // Quotes
    // =========================================================================

    #[test]
    fn test_creation_quote() {
        let quote = CreationQuote::new(30, 200, 300, 30);
        assert_eq!(quote.owner_share, 200);
        assert_eq!(quote.customer_total, 300);
        assert_eq!(quote.profit, 100);
    }

    #[test]
    fn test_renewal_quote_same_tariff() {
        let quote = RenewalQuote::new(
            RenewalTerms {
                days: 90,
                days_left: 5,
                old_base_price: 200,
                base_price: 200,
                old_monthly_price: 300,
                monthly_price: 300,
            },
            30,
        );
        assert_eq!(quote.owner_share, 600);
        assert_eq!(quote.upgrade_correction, 0);
        assert_eq!(quote.customer_total, 900);
        assert_eq!(quote.profit, 300);
    }

    #[test]
    fn test_renewal_quote_with_upgrade() {
        let quote = RenewalQuote::new(
            RenewalTerms {
                days: 30,
                days_left: 10,
                old_base_price: 200,
                base_price: 300,
                old_monthly_price: 300,
                monthly_price: 450,
            },
            30,
        );
        assert_eq!(quote.upgrade_correction, 34);
        assert_eq!(quote.owner_share, 300 + 34);
        assert_eq!(quote.customer_correction, 50);
        assert_eq!(quote.customer_total, 450 + 50);
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    #[test]
    fn test_days_left_rounds_up() {
        let now = OffsetDateTime::UNIX_EPOCH + Duration::days(100);
        assert_eq!(days_left(Some(now + Duration::hours(1)), now), 1);
        assert_eq!(days_left(Some(now + Duration::days(10)), now), 10);
        assert_eq!(days_left(Some(now + Duration::days(10) + Duration::seconds(1)), now), 11);
        assert_eq!(days_left(Some(now - Duration::days(2)), now), 0);
        assert_eq!(days_left(None, now), 0);
    }

    #[test]
    fn test_amount_presets() {
        assert_eq!(amount_presets(200, None), vec![200, 230, 280, 400]);
        assert_eq!(amount_presets(200, Some(250)), vec![250, 200, 230, 280]);
        assert_eq!(amount_presets(200, Some(230)), vec![230, 200, 280, 400]);
        assert_eq!(amount_presets(200, Some(0)), vec![200, 230, 280, 400]);
    }
}
