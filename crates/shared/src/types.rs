//! Core billing domain primitives

use chrono::{DateTime, Duration, Months, Utc};
use serde::{Deserialize, Serialize};

/// Monthly message floor for users without a paid bundle.
pub const FREE_TIER_MONTHLY_MESSAGES: i32 = 3;

/// Marker value on a bundle tier meaning "uncapped messages".
pub const UNLIMITED_MAX_MESSAGES: i32 = -1;

/// Stored stand-in for an unlimited remaining-message pool. The ledger never
/// stores true infinity; unlimited users carry this sentinel and deductions
/// skip them entirely.
pub const UNLIMITED_QUOTA_SENTINEL: i32 = 999_999_999;

/// Billing cycle of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingCycle {
    Monthly,
    Yearly,
}

impl BillingCycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingCycle::Monthly => "monthly",
            BillingCycle::Yearly => "yearly",
        }
    }

    /// Advance a timestamp by one billing period, calendar-aware (Jan 31 +
    /// one month lands on the last day of February).
    pub fn advance(&self, from: DateTime<Utc>) -> DateTime<Utc> {
        let months = match self {
            BillingCycle::Monthly => 1,
            BillingCycle::Yearly => 12,
        };
        from.checked_add_months(Months::new(months))
            .unwrap_or_else(|| from + Duration::days(30 * i64::from(months)))
    }
}

impl std::fmt::Display for BillingCycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for BillingCycle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "monthly" => Ok(BillingCycle::Monthly),
            "yearly" => Ok(BillingCycle::Yearly),
            other => Err(format!("unknown billing cycle: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn advance_monthly_clamps_to_month_end() {
        let jan31 = Utc.with_ymd_and_hms(2025, 1, 31, 12, 0, 0).unwrap();
        let next = BillingCycle::Monthly.advance(jan31);
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 2, 28, 12, 0, 0).unwrap());
    }

    #[test]
    fn advance_yearly_adds_twelve_months() {
        let start = Utc.with_ymd_and_hms(2025, 6, 15, 0, 0, 0).unwrap();
        let next = BillingCycle::Yearly.advance(start);
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 6, 15, 0, 0, 0).unwrap());
    }

    #[test]
    fn billing_cycle_round_trips_through_str() {
        for cycle in [BillingCycle::Monthly, BillingCycle::Yearly] {
            assert_eq!(cycle.as_str().parse::<BillingCycle>().unwrap(), cycle);
        }
        assert!("weekly".parse::<BillingCycle>().is_err());
    }
}
