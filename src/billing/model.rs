use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Amounts are compared with a one-cent tolerance.
pub const AMOUNT_EPSILON: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseStatus {
    Pending,
    Active,
    Inactive,
}

impl LeaseStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Inactive => "inactive",
        }
    }
}

impl FromStr for LeaseStatus {
    type Err = AppError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "active" => Ok(Self::Active),
            "inactive" => Ok(Self::Inactive),
            other => Err(AppError::BadRequest(format!(
                "Unknown lease status '{other}'."
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObligationStatus {
    Pending,
    Partial,
    Paid,
    Overdue,
}

impl ObligationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Partial => "partial",
            Self::Paid => "paid",
            Self::Overdue => "overdue",
        }
    }
}

impl FromStr for ObligationStatus {
    type Err = AppError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "partial" => Ok(Self::Partial),
            "paid" => Ok(Self::Paid),
            "overdue" => Ok(Self::Overdue),
            other => Err(AppError::BadRequest(format!(
                "Unknown billing status '{other}'."
            ))),
        }
    }
}

/// A calendar-month billing key, rendered as `YYYY-MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BillingPeriod {
    year: i32,
    month: u32,
}

impl BillingPeriod {
    pub fn new(year: i32, month: u32) -> Option<Self> {
        (1..=12).contains(&month).then_some(Self { year, month })
    }

    pub fn from_date(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    pub fn year(self) -> i32 {
        self.year
    }

    pub fn month(self) -> u32 {
        self.month
    }

    pub fn next(self) -> Self {
        if self.month == 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }

    pub fn minus_months(self, months: u32) -> Self {
        let total = i64::from(self.year) * 12 + i64::from(self.month) - 1 - i64::from(months);
        Self {
            year: total.div_euclid(12) as i32,
            month: (total.rem_euclid(12) + 1) as u32,
        }
    }

    pub fn first_day(self) -> NaiveDate {
        // month is validated at construction, so the 1st always exists
        NaiveDate::from_ymd_opt(self.year, self.month, 1).expect("month in 1..=12")
    }

    pub fn last_day(self) -> NaiveDate {
        self.next()
            .first_day()
            .pred_opt()
            .expect("month start has a predecessor")
    }

    /// Due date for this period on the lease's anchor day, clamped to
    /// the last valid day of shorter months (Jan 31 -> Feb 28/29).
    pub fn due_date(self, anchor_day: u32) -> NaiveDate {
        let day = anchor_day.clamp(1, self.last_day().day());
        NaiveDate::from_ymd_opt(self.year, self.month, day).expect("clamped day is valid")
    }
}

impl fmt::Display for BillingPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for BillingPeriod {
    type Err = AppError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let invalid =
            || AppError::BadRequest(format!("Invalid billing period '{raw}' (expected YYYY-MM)."));
        let (year, month) = raw.trim().split_once('-').ok_or_else(invalid)?;
        let year = year.parse::<i32>().map_err(|_| invalid())?;
        let month = month.parse::<u32>().map_err(|_| invalid())?;
        Self::new(year, month).ok_or_else(invalid)
    }
}

/// One tenancy's financial obligation, as read from the `leases` table.
#[derive(Debug, Clone)]
pub struct LeaseTerm {
    pub id: String,
    pub organization_id: Option<String>,
    pub tenant_id: String,
    pub unit_id: String,
    pub lease_start: Option<NaiveDate>,
    pub lease_end: Option<NaiveDate>,
    /// Fallback anchor when `lease_start` is absent.
    pub activated_on: NaiveDate,
    pub monthly_amount: f64,
    pub status: LeaseStatus,
}

impl LeaseTerm {
    /// Day-of-month that fixes the tenant's billing cadence.
    pub fn anchor_day(&self) -> u32 {
        self.lease_start.unwrap_or(self.activated_on).day()
    }
}

/// A candidate obligation produced by the generator. Not yet persisted;
/// carries no id, payment progress, or status.
#[derive(Debug, Clone, PartialEq)]
pub struct ObligationDraft {
    pub tenant_id: String,
    pub unit_id: String,
    pub organization_id: Option<String>,
    pub period: BillingPeriod,
    pub amount: f64,
    pub due_date: NaiveDate,
}

/// One calendar-month charge, as persisted in `billing_obligations`.
#[derive(Debug, Clone)]
pub struct BillingObligation {
    pub id: String,
    pub organization_id: Option<String>,
    pub tenant_id: String,
    pub unit_id: String,
    pub period: BillingPeriod,
    pub amount: f64,
    pub due_date: NaiveDate,
    pub status: ObligationStatus,
    pub paid_amount: f64,
    pub paid_date: Option<NaiveDate>,
}

/// Re-derive the status an obligation must carry given its raw fields.
///
/// paid    <=> paid_amount >= amount (overpayment included)
/// overdue <=> unpaid balance remains and due_date has passed
/// partial <=> some but not all paid, not yet due
/// pending otherwise
pub fn derive_status(
    amount: f64,
    paid_amount: f64,
    due_date: NaiveDate,
    today: NaiveDate,
) -> ObligationStatus {
    if paid_amount >= amount - AMOUNT_EPSILON {
        ObligationStatus::Paid
    } else if due_date < today {
        ObligationStatus::Overdue
    } else if paid_amount > AMOUNT_EPSILON {
        ObligationStatus::Partial
    } else {
        ObligationStatus::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn period_parses_and_renders() {
        let period: BillingPeriod = "2024-01".parse().unwrap();
        assert_eq!(period.year(), 2024);
        assert_eq!(period.month(), 1);
        assert_eq!(period.to_string(), "2024-01");

        assert!("2024-13".parse::<BillingPeriod>().is_err());
        assert!("2024".parse::<BillingPeriod>().is_err());
        assert!("07-2024".parse::<BillingPeriod>().is_err());
    }

    #[test]
    fn period_arithmetic_wraps_year_boundaries() {
        let december: BillingPeriod = "2023-12".parse().unwrap();
        assert_eq!(december.next().to_string(), "2024-01");

        let march: BillingPeriod = "2024-03".parse().unwrap();
        assert_eq!(march.minus_months(12).to_string(), "2023-03");
        assert_eq!(march.minus_months(3).to_string(), "2023-12");
        assert_eq!(march.minus_months(0), march);
    }

    #[test]
    fn periods_order_chronologically() {
        let a: BillingPeriod = "2023-12".parse().unwrap();
        let b: BillingPeriod = "2024-01".parse().unwrap();
        let c: BillingPeriod = "2024-02".parse().unwrap();
        assert!(a < b && b < c);
    }

    #[test]
    fn due_dates_clamp_to_short_months() {
        let period: BillingPeriod = "2024-02".parse().unwrap();
        assert_eq!(period.due_date(31), date(2024, 2, 29)); // leap year
        let period: BillingPeriod = "2023-02".parse().unwrap();
        assert_eq!(period.due_date(31), date(2023, 2, 28));
        let period: BillingPeriod = "2024-04".parse().unwrap();
        assert_eq!(period.due_date(31), date(2024, 4, 30));
        let period: BillingPeriod = "2024-01".parse().unwrap();
        assert_eq!(period.due_date(15), date(2024, 1, 15));
    }

    #[test]
    fn status_derivation_follows_the_invariant_table() {
        let due = date(2024, 2, 15);
        let before_due = date(2024, 2, 1);
        let after_due = date(2024, 3, 1);

        assert_eq!(
            derive_status(1200.0, 0.0, due, before_due),
            ObligationStatus::Pending
        );
        assert_eq!(
            derive_status(1200.0, 500.0, due, before_due),
            ObligationStatus::Partial
        );
        assert_eq!(
            derive_status(1200.0, 1200.0, due, before_due),
            ObligationStatus::Paid
        );
        // overpayment is still paid, even past the due date
        assert_eq!(
            derive_status(1200.0, 1500.0, due, after_due),
            ObligationStatus::Paid
        );
        // unpaid and past due
        assert_eq!(
            derive_status(1200.0, 0.0, due, after_due),
            ObligationStatus::Overdue
        );
        // partially paid and past due is overdue, not partial
        assert_eq!(
            derive_status(1200.0, 500.0, due, after_due),
            ObligationStatus::Overdue
        );
        // due today is not yet overdue
        assert_eq!(
            derive_status(1200.0, 0.0, due, due),
            ObligationStatus::Pending
        );
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            ObligationStatus::Pending,
            ObligationStatus::Partial,
            ObligationStatus::Paid,
            ObligationStatus::Overdue,
        ] {
            assert_eq!(status.as_str().parse::<ObligationStatus>().unwrap(), status);
        }
        assert!("late".parse::<ObligationStatus>().is_err());
    }

    #[test]
    fn anchor_day_prefers_lease_start() {
        let lease = LeaseTerm {
            id: "l1".to_string(),
            organization_id: None,
            tenant_id: "t1".to_string(),
            unit_id: "u1".to_string(),
            lease_start: Some(date(2024, 1, 15)),
            lease_end: None,
            activated_on: date(2024, 2, 3),
            monthly_amount: 1200.0,
            status: LeaseStatus::Active,
        };
        assert_eq!(lease.anchor_day(), 15);

        let no_start = LeaseTerm {
            lease_start: None,
            ..lease
        };
        assert_eq!(no_start.anchor_day(), 3);
    }
}
