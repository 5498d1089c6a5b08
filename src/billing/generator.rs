use chrono::NaiveDate;

use super::model::{BillingPeriod, LeaseStatus, LeaseTerm, ObligationDraft};

/// How many elapsed months a single run will backfill.
pub const DEFAULT_BACKFILL_MONTHS: u32 = 12;

/// Enumerate the calendar-month obligations a lease should have as of a
/// reference date.
///
/// Pure and side-effect free; persistence is the caller's job. Returns
/// an empty sequence (not an error) when the lease is not active or has
/// no positive monthly amount. The window runs from the later of the
/// lease start and `backfill_months` before `as_of`, through `as_of`'s
/// month, clipped to the lease end when one is set — at most
/// `backfill_months + 1` periods per call, so a lease without an end
/// date can never produce an unbounded loop.
pub fn generate_obligations(
    lease: &LeaseTerm,
    as_of: NaiveDate,
    backfill_months: u32,
) -> impl Iterator<Item = ObligationDraft> + '_ {
    let eligible = lease.status == LeaseStatus::Active && lease.monthly_amount > 0.0;

    let anchor = lease.lease_start.unwrap_or(lease.activated_on);
    let anchor_day = lease.anchor_day();

    let window_floor = BillingPeriod::from_date(as_of).minus_months(backfill_months);
    let first = BillingPeriod::from_date(anchor).max(window_floor);

    let mut last = BillingPeriod::from_date(as_of);
    if let Some(end) = lease.lease_end {
        last = last.min(BillingPeriod::from_date(end));
    }

    let bound = backfill_months as usize + 1;
    std::iter::successors(
        (eligible && first <= last).then_some(first),
        move |period| {
            let next = period.next();
            (next <= last).then_some(next)
        },
    )
    .take(bound)
    .map(move |period| ObligationDraft {
        tenant_id: lease.tenant_id.clone(),
        unit_id: lease.unit_id.clone(),
        organization_id: lease.organization_id.clone(),
        period,
        amount: lease.monthly_amount,
        due_date: period.due_date(anchor_day),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn lease(start: Option<NaiveDate>, end: Option<NaiveDate>) -> LeaseTerm {
        LeaseTerm {
            id: "lease-1".to_string(),
            organization_id: Some("org-1".to_string()),
            tenant_id: "tenant-1".to_string(),
            unit_id: "unit-1".to_string(),
            lease_start: start,
            lease_end: end,
            activated_on: start.unwrap_or_else(|| date(2024, 1, 1)),
            monthly_amount: 1200.0,
            status: LeaseStatus::Active,
        }
    }

    #[test]
    fn fresh_lease_produces_one_obligation_per_elapsed_month() {
        let lease = lease(Some(date(2024, 1, 15)), None);
        let drafts: Vec<_> =
            generate_obligations(&lease, date(2024, 3, 20), DEFAULT_BACKFILL_MONTHS).collect();

        assert_eq!(drafts.len(), 3);
        assert_eq!(drafts[0].due_date, date(2024, 1, 15));
        assert_eq!(drafts[1].due_date, date(2024, 2, 15));
        assert_eq!(drafts[2].due_date, date(2024, 3, 15));
        for draft in &drafts {
            assert_eq!(draft.amount, 1200.0);
            assert_eq!(draft.tenant_id, "tenant-1");
        }
    }

    #[test]
    fn old_leases_are_bounded_by_the_backfill_window() {
        let lease = lease(Some(date(2019, 6, 1)), None);
        let drafts: Vec<_> =
            generate_obligations(&lease, date(2024, 3, 20), DEFAULT_BACKFILL_MONTHS).collect();

        // 12 months back plus the current month.
        assert_eq!(drafts.len(), 13);
        assert_eq!(drafts[0].period.to_string(), "2023-03");
        assert_eq!(drafts[12].period.to_string(), "2024-03");
    }

    #[test]
    fn inactive_or_free_leases_generate_nothing() {
        let mut inactive = lease(Some(date(2024, 1, 1)), None);
        inactive.status = LeaseStatus::Inactive;
        assert_eq!(
            generate_obligations(&inactive, date(2024, 3, 1), DEFAULT_BACKFILL_MONTHS).count(),
            0
        );

        let mut pending = lease(Some(date(2024, 1, 1)), None);
        pending.status = LeaseStatus::Pending;
        assert_eq!(
            generate_obligations(&pending, date(2024, 3, 1), DEFAULT_BACKFILL_MONTHS).count(),
            0
        );

        let mut free = lease(Some(date(2024, 1, 1)), None);
        free.monthly_amount = 0.0;
        assert_eq!(
            generate_obligations(&free, date(2024, 3, 1), DEFAULT_BACKFILL_MONTHS).count(),
            0
        );
    }

    #[test]
    fn generation_stops_at_the_lease_end_month() {
        let lease = lease(Some(date(2024, 1, 15)), Some(date(2024, 2, 20)));
        let drafts: Vec<_> =
            generate_obligations(&lease, date(2024, 6, 1), DEFAULT_BACKFILL_MONTHS).collect();
        assert_eq!(drafts.len(), 2);
        assert_eq!(drafts[1].period.to_string(), "2024-02");
    }

    #[test]
    fn leases_starting_after_the_reference_date_generate_nothing() {
        let lease = lease(Some(date(2024, 6, 1)), None);
        assert_eq!(
            generate_obligations(&lease, date(2024, 3, 1), DEFAULT_BACKFILL_MONTHS).count(),
            0
        );
    }

    #[test]
    fn anchor_day_falls_back_to_activation_date() {
        let mut no_start = lease(None, None);
        no_start.activated_on = date(2024, 1, 7);
        let drafts: Vec<_> =
            generate_obligations(&no_start, date(2024, 2, 20), DEFAULT_BACKFILL_MONTHS).collect();
        assert_eq!(drafts.len(), 2);
        assert_eq!(drafts[0].due_date, date(2024, 1, 7));
        assert_eq!(drafts[1].due_date, date(2024, 2, 7));
    }

    #[test]
    fn month_end_anchors_clamp_but_keep_cadence() {
        let lease = lease(Some(date(2024, 1, 31)), None);
        let drafts: Vec<_> =
            generate_obligations(&lease, date(2024, 4, 10), DEFAULT_BACKFILL_MONTHS).collect();
        let due_dates: Vec<_> = drafts.iter().map(|d| d.due_date).collect();
        assert_eq!(
            due_dates,
            vec![
                date(2024, 1, 31),
                date(2024, 2, 29),
                date(2024, 3, 31),
                date(2024, 4, 30),
            ]
        );
    }

    #[test]
    fn the_sequence_is_restartable() {
        let lease = lease(Some(date(2024, 1, 15)), None);
        let first: Vec<_> =
            generate_obligations(&lease, date(2024, 3, 20), DEFAULT_BACKFILL_MONTHS).collect();
        let second: Vec<_> =
            generate_obligations(&lease, date(2024, 3, 20), DEFAULT_BACKFILL_MONTHS).collect();
        assert_eq!(first, second);
    }
}
