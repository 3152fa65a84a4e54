use chrono::NaiveDate;
use tracing::warn;
use uuid::Uuid;

use super::models::PriceInterval;
use super::period::BillingMonth;

/// key: billing-history -> price resolved for one month
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedPrice {
    pub amount_cents: i64,
    pub interval_id: Uuid,
}

/// Picks the interval in effect on `on`. Intervals for one subscription are
/// not supposed to overlap; when they do, the latest `starts_on` wins, then
/// the largest id, and the pick is logged as a data-quality warning.
pub fn interval_on(intervals: &[PriceInterval], on: NaiveDate) -> Option<&PriceInterval> {
    let mut best: Option<&PriceInterval> = None;
    let mut matched = 0usize;
    for interval in intervals.iter().filter(|interval| interval.applies_on(on)) {
        matched += 1;
        let replace = match best {
            Some(current) => (interval.starts_on, interval.id) > (current.starts_on, current.id),
            None => true,
        };
        if replace {
            best = Some(interval);
        }
    }
    if matched > 1 {
        if let Some(winner) = best {
            warn!(
                subscription = %winner.subscription_id,
                date = %on,
                matched,
                chosen = %winner.id,
                "overlapping price intervals, using the most recent start"
            );
        }
    }
    best
}

/// Resolves the amount owed for `month`, judged at its first calendar day.
/// `None` means the month has no applicable price and must be skipped, never
/// billed at zero.
pub fn resolve_price(intervals: &[PriceInterval], month: BillingMonth) -> Option<ResolvedPrice> {
    interval_on(intervals, month.first_day()).map(|interval| ResolvedPrice {
        amount_cents: interval.amount_cents,
        interval_id: interval.id,
    })
}
