use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::period::BillingMonth;

/// key: billing-models -> price history entry
///
/// Validity is half-open: `starts_on` inclusive, `ends_on` exclusive,
/// `ends_on = NULL` meaning still in effect. History entries are closed when
/// superseded, never rewritten or deleted.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PriceInterval {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub amount_cents: i64,
    pub starts_on: NaiveDate,
    pub ends_on: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
}

impl PriceInterval {
    pub fn applies_on(&self, on: NaiveDate) -> bool {
        if on < self.starts_on {
            return false;
        }
        match self.ends_on {
            Some(end) => on < end,
            None => true,
        }
    }
}

/// key: billing-models -> obligation ledger record
///
/// More than one record may exist per (subscription_id, year, month):
/// corrections issued after a payment share the key, and the month's true
/// total is the sum over all of them. `seq` is the explicit creation order.
/// `amount_cents` is signed so that correction records can refund.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Obligation {
    pub id: Uuid,
    pub seq: i64,
    pub subscription_id: Uuid,
    pub year: i32,
    pub month: i32,
    pub amount_cents: i64,
    pub is_paid: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Insert payload for the ledger. New records always start unpaid.
#[derive(Debug, Clone)]
pub struct NewObligation {
    pub subscription_id: Uuid,
    pub month: BillingMonth,
    pub amount_cents: i64,
}

/// Sum of all ledger records for one key, correction records included.
pub fn ledger_total(records: &[Obligation]) -> i64 {
    records.iter().map(|record| record.amount_cents).sum()
}

/// key: billing-report -> per subscription-month reconciliation outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconciliationAction {
    Created,
    Updated,
    CreatedDifference,
    NoChange,
    SkippedNoPrice,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationResult {
    pub subscription_id: Uuid,
    pub year: i32,
    pub month: u32,
    pub action: ReconciliationAction,
    pub resolved_amount_cents: Option<i64>,
    pub previous_total_cents: Option<i64>,
    pub written_amount_cents: Option<i64>,
    pub obligation_id: Option<Uuid>,
    pub price_interval_id: Option<Uuid>,
}

/// A (subscription, month) item the batch could not settle. Siblings are
/// unaffected; retrying is the caller's call.
#[derive(Debug, Clone, Serialize)]
pub struct ItemFailure {
    pub subscription_id: Uuid,
    pub year: i32,
    pub month: u32,
    pub error: String,
}

/// key: billing-report -> aggregate outcome of one reconciliation run
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub results: Vec<ReconciliationResult>,
    pub failures: Vec<ItemFailure>,
    pub processed: u32,
    pub created: u32,
    pub updated: u32,
    pub created_difference: u32,
    pub no_change: u32,
    pub skipped_no_price: u32,
    pub failed: u32,
    pub cancelled: bool,
}

impl BatchReport {
    pub fn record(&mut self, result: ReconciliationResult) {
        self.processed += 1;
        match result.action {
            ReconciliationAction::Created => self.created += 1,
            ReconciliationAction::Updated => self.updated += 1,
            ReconciliationAction::CreatedDifference => self.created_difference += 1,
            ReconciliationAction::NoChange => self.no_change += 1,
            ReconciliationAction::SkippedNoPrice => self.skipped_no_price += 1,
        }
        self.results.push(result);
    }

    pub fn record_failure(&mut self, failure: ItemFailure) {
        self.processed += 1;
        self.failed += 1;
        self.failures.push(failure);
    }
}
