use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};
use uuid::Uuid;

use super::history::resolve_price;
use super::models::{
    ledger_total, BatchReport, ItemFailure, NewObligation, Obligation, PriceInterval,
    ReconciliationAction, ReconciliationResult,
};
use super::period::{BillingMonth, MonthRange};
use super::store::{ObligationLedger, PriceHistoryStore, SubscriptionCatalog};

/// key: billing-engine -> cooperative cancellation for long batches
///
/// Checked between subscriptions only; a subscription that has started is
/// always finished so no key is left half-reconciled.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Decision {
    Create { amount_cents: i64 },
    Update { obligation_id: Uuid, amount_cents: i64 },
    CreateDifference { amount_cents: i64 },
    NoChange,
}

/// Decision table over the key's existing records (creation order) and the
/// freshly resolved amount. Paid records are never mutation candidates; what
/// must converge on the resolved amount is the key's total over all records.
fn decide(records: &[Obligation], resolved_amount_cents: i64) -> Decision {
    let latest = match records.last() {
        Some(latest) => latest,
        None => {
            return Decision::Create {
                amount_cents: resolved_amount_cents,
            };
        }
    };
    let total = ledger_total(records);
    if total == resolved_amount_cents {
        return Decision::NoChange;
    }
    if latest.is_paid {
        Decision::CreateDifference {
            amount_cents: resolved_amount_cents - total,
        }
    } else {
        Decision::Update {
            obligation_id: latest.id,
            amount_cents: latest.amount_cents + (resolved_amount_cents - total),
        }
    }
}

fn base_result(
    subscription_id: Uuid,
    month: BillingMonth,
    action: ReconciliationAction,
) -> ReconciliationResult {
    ReconciliationResult {
        subscription_id,
        year: month.year(),
        month: month.month(),
        action,
        resolved_amount_cents: None,
        previous_total_cents: None,
        written_amount_cents: None,
        obligation_id: None,
        price_interval_id: None,
    }
}

/// key: billing-engine -> price history vs obligation ledger reconciliation
///
/// Pure logic over the store traits: resolves what each month should cost,
/// compares it with what the ledger says, and writes the smallest correction
/// that makes them agree. Re-running a batch whose inputs did not change is
/// all `no_change`. Wall-clock policy (refusing future months) belongs to
/// the callers; the engine itself never reads the clock.
pub struct ReconciliationEngine<S> {
    store: S,
}

impl<S> ReconciliationEngine<S>
where
    S: SubscriptionCatalog + PriceHistoryStore + ObligationLedger,
{
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Reconciles one month for one subscription, or for every active
    /// subscription when `subscription_id` is `None`.
    pub async fn reconcile_month(
        &self,
        subscription_id: Option<Uuid>,
        month: BillingMonth,
    ) -> Result<BatchReport> {
        self.run(subscription_id, MonthRange::single(month), None)
            .await
    }

    /// Reconciles every month of the inclusive range, oldest first, for
    /// every active subscription.
    pub async fn reconcile_range(&self, range: MonthRange) -> Result<BatchReport> {
        self.run(None, range, None).await
    }

    pub async fn reconcile_range_with_cancel(
        &self,
        range: MonthRange,
        cancel: &CancelFlag,
    ) -> Result<BatchReport> {
        self.run(None, range, Some(cancel)).await
    }

    async fn run(
        &self,
        subscription_id: Option<Uuid>,
        range: MonthRange,
        cancel: Option<&CancelFlag>,
    ) -> Result<BatchReport> {
        let months = range.months();
        let subscriptions = match subscription_id {
            Some(id) => vec![id],
            None => self.store.active_subscription_ids().await?,
        };

        let mut report = BatchReport::default();
        for subscription in &subscriptions {
            if let Some(flag) = cancel {
                if flag.is_cancelled() {
                    report.cancelled = true;
                    warn!(
                        processed = report.processed,
                        "reconciliation cancelled with subscriptions remaining"
                    );
                    break;
                }
            }

            // One history fetch per subscription; the run works on this
            // snapshot even if prices change mid-batch.
            let mut intervals = match self.store.list_intervals(*subscription).await {
                Ok(intervals) => intervals,
                Err(err) => {
                    for month in &months {
                        report.record_failure(ItemFailure {
                            subscription_id: *subscription,
                            year: month.year(),
                            month: month.month(),
                            error: format!("failed to load price history: {err:#}"),
                        });
                    }
                    continue;
                }
            };
            intervals.sort_by_key(|interval| (interval.starts_on, interval.id));

            for month in &months {
                match self.reconcile_one(*subscription, &intervals, *month).await {
                    Ok(result) => report.record(result),
                    Err(err) => report.record_failure(ItemFailure {
                        subscription_id: *subscription,
                        year: month.year(),
                        month: month.month(),
                        error: format!("{err:#}"),
                    }),
                }
            }
        }

        info!(
            subscriptions = subscriptions.len(),
            months = months.len(),
            processed = report.processed,
            created = report.created,
            updated = report.updated,
            created_difference = report.created_difference,
            no_change = report.no_change,
            skipped_no_price = report.skipped_no_price,
            failed = report.failed,
            cancelled = report.cancelled,
            "reconciliation run finished"
        );

        Ok(report)
    }

    async fn reconcile_one(
        &self,
        subscription_id: Uuid,
        intervals: &[PriceInterval],
        month: BillingMonth,
    ) -> Result<ReconciliationResult> {
        let resolved = match resolve_price(intervals, month) {
            Some(resolved) => resolved,
            None => {
                // No applicable price means no billing for the month, not a
                // zero charge. The ledger is not even read.
                return Ok(base_result(
                    subscription_id,
                    month,
                    ReconciliationAction::SkippedNoPrice,
                ));
            }
        };

        let records = self.store.list_for_month(subscription_id, month).await?;
        let previous_total = ledger_total(&records);

        let mut result = base_result(subscription_id, month, ReconciliationAction::NoChange);
        result.resolved_amount_cents = Some(resolved.amount_cents);
        result.previous_total_cents = Some(previous_total);
        result.price_interval_id = Some(resolved.interval_id);

        match decide(&records, resolved.amount_cents) {
            Decision::Create { amount_cents } => {
                let inserted = self
                    .store
                    .insert(NewObligation {
                        subscription_id,
                        month,
                        amount_cents,
                    })
                    .await?;
                result.action = ReconciliationAction::Created;
                result.written_amount_cents = Some(amount_cents);
                result.obligation_id = Some(inserted.id);
            }
            Decision::Update {
                obligation_id,
                amount_cents,
            } => {
                let applied = self.store.update_amount(obligation_id, amount_cents).await?;
                if !applied {
                    anyhow::bail!(
                        "obligation {obligation_id} was paid or removed while reconciling"
                    );
                }
                result.action = ReconciliationAction::Updated;
                result.written_amount_cents = Some(amount_cents);
                result.obligation_id = Some(obligation_id);
            }
            Decision::CreateDifference { amount_cents } => {
                let inserted = self
                    .store
                    .insert(NewObligation {
                        subscription_id,
                        month,
                        amount_cents,
                    })
                    .await?;
                result.action = ReconciliationAction::CreatedDifference;
                result.written_amount_cents = Some(amount_cents);
                result.obligation_id = Some(inserted.id);
            }
            Decision::NoChange => {}
        }

        Ok(result)
    }
}
