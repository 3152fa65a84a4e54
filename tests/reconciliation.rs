use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use crm_backend::billing::{
    BillingMonth, CancelFlag, MemoryBillingStore, MonthRange, NewObligation, Obligation,
    ObligationLedger, PriceHistoryStore, PriceInterval, ReconciliationAction,
    ReconciliationEngine, SubscriptionCatalog,
};
use uuid::Uuid;

// key: billing-engine-tests -> decision table, idempotence, isolation

fn date(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).unwrap()
}

fn month(year: i32, month_number: u32) -> BillingMonth {
    BillingMonth::new(year, month_number).unwrap()
}

#[tokio::test]
async fn first_reconciliation_creates_an_unpaid_record() {
    let store = MemoryBillingStore::new();
    let subscription = store.add_subscription();
    store.add_interval(subscription, 50_000, date(2024, 1, 1), None);

    let engine = ReconciliationEngine::new(store.clone());
    let report = engine.reconcile_month(None, month(2024, 3)).await.unwrap();

    assert_eq!(report.created, 1);
    assert_eq!(report.results.len(), 1);
    assert_eq!(report.results[0].action, ReconciliationAction::Created);
    assert_eq!(report.results[0].written_amount_cents, Some(50_000));
    assert_eq!(report.results[0].previous_total_cents, Some(0));

    let records = store.obligations_for(subscription, month(2024, 3));
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].amount_cents, 50_000);
    assert!(!records[0].is_paid);
}

#[tokio::test]
async fn rerunning_an_unchanged_month_is_no_change() {
    let store = MemoryBillingStore::new();
    let subscription = store.add_subscription();
    store.add_interval(subscription, 50_000, date(2024, 1, 1), None);

    let engine = ReconciliationEngine::new(store.clone());
    engine.reconcile_month(None, month(2024, 3)).await.unwrap();
    let second = engine.reconcile_month(None, month(2024, 3)).await.unwrap();

    assert_eq!(second.no_change, 1);
    assert_eq!(second.created, 0);
    assert_eq!(store.obligations_for(subscription, month(2024, 3)).len(), 1);
}

#[tokio::test]
async fn price_rise_while_unpaid_updates_in_place() {
    let store = MemoryBillingStore::new();
    let subscription = store.add_subscription();
    store.add_interval(subscription, 30_000, date(2024, 1, 1), None);

    let engine = ReconciliationEngine::new(store.clone());
    engine.reconcile_month(None, month(2024, 6)).await.unwrap();

    store.change_price(subscription, 35_000, date(2024, 6, 1));
    let report = engine.reconcile_month(None, month(2024, 6)).await.unwrap();

    assert_eq!(report.updated, 1);
    assert_eq!(report.results[0].previous_total_cents, Some(30_000));
    assert_eq!(report.results[0].written_amount_cents, Some(35_000));

    let records = store.obligations_for(subscription, month(2024, 6));
    assert_eq!(records.len(), 1, "unpaid rewrite must not add a record");
    assert_eq!(records[0].amount_cents, 35_000);
    assert!(!records[0].is_paid);
}

#[tokio::test]
async fn price_drop_after_payment_spawns_a_negative_difference() {
    let store = MemoryBillingStore::new();
    let subscription = store.add_subscription();
    store.add_interval(subscription, 80_000, date(2024, 1, 1), None);

    let engine = ReconciliationEngine::new(store.clone());
    let first = engine.reconcile_month(None, month(2024, 4)).await.unwrap();
    let original_id = first.results[0].obligation_id.unwrap();
    assert!(store.mark_paid(original_id));

    store.change_price(subscription, 70_000, date(2024, 4, 1));
    let report = engine.reconcile_month(None, month(2024, 4)).await.unwrap();

    assert_eq!(report.created_difference, 1);
    assert_eq!(report.results[0].written_amount_cents, Some(-10_000));

    let records = store.obligations_for(subscription, month(2024, 4));
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].id, original_id);
    assert_eq!(records[0].amount_cents, 80_000, "paid record stays untouched");
    assert!(records[0].is_paid);
    assert_eq!(records[1].amount_cents, -10_000);
    assert!(!records[1].is_paid);
    assert_eq!(records[0].amount_cents + records[1].amount_cents, 70_000);
}

#[tokio::test]
async fn rerun_after_a_difference_does_not_duplicate_it() {
    let store = MemoryBillingStore::new();
    let subscription = store.add_subscription();
    store.add_interval(subscription, 80_000, date(2024, 1, 1), None);

    let engine = ReconciliationEngine::new(store.clone());
    let first = engine.reconcile_month(None, month(2024, 4)).await.unwrap();
    store.mark_paid(first.results[0].obligation_id.unwrap());
    store.change_price(subscription, 70_000, date(2024, 4, 1));
    engine.reconcile_month(None, month(2024, 4)).await.unwrap();

    let third = engine.reconcile_month(None, month(2024, 4)).await.unwrap();

    assert_eq!(third.no_change, 1);
    assert_eq!(third.created_difference, 0);
    assert_eq!(store.obligations_for(subscription, month(2024, 4)).len(), 2);
}

#[tokio::test]
async fn ledger_total_converges_on_the_latest_resolved_amount() {
    let store = MemoryBillingStore::new();
    let subscription = store.add_subscription();
    store.add_interval(subscription, 50_000, date(2024, 1, 1), None);
    let engine = ReconciliationEngine::new(store.clone());
    let target = month(2024, 2);

    let first = engine.reconcile_month(None, target).await.unwrap();
    store.mark_paid(first.results[0].obligation_id.unwrap());

    store.change_price(subscription, 60_000, date(2024, 2, 1));
    let second = engine.reconcile_month(None, target).await.unwrap();
    assert_eq!(second.created_difference, 1);
    assert_eq!(second.results[0].written_amount_cents, Some(10_000));
    store.mark_paid(second.results[0].obligation_id.unwrap());

    store.change_price(subscription, 45_000, date(2024, 2, 1));
    let third = engine.reconcile_month(None, target).await.unwrap();
    assert_eq!(third.created_difference, 1);
    assert_eq!(third.results[0].written_amount_cents, Some(-15_000));

    let records = store.obligations_for(subscription, target);
    let total: i64 = records.iter().map(|record| record.amount_cents).sum();
    assert_eq!(total, 45_000, "records must sum to the latest resolved amount");
    assert_eq!(records.len(), 3);
    assert_eq!(records[0].amount_cents, 50_000);
    assert_eq!(records[1].amount_cents, 10_000);
    assert!(records[0].is_paid && records[1].is_paid);

    let fourth = engine.reconcile_month(None, target).await.unwrap();
    assert_eq!(fourth.no_change, 1);
}

#[tokio::test]
async fn lapsed_price_history_skips_the_month_without_writing() {
    let store = MemoryBillingStore::new();
    let subscription = store.add_subscription();
    store.add_interval(subscription, 5_000, date(2024, 1, 1), Some(date(2024, 5, 1)));

    let engine = ReconciliationEngine::new(store.clone());
    let report = engine.reconcile_month(None, month(2024, 6)).await.unwrap();

    assert_eq!(report.skipped_no_price, 1);
    assert_eq!(
        report.results[0].action,
        ReconciliationAction::SkippedNoPrice
    );
    assert!(report.results[0].resolved_amount_cents.is_none());
    assert!(store.obligations_for(subscription, month(2024, 6)).is_empty());
}

#[tokio::test]
async fn boundary_months_bill_their_own_interval() {
    let store = MemoryBillingStore::new();
    let subscription = store.add_subscription();
    store.add_interval(subscription, 100, date(2024, 1, 1), Some(date(2024, 7, 1)));
    store.add_interval(subscription, 150, date(2024, 7, 1), None);

    let engine = ReconciliationEngine::new(store.clone());
    let range = MonthRange::new(month(2024, 6), month(2024, 7)).unwrap();
    let report = engine.reconcile_range(range).await.unwrap();

    assert_eq!(report.created, 2);
    assert_eq!(report.results[0].written_amount_cents, Some(100));
    assert_eq!(report.results[1].written_amount_cents, Some(150));
}

#[tokio::test]
async fn range_processes_months_chronologically_across_years() {
    let store = MemoryBillingStore::new();
    let subscription = store.add_subscription();
    store.add_interval(subscription, 9_900, date(2024, 1, 1), None);

    let engine = ReconciliationEngine::new(store.clone());
    let range = MonthRange::new(month(2024, 11), month(2025, 2)).unwrap();
    let report = engine.reconcile_range(range).await.unwrap();

    let touched: Vec<(i32, u32)> = report
        .results
        .iter()
        .map(|result| (result.year, result.month))
        .collect();
    assert_eq!(touched, vec![(2024, 11), (2024, 12), (2025, 1), (2025, 2)]);
    assert_eq!(report.created, 4);
}

#[tokio::test]
async fn zero_priced_interval_still_bills_zero() {
    let store = MemoryBillingStore::new();
    let subscription = store.add_subscription();
    store.add_interval(subscription, 0, date(2024, 1, 1), None);

    let engine = ReconciliationEngine::new(store.clone());
    let report = engine.reconcile_month(None, month(2024, 2)).await.unwrap();

    assert_eq!(report.created, 1);
    assert_eq!(report.results[0].written_amount_cents, Some(0));

    let rerun = engine.reconcile_month(None, month(2024, 2)).await.unwrap();
    assert_eq!(rerun.no_change, 1);
}

#[tokio::test]
async fn scoped_run_touches_only_the_requested_subscription() {
    let store = MemoryBillingStore::new();
    let target = store.add_subscription();
    let other = store.add_subscription();
    store.add_interval(target, 11_000, date(2024, 1, 1), None);
    store.add_interval(other, 22_000, date(2024, 1, 1), None);

    let engine = ReconciliationEngine::new(store.clone());
    let report = engine
        .reconcile_month(Some(target), month(2024, 3))
        .await
        .unwrap();

    assert_eq!(report.results.len(), 1);
    assert_eq!(report.results[0].subscription_id, target);
    assert!(store.obligations_for(other, month(2024, 3)).is_empty());
}

#[derive(Clone)]
struct FlakyHistory {
    inner: MemoryBillingStore,
    fail_for: Uuid,
}

#[async_trait]
impl SubscriptionCatalog for FlakyHistory {
    async fn active_subscription_ids(&self) -> Result<Vec<Uuid>> {
        self.inner.active_subscription_ids().await
    }
}

#[async_trait]
impl PriceHistoryStore for FlakyHistory {
    async fn list_intervals(&self, subscription_id: Uuid) -> Result<Vec<PriceInterval>> {
        if subscription_id == self.fail_for {
            anyhow::bail!("price history temporarily unavailable");
        }
        self.inner.list_intervals(subscription_id).await
    }
}

#[async_trait]
impl ObligationLedger for FlakyHistory {
    async fn list_for_month(
        &self,
        subscription_id: Uuid,
        month: BillingMonth,
    ) -> Result<Vec<Obligation>> {
        self.inner.list_for_month(subscription_id, month).await
    }

    async fn insert(&self, record: NewObligation) -> Result<Obligation> {
        self.inner.insert(record).await
    }

    async fn update_amount(&self, obligation_id: Uuid, amount_cents: i64) -> Result<bool> {
        self.inner.update_amount(obligation_id, amount_cents).await
    }
}

#[tokio::test]
async fn one_subscriptions_failure_leaves_the_rest_untouched() {
    let store = MemoryBillingStore::new();
    let flaky = store.add_subscription();
    let healthy = store.add_subscription();
    store.add_interval(flaky, 10_000, date(2024, 1, 1), None);
    store.add_interval(healthy, 20_000, date(2024, 1, 1), None);

    let engine = ReconciliationEngine::new(FlakyHistory {
        inner: store.clone(),
        fail_for: flaky,
    });
    let report = engine.reconcile_month(None, month(2024, 3)).await.unwrap();

    assert_eq!(report.failed, 1);
    assert_eq!(report.failures[0].subscription_id, flaky);
    assert!(report.failures[0].error.contains("price history"));
    assert_eq!(report.created, 1);
    assert_eq!(report.results[0].subscription_id, healthy);
    assert_eq!(store.obligations_for(healthy, month(2024, 3)).len(), 1);
    assert!(store.obligations_for(flaky, month(2024, 3)).is_empty());
}

#[derive(Clone)]
struct FlakyLedger {
    inner: MemoryBillingStore,
    fail_year: i32,
    fail_month: u32,
}

#[async_trait]
impl SubscriptionCatalog for FlakyLedger {
    async fn active_subscription_ids(&self) -> Result<Vec<Uuid>> {
        self.inner.active_subscription_ids().await
    }
}

#[async_trait]
impl PriceHistoryStore for FlakyLedger {
    async fn list_intervals(&self, subscription_id: Uuid) -> Result<Vec<PriceInterval>> {
        self.inner.list_intervals(subscription_id).await
    }
}

#[async_trait]
impl ObligationLedger for FlakyLedger {
    async fn list_for_month(
        &self,
        subscription_id: Uuid,
        month: BillingMonth,
    ) -> Result<Vec<Obligation>> {
        self.inner.list_for_month(subscription_id, month).await
    }

    async fn insert(&self, record: NewObligation) -> Result<Obligation> {
        if record.month.year() == self.fail_year && record.month.month() == self.fail_month {
            anyhow::bail!("ledger write refused");
        }
        self.inner.insert(record).await
    }

    async fn update_amount(&self, obligation_id: Uuid, amount_cents: i64) -> Result<bool> {
        self.inner.update_amount(obligation_id, amount_cents).await
    }
}

#[tokio::test]
async fn a_failed_month_does_not_abort_the_remaining_months() {
    let store = MemoryBillingStore::new();
    let subscription = store.add_subscription();
    store.add_interval(subscription, 12_000, date(2024, 1, 1), None);

    let engine = ReconciliationEngine::new(FlakyLedger {
        inner: store.clone(),
        fail_year: 2024,
        fail_month: 5,
    });
    let range = MonthRange::new(month(2024, 5), month(2024, 6)).unwrap();
    let report = engine.reconcile_range(range).await.unwrap();

    assert_eq!(report.failed, 1);
    assert_eq!(report.failures[0].month, 5);
    assert!(report.failures[0].error.contains("ledger write refused"));
    assert_eq!(report.created, 1);
    assert!(store.obligations_for(subscription, month(2024, 5)).is_empty());
    assert_eq!(store.obligations_for(subscription, month(2024, 6)).len(), 1);
}

#[derive(Clone)]
struct CancelAfterFirstHistory {
    inner: MemoryBillingStore,
    flag: CancelFlag,
}

#[async_trait]
impl SubscriptionCatalog for CancelAfterFirstHistory {
    async fn active_subscription_ids(&self) -> Result<Vec<Uuid>> {
        self.inner.active_subscription_ids().await
    }
}

#[async_trait]
impl PriceHistoryStore for CancelAfterFirstHistory {
    async fn list_intervals(&self, subscription_id: Uuid) -> Result<Vec<PriceInterval>> {
        let intervals = self.inner.list_intervals(subscription_id).await;
        // Request cancellation while the first subscription is in flight.
        self.flag.cancel();
        intervals
    }
}

#[async_trait]
impl ObligationLedger for CancelAfterFirstHistory {
    async fn list_for_month(
        &self,
        subscription_id: Uuid,
        month: BillingMonth,
    ) -> Result<Vec<Obligation>> {
        self.inner.list_for_month(subscription_id, month).await
    }

    async fn insert(&self, record: NewObligation) -> Result<Obligation> {
        self.inner.insert(record).await
    }

    async fn update_amount(&self, obligation_id: Uuid, amount_cents: i64) -> Result<bool> {
        self.inner.update_amount(obligation_id, amount_cents).await
    }
}

#[tokio::test]
async fn cancellation_stops_between_subscriptions_keeping_partial_results() {
    let store = MemoryBillingStore::new();
    let first = store.add_subscription();
    let second = store.add_subscription();
    let third = store.add_subscription();
    for subscription in [first, second, third] {
        store.add_interval(subscription, 7_500, date(2024, 1, 1), None);
    }

    let flag = CancelFlag::new();
    let engine = ReconciliationEngine::new(CancelAfterFirstHistory {
        inner: store.clone(),
        flag: flag.clone(),
    });
    let range = MonthRange::new(month(2024, 1), month(2024, 2)).unwrap();
    let report = engine
        .reconcile_range_with_cancel(range, &flag)
        .await
        .unwrap();

    assert!(report.cancelled);
    // The in-flight subscription finishes both months; the rest never start.
    assert_eq!(report.created, 2);
    assert!(report
        .results
        .iter()
        .all(|result| result.subscription_id == first));
    assert!(store.obligations_for(second, month(2024, 1)).is_empty());
    assert!(store.obligations_for(third, month(2024, 1)).is_empty());
}

#[derive(Clone)]
struct StubbornLedger {
    inner: MemoryBillingStore,
}

#[async_trait]
impl SubscriptionCatalog for StubbornLedger {
    async fn active_subscription_ids(&self) -> Result<Vec<Uuid>> {
        self.inner.active_subscription_ids().await
    }
}

#[async_trait]
impl PriceHistoryStore for StubbornLedger {
    async fn list_intervals(&self, subscription_id: Uuid) -> Result<Vec<PriceInterval>> {
        self.inner.list_intervals(subscription_id).await
    }
}

#[async_trait]
impl ObligationLedger for StubbornLedger {
    async fn list_for_month(
        &self,
        subscription_id: Uuid,
        month: BillingMonth,
    ) -> Result<Vec<Obligation>> {
        self.inner.list_for_month(subscription_id, month).await
    }

    async fn insert(&self, record: NewObligation) -> Result<Obligation> {
        self.inner.insert(record).await
    }

    async fn update_amount(&self, _obligation_id: Uuid, _amount_cents: i64) -> Result<bool> {
        // Behaves like a record that got paid between the read and the write.
        Ok(false)
    }
}

#[tokio::test]
async fn racing_payment_surfaces_as_an_item_failure() {
    let store = MemoryBillingStore::new();
    let subscription = store.add_subscription();
    store.add_interval(subscription, 30_000, date(2024, 1, 1), None);

    let seed = ReconciliationEngine::new(store.clone());
    seed.reconcile_month(None, month(2024, 6)).await.unwrap();
    store.change_price(subscription, 35_000, date(2024, 6, 1));

    let engine = ReconciliationEngine::new(StubbornLedger {
        inner: store.clone(),
    });
    let report = engine.reconcile_month(None, month(2024, 6)).await.unwrap();

    assert_eq!(report.failed, 1);
    assert!(report.failures[0].error.contains("paid or removed"));
    let records = store.obligations_for(subscription, month(2024, 6));
    assert_eq!(records[0].amount_cents, 30_000, "no silent write on conflict");
}
