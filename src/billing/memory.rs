use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use uuid::Uuid;

use super::models::{NewObligation, Obligation, PriceInterval};
use super::period::BillingMonth;
use super::store::{ObligationLedger, PriceHistoryStore, SubscriptionCatalog};

/// key: billing-store -> in-memory twin of the Postgres store
///
/// Backs engine tests and local development. Wraps its state in an Arc so
/// clones share one ledger, the way a pool handle would.
#[derive(Default, Clone)]
pub struct MemoryBillingStore {
    inner: Arc<MemoryBillingStoreInner>,
}

#[derive(Default)]
struct MemoryBillingStoreInner {
    active: RwLock<Vec<Uuid>>,
    intervals: RwLock<HashMap<Uuid, Vec<PriceInterval>>>,
    obligations: RwLock<Vec<Obligation>>,
    next_seq: RwLock<i64>,
}

impl MemoryBillingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an active subscription and returns its id.
    pub fn add_subscription(&self) -> Uuid {
        let id = Uuid::new_v4();
        self.inner.active.write().unwrap().push(id);
        id
    }

    /// Seeds one price interval. `ends_on` is the exclusive upper bound,
    /// `None` for still-in-effect.
    pub fn add_interval(
        &self,
        subscription_id: Uuid,
        amount_cents: i64,
        starts_on: NaiveDate,
        ends_on: Option<NaiveDate>,
    ) -> PriceInterval {
        let interval = PriceInterval {
            id: Uuid::new_v4(),
            subscription_id,
            amount_cents,
            starts_on,
            ends_on,
            created_at: Utc::now(),
        };
        self.inner
            .intervals
            .write()
            .unwrap()
            .entry(subscription_id)
            .or_default()
            .push(interval.clone());
        interval
    }

    /// Closes the open interval at `effective_on` and opens a new one,
    /// mirroring the Postgres price-change transaction.
    pub fn change_price(
        &self,
        subscription_id: Uuid,
        amount_cents: i64,
        effective_on: NaiveDate,
    ) -> PriceInterval {
        {
            let mut intervals = self.inner.intervals.write().unwrap();
            if let Some(history) = intervals.get_mut(&subscription_id) {
                if let Some(open) = history.iter_mut().find(|interval| interval.ends_on.is_none())
                {
                    open.ends_on = Some(effective_on);
                }
            }
        }
        self.add_interval(subscription_id, amount_cents, effective_on, None)
    }

    /// Marks a ledger record paid. Returns `false` for unknown ids.
    pub fn mark_paid(&self, obligation_id: Uuid) -> bool {
        let mut records = self.inner.obligations.write().unwrap();
        match records.iter_mut().find(|record| record.id == obligation_id) {
            Some(record) => {
                record.is_paid = true;
                record.updated_at = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Snapshot of one key's records in creation order, for assertions.
    pub fn obligations_for(&self, subscription_id: Uuid, month: BillingMonth) -> Vec<Obligation> {
        let mut records: Vec<Obligation> = self
            .inner
            .obligations
            .read()
            .unwrap()
            .iter()
            .filter(|record| {
                record.subscription_id == subscription_id
                    && record.year == month.year()
                    && record.month == month.month() as i32
            })
            .cloned()
            .collect();
        records.sort_by_key(|record| record.seq);
        records
    }
}

#[async_trait]
impl SubscriptionCatalog for MemoryBillingStore {
    async fn active_subscription_ids(&self) -> Result<Vec<Uuid>> {
        Ok(self.inner.active.read().unwrap().clone())
    }
}

#[async_trait]
impl PriceHistoryStore for MemoryBillingStore {
    async fn list_intervals(&self, subscription_id: Uuid) -> Result<Vec<PriceInterval>> {
        Ok(self
            .inner
            .intervals
            .read()
            .unwrap()
            .get(&subscription_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl ObligationLedger for MemoryBillingStore {
    async fn list_for_month(
        &self,
        subscription_id: Uuid,
        month: BillingMonth,
    ) -> Result<Vec<Obligation>> {
        Ok(self.obligations_for(subscription_id, month))
    }

    async fn insert(&self, record: NewObligation) -> Result<Obligation> {
        let seq = {
            let mut next = self.inner.next_seq.write().unwrap();
            *next += 1;
            *next
        };
        let now = Utc::now();
        let inserted = Obligation {
            id: Uuid::new_v4(),
            seq,
            subscription_id: record.subscription_id,
            year: record.month.year(),
            month: record.month.month() as i32,
            amount_cents: record.amount_cents,
            is_paid: false,
            created_at: now,
            updated_at: now,
        };
        self.inner
            .obligations
            .write()
            .unwrap()
            .push(inserted.clone());
        Ok(inserted)
    }

    async fn update_amount(&self, obligation_id: Uuid, amount_cents: i64) -> Result<bool> {
        let mut records = self.inner.obligations.write().unwrap();
        match records
            .iter_mut()
            .find(|record| record.id == obligation_id && !record.is_paid)
        {
            Some(record) => {
                record.amount_cents = amount_cents;
                record.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
