use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::{PgPool, Postgres, Transaction};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use super::models::{NewObligation, Obligation, PriceInterval};
use super::period::BillingMonth;

/// key: billing-store -> subscriptions in scope for an unscoped run
#[async_trait]
pub trait SubscriptionCatalog: Send + Sync {
    async fn active_subscription_ids(&self) -> Result<Vec<Uuid>>;
}

/// key: billing-store -> read side of the price history
#[async_trait]
pub trait PriceHistoryStore: Send + Sync {
    /// Full history for one subscription. Callers sort; no order is promised.
    async fn list_intervals(&self, subscription_id: Uuid) -> Result<Vec<PriceInterval>>;
}

/// key: billing-store -> obligation ledger reads and writes
#[async_trait]
pub trait ObligationLedger: Send + Sync {
    /// Every record for the key, oldest first by creation order.
    async fn list_for_month(
        &self,
        subscription_id: Uuid,
        month: BillingMonth,
    ) -> Result<Vec<Obligation>>;

    /// Inserts a new unpaid record and returns it.
    async fn insert(&self, record: NewObligation) -> Result<Obligation>;

    /// Rewrites the amount of an unpaid record. Returns `false` when the
    /// record is missing or already paid; callers treat that as a conflict
    /// with an outside writer, not as success.
    async fn update_amount(&self, obligation_id: Uuid, amount_cents: i64) -> Result<bool>;
}

#[derive(Debug, Error)]
pub enum PriceChangeError {
    #[error("subscription not found")]
    SubscriptionNotFound,
    #[error("amount_cents must not be negative")]
    NegativeAmount,
    #[error("effective date {effective_on} must be after the open interval start {starts_on}")]
    EffectiveTooEarly {
        effective_on: NaiveDate,
        starts_on: NaiveDate,
    },
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

/// key: billing-store -> Postgres implementation
#[derive(Clone)]
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Closes the open price interval at `effective_on` and opens a new one,
    /// in a single transaction. Backdating before the open interval's start
    /// is rejected; earlier months are corrected by reconciliation, not by
    /// rewriting history.
    pub async fn record_price_change(
        &self,
        subscription_id: Uuid,
        amount_cents: i64,
        effective_on: NaiveDate,
    ) -> Result<PriceInterval, PriceChangeError> {
        if amount_cents < 0 {
            return Err(PriceChangeError::NegativeAmount);
        }

        let mut tx: Transaction<'_, Postgres> = self.pool.begin().await?;

        let known = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM subscriptions WHERE id = $1")
            .bind(subscription_id)
            .fetch_one(&mut *tx)
            .await?;
        if known == 0 {
            return Err(PriceChangeError::SubscriptionNotFound);
        }

        let open = sqlx::query_as::<_, PriceInterval>(
            r#"
            SELECT * FROM price_intervals
            WHERE subscription_id = $1 AND ends_on IS NULL
            ORDER BY starts_on DESC
            LIMIT 1
            "#,
        )
        .bind(subscription_id)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(open) = open {
            if effective_on <= open.starts_on {
                return Err(PriceChangeError::EffectiveTooEarly {
                    effective_on,
                    starts_on: open.starts_on,
                });
            }
            sqlx::query("UPDATE price_intervals SET ends_on = $2 WHERE id = $1")
                .bind(open.id)
                .bind(effective_on)
                .execute(&mut *tx)
                .await?;
        }

        let interval = sqlx::query_as::<_, PriceInterval>(
            r#"
            INSERT INTO price_intervals (subscription_id, amount_cents, starts_on)
            VALUES ($1, $2, $3)
            RETURNING *
            "#,
        )
        .bind(subscription_id)
        .bind(amount_cents)
        .bind(effective_on)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        info!(
            subscription = %subscription_id,
            amount_cents,
            effective_on = %effective_on,
            "price change recorded"
        );

        Ok(interval)
    }
}

#[async_trait]
impl SubscriptionCatalog for PgBillingStore {
    async fn active_subscription_ids(&self) -> Result<Vec<Uuid>> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            "SELECT id FROM subscriptions WHERE status = 'active' ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to list active subscriptions")?;
        Ok(ids)
    }
}

#[async_trait]
impl PriceHistoryStore for PgBillingStore {
    async fn list_intervals(&self, subscription_id: Uuid) -> Result<Vec<PriceInterval>> {
        let intervals = sqlx::query_as::<_, PriceInterval>(
            "SELECT * FROM price_intervals WHERE subscription_id = $1 ORDER BY starts_on ASC",
        )
        .bind(subscription_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to load price history")?;
        Ok(intervals)
    }
}

#[async_trait]
impl ObligationLedger for PgBillingStore {
    async fn list_for_month(
        &self,
        subscription_id: Uuid,
        month: BillingMonth,
    ) -> Result<Vec<Obligation>> {
        let records = sqlx::query_as::<_, Obligation>(
            r#"
            SELECT * FROM obligations
            WHERE subscription_id = $1 AND year = $2 AND month = $3
            ORDER BY seq ASC
            "#,
        )
        .bind(subscription_id)
        .bind(month.year())
        .bind(month.month() as i32)
        .fetch_all(&self.pool)
        .await
        .context("failed to load obligation records")?;
        Ok(records)
    }

    async fn insert(&self, record: NewObligation) -> Result<Obligation> {
        let inserted = sqlx::query_as::<_, Obligation>(
            r#"
            INSERT INTO obligations (subscription_id, year, month, amount_cents)
            VALUES ($1, $2, $3, $4)
            RETURNING *
            "#,
        )
        .bind(record.subscription_id)
        .bind(record.month.year())
        .bind(record.month.month() as i32)
        .bind(record.amount_cents)
        .fetch_one(&self.pool)
        .await
        .context("failed to insert obligation record")?;
        Ok(inserted)
    }

    async fn update_amount(&self, obligation_id: Uuid, amount_cents: i64) -> Result<bool> {
        // The unpaid guard doubles as the optimistic check: a record paid by
        // a concurrent writer matches no row and the caller sees a conflict.
        let updated = sqlx::query(
            r#"
            UPDATE obligations
            SET amount_cents = $2, updated_at = NOW()
            WHERE id = $1 AND is_paid = FALSE
            "#,
        )
        .bind(obligation_id)
        .bind(amount_cents)
        .execute(&self.pool)
        .await
        .context("failed to update obligation record")?;
        Ok(updated.rows_affected() > 0)
    }
}
