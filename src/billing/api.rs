use axum::extract::Path;
use axum::{
    routing::{get, post},
    Extension, Json, Router,
};
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::config;
use crate::error::{AppError, AppResult};

use super::models::{ledger_total, BatchReport, Obligation, PriceInterval};
use super::period::{BillingMonth, MonthRange};
use super::reconciliation::ReconciliationEngine;
use super::store::{PgBillingStore, PriceChangeError};

pub fn routes() -> Router {
    Router::new()
        .route("/api/billing/reconciliation", post(run_reconciliation))
        .route(
            "/api/billing/subscriptions/:id/obligations/:year/:month",
            get(monthly_balance),
        )
        .route("/api/billing/obligations/:id/pay", post(pay_obligation))
        .route("/api/subscriptions/:id/price", post(change_price))
}

/// key: billing-api -> reconciliation trigger
#[derive(Debug, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum ReconcileRequest {
    SingleMonth {
        year: i32,
        month: u32,
        #[serde(default)]
        subscription_id: Option<Uuid>,
    },
    Range {
        start_year: i32,
        start_month: u32,
        end_year: i32,
        end_month: u32,
    },
}

pub async fn run_reconciliation(
    Extension(pool): Extension<PgPool>,
    Json(payload): Json<ReconcileRequest>,
) -> AppResult<Json<BatchReport>> {
    let current = BillingMonth::from_date(Utc::now().date_naive());
    let engine = ReconciliationEngine::new(PgBillingStore::new(pool.clone()));

    match payload {
        ReconcileRequest::SingleMonth {
            year,
            month,
            subscription_id,
        } => {
            let target = BillingMonth::new(year, month)
                .map_err(|e| AppError::BadRequest(e.to_string()))?;
            if target > current {
                return Err(AppError::BadRequest(format!(
                    "cannot reconcile future month {target}"
                )));
            }
            if let Some(id) = subscription_id {
                let known =
                    sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM subscriptions WHERE id = $1")
                        .bind(id)
                        .fetch_one(&pool)
                        .await
                        .map_err(|e| {
                            tracing::error!(?e, "DB error checking subscription");
                            AppError::Db(e)
                        })?;
                if known == 0 {
                    return Err(AppError::NotFound);
                }
            }
            let report = engine
                .reconcile_month(subscription_id, target)
                .await
                .map_err(|e| AppError::Message(format!("reconciliation failed: {e:#}")))?;
            Ok(Json(report))
        }
        ReconcileRequest::Range {
            start_year,
            start_month,
            end_year,
            end_month,
        } => {
            let start = BillingMonth::new(start_year, start_month)
                .map_err(|e| AppError::BadRequest(e.to_string()))?;
            let end = BillingMonth::new(end_year, end_month)
                .map_err(|e| AppError::BadRequest(e.to_string()))?;
            let range =
                MonthRange::new(start, end).map_err(|e| AppError::BadRequest(e.to_string()))?;
            if end > current {
                return Err(AppError::BadRequest(format!(
                    "cannot reconcile future month {end}"
                )));
            }
            let cap = *config::BILLING_MAX_RANGE_MONTHS;
            if range.month_count() > cap {
                return Err(AppError::BadRequest(format!(
                    "range spans {} months, maximum is {cap}",
                    range.month_count()
                )));
            }
            let report = engine
                .reconcile_range(range)
                .await
                .map_err(|e| AppError::Message(format!("reconciliation failed: {e:#}")))?;
            Ok(Json(report))
        }
    }
}

/// key: billing-api -> monthly balance, difference records included
#[derive(Debug, Serialize)]
pub struct MonthlyBalance {
    pub subscription_id: Uuid,
    pub year: i32,
    pub month: u32,
    pub records: Vec<Obligation>,
    pub month_total_cents: i64,
    pub unpaid_cents: i64,
}

pub async fn monthly_balance(
    Extension(pool): Extension<PgPool>,
    Path((id, year, month)): Path<(Uuid, i32, u32)>,
) -> AppResult<Json<MonthlyBalance>> {
    let target =
        BillingMonth::new(year, month).map_err(|e| AppError::BadRequest(e.to_string()))?;

    let known = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM subscriptions WHERE id = $1")
        .bind(id)
        .fetch_one(&pool)
        .await
        .map_err(|e| {
            tracing::error!(?e, "DB error checking subscription");
            AppError::Db(e)
        })?;
    if known == 0 {
        return Err(AppError::NotFound);
    }

    let records = sqlx::query_as::<_, Obligation>(
        "SELECT * FROM obligations \
        WHERE subscription_id = $1 AND year = $2 AND month = $3 \
        ORDER BY seq ASC",
    )
    .bind(id)
    .bind(target.year())
    .bind(target.month() as i32)
    .fetch_all(&pool)
    .await
    .map_err(|e| {
        tracing::error!(?e, "DB error listing obligations");
        AppError::Db(e)
    })?;

    let month_total_cents = ledger_total(&records);
    let unpaid_cents = records
        .iter()
        .filter(|record| !record.is_paid)
        .map(|record| record.amount_cents)
        .sum();

    Ok(Json(MonthlyBalance {
        subscription_id: id,
        year: target.year(),
        month: target.month(),
        records,
        month_total_cents,
        unpaid_cents,
    }))
}

pub async fn pay_obligation(
    Extension(pool): Extension<PgPool>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Obligation>> {
    let existing = sqlx::query_as::<_, Obligation>("SELECT * FROM obligations WHERE id = $1")
        .bind(id)
        .fetch_optional(&pool)
        .await
        .map_err(|e| {
            tracing::error!(?e, "DB error loading obligation");
            AppError::Db(e)
        })?;
    let Some(existing) = existing else {
        return Err(AppError::NotFound);
    };
    if existing.is_paid {
        return Err(AppError::BadRequest("obligation is already paid".into()));
    }

    // Guarded so a racing payment cannot be applied twice.
    let paid = sqlx::query_as::<_, Obligation>(
        "UPDATE obligations \
        SET is_paid = TRUE, updated_at = NOW() \
        WHERE id = $1 AND is_paid = FALSE \
        RETURNING *",
    )
    .bind(id)
    .fetch_optional(&pool)
    .await
    .map_err(|e| {
        tracing::error!(?e, "DB error marking obligation paid");
        AppError::Db(e)
    })?
    .ok_or_else(|| AppError::BadRequest("obligation is already paid".into()))?;

    tracing::info!(
        obligation = %paid.id,
        subscription = %paid.subscription_id,
        amount_cents = paid.amount_cents,
        "obligation marked paid"
    );
    Ok(Json(paid))
}

#[derive(Debug, Deserialize)]
pub struct PriceChangeRequest {
    pub amount_cents: i64,
    pub effective_on: NaiveDate,
}

pub async fn change_price(
    Extension(pool): Extension<PgPool>,
    Path(id): Path<Uuid>,
    Json(payload): Json<PriceChangeRequest>,
) -> AppResult<Json<PriceInterval>> {
    let store = PgBillingStore::new(pool);
    let interval = store
        .record_price_change(id, payload.amount_cents, payload.effective_on)
        .await
        .map_err(|e| match e {
            PriceChangeError::SubscriptionNotFound => AppError::NotFound,
            PriceChangeError::NegativeAmount | PriceChangeError::EffectiveTooEarly { .. } => {
                AppError::BadRequest(e.to_string())
            }
            PriceChangeError::Db(db) => {
                tracing::error!(?db, "DB error recording price change");
                AppError::Db(db)
            }
        })?;
    Ok(Json(interval))
}
