use crate::billing::history::interval_on;
use crate::billing::models::PriceInterval;
use crate::error::{AppError, AppResult};
use axum::extract::Path;
use axum::{
    routing::{get, post},
    Extension, Json, Router,
};
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

#[derive(serde::Serialize, sqlx::FromRow)]
pub struct Subscription {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub label: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(serde::Deserialize)]
pub struct NewSubscription {
    pub customer_id: Uuid,
    pub label: String,
    /// Optional opening price. When present an open-ended interval is
    /// created alongside the subscription.
    #[serde(default)]
    pub initial_amount_cents: Option<i64>,
    /// First day the opening price applies. Defaults to today.
    #[serde(default)]
    pub starts_on: Option<NaiveDate>,
}

#[derive(serde::Deserialize, Default)]
pub struct CancelRequest {
    /// Day the subscription stops. Months starting on or after this date are
    /// no longer billable. Defaults to today.
    #[serde(default)]
    pub effective_on: Option<NaiveDate>,
}

#[derive(serde::Serialize)]
pub struct SubscriptionDetail {
    pub subscription: Subscription,
    pub current_price: Option<PriceInterval>,
}

pub fn routes() -> Router {
    Router::new()
        .route(
            "/api/subscriptions",
            get(list_subscriptions).post(create_subscription),
        )
        .route("/api/subscriptions/:id", get(get_subscription))
        .route("/api/subscriptions/:id/cancel", post(cancel_subscription))
}

pub async fn list_subscriptions(
    Extension(pool): Extension<PgPool>,
) -> AppResult<Json<Vec<Subscription>>> {
    let subscriptions = sqlx::query_as::<_, Subscription>(
        "SELECT * FROM subscriptions ORDER BY created_at ASC",
    )
    .fetch_all(&pool)
    .await
    .map_err(|e| {
        tracing::error!(?e, "DB error listing subscriptions");
        AppError::Db(e)
    })?;
    Ok(Json(subscriptions))
}

pub async fn create_subscription(
    Extension(pool): Extension<PgPool>,
    Json(payload): Json<NewSubscription>,
) -> AppResult<Json<Subscription>> {
    if payload.label.trim().is_empty() {
        return Err(AppError::BadRequest("Label required".into()));
    }
    if let Some(amount) = payload.initial_amount_cents {
        if amount < 0 {
            return Err(AppError::BadRequest(
                "initial_amount_cents must not be negative".into(),
            ));
        }
    }

    let known = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM customers WHERE id = $1")
        .bind(payload.customer_id)
        .fetch_one(&pool)
        .await
        .map_err(|e| {
            tracing::error!(?e, "DB error checking customer");
            AppError::Db(e)
        })?;
    if known == 0 {
        return Err(AppError::BadRequest("unknown customer".into()));
    }

    let mut tx: Transaction<'_, Postgres> = pool.begin().await.map_err(AppError::Db)?;

    let subscription = sqlx::query_as::<_, Subscription>(
        "INSERT INTO subscriptions (customer_id, label) VALUES ($1, $2) RETURNING *",
    )
    .bind(payload.customer_id)
    .bind(payload.label.trim())
    .fetch_one(&mut *tx)
    .await
    .map_err(|e| {
        tracing::error!(?e, "DB error creating subscription");
        AppError::Db(e)
    })?;

    if let Some(amount) = payload.initial_amount_cents {
        let starts_on = payload
            .starts_on
            .unwrap_or_else(|| Utc::now().date_naive());
        sqlx::query(
            "INSERT INTO price_intervals (subscription_id, amount_cents, starts_on) \
            VALUES ($1, $2, $3)",
        )
        .bind(subscription.id)
        .bind(amount)
        .bind(starts_on)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            tracing::error!(?e, "DB error creating opening price interval");
            AppError::Db(e)
        })?;
    }

    tx.commit().await.map_err(AppError::Db)?;

    tracing::info!(
        subscription = %subscription.id,
        customer = %subscription.customer_id,
        "subscription created"
    );
    Ok(Json(subscription))
}

pub async fn get_subscription(
    Extension(pool): Extension<PgPool>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<SubscriptionDetail>> {
    let subscription =
        sqlx::query_as::<_, Subscription>("SELECT * FROM subscriptions WHERE id = $1")
            .bind(id)
            .fetch_optional(&pool)
            .await
            .map_err(|e| {
                tracing::error!(?e, "DB error loading subscription");
                AppError::Db(e)
            })?;
    let Some(subscription) = subscription else {
        return Err(AppError::NotFound);
    };

    let intervals = sqlx::query_as::<_, PriceInterval>(
        "SELECT * FROM price_intervals WHERE subscription_id = $1 ORDER BY starts_on ASC",
    )
    .bind(id)
    .fetch_all(&pool)
    .await
    .map_err(|e| {
        tracing::error!(?e, "DB error loading price history");
        AppError::Db(e)
    })?;

    let current_price = interval_on(&intervals, Utc::now().date_naive()).cloned();

    Ok(Json(SubscriptionDetail {
        subscription,
        current_price,
    }))
}

pub async fn cancel_subscription(
    Extension(pool): Extension<PgPool>,
    Path(id): Path<Uuid>,
    Json(payload): Json<CancelRequest>,
) -> AppResult<Json<Subscription>> {
    let effective_on = payload
        .effective_on
        .unwrap_or_else(|| Utc::now().date_naive());

    let mut tx: Transaction<'_, Postgres> = pool.begin().await.map_err(AppError::Db)?;

    let existing = sqlx::query_as::<_, Subscription>("SELECT * FROM subscriptions WHERE id = $1")
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| {
            tracing::error!(?e, "DB error loading subscription");
            AppError::Db(e)
        })?;
    let Some(existing) = existing else {
        return Err(AppError::NotFound);
    };
    if existing.status != "active" {
        return Err(AppError::BadRequest("subscription is already canceled".into()));
    }

    let open = sqlx::query_as::<_, PriceInterval>(
        "SELECT * FROM price_intervals \
        WHERE subscription_id = $1 AND ends_on IS NULL \
        ORDER BY starts_on DESC LIMIT 1",
    )
    .bind(id)
    .fetch_optional(&mut *tx)
    .await
    .map_err(|e| {
        tracing::error!(?e, "DB error loading open price interval");
        AppError::Db(e)
    })?;

    if let Some(open) = open {
        // Closing at the interval start leaves an empty window, which voids
        // it; closing before the start would invert it and is rejected.
        if effective_on < open.starts_on {
            return Err(AppError::BadRequest(format!(
                "effective date {effective_on} precedes the open price interval start {}",
                open.starts_on
            )));
        }
        sqlx::query("UPDATE price_intervals SET ends_on = $2 WHERE id = $1")
            .bind(open.id)
            .bind(effective_on)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                tracing::error!(?e, "DB error closing price interval");
                AppError::Db(e)
            })?;
    }

    let canceled = sqlx::query_as::<_, Subscription>(
        "UPDATE subscriptions SET status = 'canceled', updated_at = NOW() \
        WHERE id = $1 RETURNING *",
    )
    .bind(id)
    .fetch_one(&mut *tx)
    .await
    .map_err(|e| {
        tracing::error!(?e, "DB error canceling subscription");
        AppError::Db(e)
    })?;

    tx.commit().await.map_err(AppError::Db)?;

    tracing::info!(
        subscription = %canceled.id,
        effective_on = %effective_on,
        "subscription canceled"
    );
    Ok(Json(canceled))
}
