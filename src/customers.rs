use crate::error::{AppError, AppResult};
use axum::{
    routing::get,
    Extension, Json, Router,
};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

#[derive(serde::Deserialize)]
pub struct NewCustomer {
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(serde::Serialize, sqlx::FromRow)]
pub struct Customer {
    pub id: Uuid,
    pub name: String,
    pub email: Option<String>,
    pub created_at: DateTime<Utc>,
}

pub fn routes() -> Router {
    Router::new().route("/api/customers", get(list_customers).post(create_customer))
}

pub async fn list_customers(
    Extension(pool): Extension<PgPool>,
) -> AppResult<Json<Vec<Customer>>> {
    let customers = sqlx::query_as::<_, Customer>(
        "SELECT id, name, email, created_at FROM customers ORDER BY created_at ASC",
    )
    .fetch_all(&pool)
    .await
    .map_err(|e| {
        tracing::error!(?e, "DB error listing customers");
        AppError::Db(e)
    })?;
    Ok(Json(customers))
}

pub async fn create_customer(
    Extension(pool): Extension<PgPool>,
    Json(payload): Json<NewCustomer>,
) -> AppResult<Json<Customer>> {
    if payload.name.trim().is_empty() {
        return Err(AppError::BadRequest("Name required".into()));
    }
    let customer = sqlx::query_as::<_, Customer>(
        "INSERT INTO customers (name, email) VALUES ($1, $2) \
        RETURNING id, name, email, created_at",
    )
    .bind(payload.name.trim())
    .bind(&payload.email)
    .fetch_one(&pool)
    .await
    .map_err(|e| {
        tracing::error!(?e, "DB error creating customer");
        AppError::Db(e)
    })?;
    Ok(Json(customer))
}
