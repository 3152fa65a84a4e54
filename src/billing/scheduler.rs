use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio::time::{self, Duration as TokioDuration};
use tracing::{info, warn};

use crate::config;

use super::period::BillingMonth;
use super::reconciliation::ReconciliationEngine;
use super::store::PgBillingStore;

/// key: billing-scheduler -> periodic current-month reconciliation
pub fn spawn(pool: PgPool) {
    if !*config::BILLING_AUTO_RECONCILE_ENABLED {
        info!("billing auto reconciliation disabled via BILLING_AUTO_RECONCILE_ENABLED");
        return;
    }
    let interval = TokioDuration::from_secs(*config::BILLING_AUTO_RECONCILE_INTERVAL_SECS);

    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        loop {
            ticker.tick().await;
            let now = Utc::now();
            if let Err(err) = process_tick(&pool, now).await {
                warn!(?err, "billing reconciliation tick failed");
            }
        }
    });
}

/// key: billing-scheduler -> tick handler
///
/// Reconciles the month containing `now` for every active subscription.
/// `now` is a parameter so tests can pin the clock.
pub async fn process_tick(pool: &PgPool, now: DateTime<Utc>) -> Result<()> {
    let month = BillingMonth::from_date(now.date_naive());
    let engine = ReconciliationEngine::new(PgBillingStore::new(pool.clone()));
    let report = engine.reconcile_month(None, month).await?;

    info!(
        month = %month,
        processed = report.processed,
        created = report.created,
        updated = report.updated,
        created_difference = report.created_difference,
        no_change = report.no_change,
        skipped_no_price = report.skipped_no_price,
        failed = report.failed,
        "billing auto reconciliation tick finished"
    );

    Ok(())
}
