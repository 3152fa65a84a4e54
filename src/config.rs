use once_cell::sync::Lazy;

/// Address the HTTP server should bind to. Defaults to `0.0.0.0`.
pub static BIND_ADDRESS: Lazy<String> =
    Lazy::new(|| std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0".to_string()));

/// Port the HTTP server should listen on. Defaults to `3000`.
pub static BIND_PORT: Lazy<u16> = Lazy::new(|| {
    std::env::var("BIND_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(3000)
});

/// When set to a truthy value, allows the application to continue running even if database
/// migrations fail. Defaults to `false`.
pub static ALLOW_MIGRATION_FAILURE: Lazy<bool> = Lazy::new(|| {
    std::env::var("ALLOW_MIGRATION_FAILURE")
        .ok()
        .map(|value| {
            let normalized = value.trim().to_ascii_lowercase();
            matches!(normalized.as_str(), "1" | "true" | "yes")
        })
        .unwrap_or(false)
});

/// key: billing-config -> background reconciliation toggle
pub static BILLING_AUTO_RECONCILE_ENABLED: Lazy<bool> = Lazy::new(|| {
    std::env::var("BILLING_AUTO_RECONCILE_ENABLED")
        .ok()
        .map(|value| {
            let normalized = value.trim().to_ascii_lowercase();
            !matches!(normalized.as_str(), "0" | "false" | "no")
        })
        .unwrap_or(true)
});

/// key: billing-config -> reconciliation scan cadence
pub static BILLING_AUTO_RECONCILE_INTERVAL_SECS: Lazy<u64> = Lazy::new(|| {
    std::env::var("BILLING_AUTO_RECONCILE_INTERVAL_SECS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(3600)
});

/// key: billing-config -> cap on the number of months a single range request may span
pub static BILLING_MAX_RANGE_MONTHS: Lazy<u32> = Lazy::new(|| {
    std::env::var("BILLING_MAX_RANGE_MONTHS")
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(24)
});
