pub mod api;
pub mod history;
pub mod memory;
pub mod models;
pub mod period;
pub mod reconciliation;
pub mod scheduler;
pub mod store;

pub use history::{interval_on, resolve_price, ResolvedPrice};
pub use memory::MemoryBillingStore;
pub use models::{
    ledger_total, BatchReport, ItemFailure, NewObligation, Obligation, PriceInterval,
    ReconciliationAction, ReconciliationResult,
};
pub use period::{BillingMonth, MonthRange, PeriodError};
pub use reconciliation::{CancelFlag, ReconciliationEngine};
pub use scheduler::{
    process_tick as run_billing_reconciliation_tick, spawn as spawn_billing_scheduler,
};
pub use store::{
    ObligationLedger, PgBillingStore, PriceChangeError, PriceHistoryStore, SubscriptionCatalog,
};
