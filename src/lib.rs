pub mod billing;
pub mod config;
pub mod customers;
pub mod error;
pub mod routes;
pub mod subscriptions;

pub use billing::{
    BatchReport, BillingMonth, CancelFlag, MemoryBillingStore, MonthRange, PgBillingStore,
    ReconciliationAction, ReconciliationEngine,
};
