//! Services module for billing-engine.

pub mod database;
pub mod memory;
pub mod metrics;
pub mod store;

pub use database::{Database, PgStoreTransaction};
pub use memory::{MemoryDirectory, MemoryStore, MemoryTransaction};
pub use metrics::{
    get_metrics, init_metrics, record_allocated_amount, record_error, record_generation_run,
    record_interest_accrual, record_payment_allocated, record_payment_verification,
    record_pending_allocation, record_quota_adjustment, record_quotas_generated,
};
pub use store::{BillingStore, CurrencyDirectory, StoreTransaction, UnitDirectory};
