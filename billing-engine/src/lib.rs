//! Billing engine: quota generation, interest accrual and payment allocation
//! for condominium units.

pub mod config;
pub mod engine;
pub mod error;
pub mod models;
pub mod services;
pub mod startup;

pub use engine::{BillingEngine, EngineSettings};
pub use error::BillingError;
