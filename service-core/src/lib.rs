//! service-core: Shared infrastructure for the billing workspace.
pub mod config;
pub mod observability;
pub mod retry;

pub use tokio;
pub use tracing;
