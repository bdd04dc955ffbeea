//! Billing engine job entry point.
//!
//! Performs one idempotent pass for an as-of date and exits.

use billing_engine::config::BillingConfig;
use billing_engine::services::{get_metrics, init_metrics};
use billing_engine::startup::Application;
use chrono::Utc;
use service_core::observability::init_tracing;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    // Load configuration
    let config = match BillingConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    // Initialize tracing
    init_tracing(
        &config.service_name,
        &config.log_level,
        config.otlp_endpoint.as_deref(),
    );

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        otlp_endpoint = ?config.otlp_endpoint,
        "Starting billing-engine"
    );

    // Initialize metrics
    init_metrics();

    tracing::info!(
        service_name = %config.service_name,
        base_currency = %config.base_currency,
        db_max_connections = %config.database.max_connections,
        db_min_connections = %config.database.min_connections,
        lock_timeout_ms = %config.database.lock_timeout_ms,
        generation_concurrency = %config.generation_concurrency,
        accrual_concurrency = %config.accrual_concurrency,
        "Configuration loaded"
    );

    let as_of = config.as_of.unwrap_or_else(|| Utc::now().date_naive());

    let app = match Application::build(config).await {
        Ok(app) => app,
        Err(e) => {
            tracing::error!(error = %e, "Failed to build application");
            return ExitCode::FAILURE;
        }
    };

    let report = match app.run_once(as_of).await {
        Ok(report) => report,
        Err(e) => {
            tracing::error!(error = %e, error_type = e.kind(), "Billing pass failed");
            return ExitCode::FAILURE;
        }
    };

    match serde_json::to_string(&report) {
        Ok(json) => tracing::info!(report = %json, "Billing pass completed"),
        Err(e) => tracing::warn!(error = %e, "Failed to serialize report"),
    }
    tracing::debug!(metrics = %get_metrics(), "Final metrics");

    if report.has_failures() {
        ExitCode::from(2)
    } else {
        ExitCode::SUCCESS
    }
}
