//! Metrics module for billing-engine.
//! Provides Prometheus metrics for generation, accrual and allocation.

use once_cell::sync::Lazy;
use prometheus::{
    histogram_opts, opts, register_histogram_vec, register_int_counter_vec, Encoder, HistogramVec,
    IntCounterVec, TextEncoder,
};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::sync::OnceLock;

/// Database query duration histogram
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        histogram_opts!(
            "billing_db_query_duration_seconds",
            "Database query duration"
        ),
        &["operation"]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Quotas created, by generation method
pub static QUOTAS_GENERATED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Generation runs, by method and resulting status
pub static GENERATION_RUNS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Per-quota accrual outcomes
pub static INTEREST_ACCRUALS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Payment allocations, by outcome
pub static PAYMENTS_ALLOCATED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Payment verification decisions, by resulting status
pub static PAYMENT_VERIFICATIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Pending allocation lifecycle events
pub static PENDING_ALLOCATIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Quota adjustments, by type
pub static QUOTA_ADJUSTMENTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Error counter for alerting
pub static ERRORS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Amount applied to quotas by currency (monetary tracking)
pub static ALLOCATED_AMOUNT_TOTAL: OnceLock<prometheus::CounterVec> = OnceLock::new();

/// Initialize all metrics. Call once at startup.
pub fn init_metrics() {
    QUOTAS_GENERATED_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_quotas_generated_total",
                "Total quotas created by generation method"
            ),
            &["generation_method"]
        )
        .expect("Failed to register QUOTAS_GENERATED_TOTAL")
    });

    GENERATION_RUNS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_generation_runs_total",
                "Total generation runs by method and status"
            ),
            &["generation_method", "status"]
        )
        .expect("Failed to register GENERATION_RUNS_TOTAL")
    });

    INTEREST_ACCRUALS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_interest_accruals_total",
                "Total per-quota accrual outcomes"
            ),
            &["outcome"]
        )
        .expect("Failed to register INTEREST_ACCRUALS_TOTAL")
    });

    PAYMENTS_ALLOCATED_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_payments_allocated_total",
                "Total payment allocations by outcome"
            ),
            &["outcome"]
        )
        .expect("Failed to register PAYMENTS_ALLOCATED_TOTAL")
    });

    PAYMENT_VERIFICATIONS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_payment_verifications_total",
                "Total payment verification decisions by status"
            ),
            &["status"]
        )
        .expect("Failed to register PAYMENT_VERIFICATIONS_TOTAL")
    });

    PENDING_ALLOCATIONS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_pending_allocations_total",
                "Total pending allocation events"
            ),
            &["event"]
        )
        .expect("Failed to register PENDING_ALLOCATIONS_TOTAL")
    });

    QUOTA_ADJUSTMENTS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_quota_adjustments_total",
                "Total quota adjustments by type"
            ),
            &["adjustment_type"]
        )
        .expect("Failed to register QUOTA_ADJUSTMENTS_TOTAL")
    });

    // Error counter for alerting
    ERRORS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("billing_errors_total", "Total errors by type for alerting"),
            &["error_type", "operation"]
        )
        .expect("Failed to register ERRORS_TOTAL")
    });

    ALLOCATED_AMOUNT_TOTAL.get_or_init(|| {
        prometheus::register_counter_vec!(
            prometheus::opts!(
                "billing_allocated_amount_total",
                "Total amount applied to quotas by currency"
            ),
            &["currency"]
        )
        .expect("Failed to register ALLOCATED_AMOUNT_TOTAL")
    });

    // Force initialization of lazy statics
    let _ = &*DB_QUERY_DURATION;
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

pub fn record_quotas_generated(generation_method: &str, count: u64) {
    if let Some(counter) = QUOTAS_GENERATED_TOTAL.get() {
        counter.with_label_values(&[generation_method]).inc_by(count);
    }
}

pub fn record_generation_run(generation_method: &str, status: &str) {
    if let Some(counter) = GENERATION_RUNS_TOTAL.get() {
        counter
            .with_label_values(&[generation_method, status])
            .inc();
    }
}

pub fn record_interest_accrual(outcome: &str) {
    if let Some(counter) = INTEREST_ACCRUALS_TOTAL.get() {
        counter.with_label_values(&[outcome]).inc();
    }
}

pub fn record_payment_allocated(outcome: &str) {
    if let Some(counter) = PAYMENTS_ALLOCATED_TOTAL.get() {
        counter.with_label_values(&[outcome]).inc();
    }
}

pub fn record_payment_verification(status: &str) {
    if let Some(counter) = PAYMENT_VERIFICATIONS_TOTAL.get() {
        counter.with_label_values(&[status]).inc();
    }
}

pub fn record_pending_allocation(event: &str) {
    if let Some(counter) = PENDING_ALLOCATIONS_TOTAL.get() {
        counter.with_label_values(&[event]).inc();
    }
}

pub fn record_quota_adjustment(adjustment_type: &str) {
    if let Some(counter) = QUOTA_ADJUSTMENTS_TOTAL.get() {
        counter.with_label_values(&[adjustment_type]).inc();
    }
}

/// Record an error for alerting.
pub fn record_error(error_type: &str, operation: &str) {
    if let Some(counter) = ERRORS_TOTAL.get() {
        counter.with_label_values(&[error_type, operation]).inc();
    }
}

/// Record an amount applied to quotas for financial tracking.
pub fn record_allocated_amount(currency: &str, amount: Decimal) {
    if let Some(counter) = ALLOCATED_AMOUNT_TOTAL.get() {
        counter
            .with_label_values(&[currency])
            .inc_by(amount.abs().to_f64().unwrap_or(0.0));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_is_exported() {
        init_metrics();
        record_quotas_generated("scheduled", 3);
        record_error("bad_request", "allocate_payment");
        let text = get_metrics();
        assert!(text.contains("billing_quotas_generated_total"));
        assert!(text.contains("billing_errors_total"));
    }
}
