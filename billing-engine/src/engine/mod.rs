//! Billing engine: quota generation, interest accrual and payment allocation.
//!
//! [`BillingEngine`] owns the injected collaborators. Each component adds its
//! operations in its own module through an `impl` block on the engine.

pub mod adjustments;
pub mod allocator;
pub mod formula;
pub mod generator;
pub mod interest;
pub mod money;
pub mod payments;
pub mod resolver;
pub mod schedule;

pub use generator::DueRunReport;
pub use payments::VerifiedPayment;

use crate::error::BillingError;
use crate::models::Payment;
use crate::services::store::{BillingStore, CurrencyDirectory, UnitDirectory};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use service_core::retry::RetryConfig;
use std::sync::Arc;

/// Tunables of the engine.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Currency every ledger amount is kept in.
    pub base_currency: String,
    pub retry: RetryConfig,
    /// Schedules generated at the same time by `run_due_schedules`.
    pub generation_concurrency: usize,
    /// Quotas accrued at the same time by `accrue_interest`.
    pub accrual_concurrency: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            base_currency: "USD".to_string(),
            retry: RetryConfig::default(),
            generation_concurrency: 4,
            accrual_concurrency: 8,
        }
    }
}

pub struct BillingEngine<S, U, C> {
    store: Arc<S>,
    units: Arc<U>,
    currencies: Arc<C>,
    settings: EngineSettings,
}

impl<S, U, C> Clone for BillingEngine<S, U, C> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            units: self.units.clone(),
            currencies: self.currencies.clone(),
            settings: self.settings.clone(),
        }
    }
}

impl<S, U, C> BillingEngine<S, U, C>
where
    S: BillingStore,
    U: UnitDirectory,
    C: CurrencyDirectory,
{
    pub fn new(store: Arc<S>, units: Arc<U>, currencies: Arc<C>, settings: EngineSettings) -> Self {
        Self {
            store,
            units,
            currencies,
            settings,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Decimal places of `code`.
    pub(crate) async fn currency_scale(&self, code: &str) -> Result<u32, BillingError> {
        self.currencies
            .get_currency(code)
            .await?
            .map(|c| c.scale())
            .ok_or_else(|| BillingError::ConfigurationError(format!("unknown currency {}", code)))
    }

    pub(crate) async fn base_scale(&self) -> Result<u32, BillingError> {
        self.currency_scale(&self.settings.base_currency).await
    }

    /// Rate converting `from` into the base currency on `on`; `None` when
    /// `from` is the base currency.
    pub(crate) async fn rate_to_base(
        &self,
        from: &str,
        on: NaiveDate,
    ) -> Result<Option<Decimal>, BillingError> {
        if from == self.settings.base_currency {
            return Ok(None);
        }
        self.currencies
            .latest_rate(from, &self.settings.base_currency, on)
            .await?
            .map(|r| Some(r.rate))
            .ok_or_else(|| {
                BillingError::ConfigurationError(format!(
                    "no exchange rate from {} to {} on {}",
                    from, self.settings.base_currency, on
                ))
            })
    }

    /// Paid amount of `payment` in the base currency. The payment's own rate
    /// wins over the directory rate for the payment date.
    pub(crate) async fn payment_amount_in_base(
        &self,
        payment: &Payment,
    ) -> Result<Decimal, BillingError> {
        let scale = self.base_scale().await?;
        if payment.paid_currency == self.settings.base_currency {
            return Ok(money::round_money(payment.paid_amount, scale));
        }
        let rate = match payment.exchange_rate {
            Some(rate) => rate,
            None => self
                .rate_to_base(&payment.paid_currency, payment.payment_date)
                .await?
                .unwrap_or(Decimal::ONE),
        };
        money::convert(payment.paid_amount, rate, scale)
    }
}
