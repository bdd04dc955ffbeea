//! Rounding and currency conversion.

use crate::error::BillingError;
use rust_decimal::{Decimal, RoundingStrategy};

/// Round half-up (midpoint away from zero) to `decimal_places`.
pub fn round_money(amount: Decimal, decimal_places: u32) -> Decimal {
    amount.round_dp_with_strategy(decimal_places, RoundingStrategy::MidpointAwayFromZero)
}

/// Convert `amount` with `rate` and round to the target currency.
pub fn convert(amount: Decimal, rate: Decimal, decimal_places: u32) -> Result<Decimal, BillingError> {
    if rate <= Decimal::ZERO {
        return Err(BillingError::ConfigurationError(format!(
            "exchange rate must be positive, got {}",
            rate
        )));
    }
    amount
        .checked_mul(rate)
        .map(|v| round_money(v, decimal_places))
        .ok_or_else(|| BillingError::EvaluationError("overflow converting amount".to_string()))
}
