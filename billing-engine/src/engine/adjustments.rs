//! Administrative amount changes and cancellation of quotas.

use super::{money, BillingEngine};
use crate::error::BillingError;
use crate::models::{AdjustmentType, Quota, QuotaAdjustment, QuotaStatus};
use crate::services::metrics::{record_error, record_quota_adjustment};
use crate::services::store::{BillingStore, CurrencyDirectory, StoreTransaction, UnitDirectory};
use chrono::Utc;
use rust_decimal::Decimal;
use service_core::retry::retry_with_backoff;
use tracing::{info, instrument};
use uuid::Uuid;

/// Check the arguments of an adjustment that do not depend on stored state.
pub fn validate_adjustment(
    new_amount: Decimal,
    adjustment_type: AdjustmentType,
    reason: &str,
) -> Result<(), BillingError> {
    if reason.trim().is_empty() {
        return Err(BillingError::BadRequest(anyhow::anyhow!(
            "Adjustment reason is required"
        )));
    }
    match adjustment_type {
        AdjustmentType::Waiver if !new_amount.is_zero() => Err(BillingError::BadRequest(
            anyhow::anyhow!("A waiver must set the amount to zero"),
        )),
        AdjustmentType::Interest | AdjustmentType::Cancellation => {
            Err(BillingError::BadRequest(anyhow::anyhow!(
                "Adjustment type {} is not set manually",
                adjustment_type.as_str()
            )))
        }
        _ if new_amount < Decimal::ZERO => Err(BillingError::BadRequest(anyhow::anyhow!(
            "Adjusted amount cannot be negative: {}",
            new_amount
        ))),
        _ => Ok(()),
    }
}

impl<S, U, C> BillingEngine<S, U, C>
where
    S: BillingStore,
    U: UnitDirectory,
    C: CurrencyDirectory,
{
    /// Change the charged amount of a quota and record the change.
    ///
    /// `new_amount` is in the quota's currency. A waiver zeroes the quota and
    /// cancels it.
    #[instrument(skip(self, reason), fields(quota_id = %quota_id, adjustment_type = adjustment_type.as_str()))]
    pub async fn adjust_quota(
        &self,
        quota_id: Uuid,
        new_amount: Decimal,
        adjustment_type: AdjustmentType,
        reason: &str,
        actor: Uuid,
    ) -> Result<Quota, BillingError> {
        let result = match validate_adjustment(new_amount, adjustment_type, reason) {
            Ok(()) => retry_with_backoff(&self.settings.retry, "adjust_quota", || {
                self.try_adjust(quota_id, new_amount, adjustment_type, reason, actor)
            })
            .await
            .map_err(BillingError::from),
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            record_error(e.kind(), "adjust_quota");
        }
        result
    }

    /// Cancel a quota nothing has been paid towards.
    #[instrument(skip(self, reason), fields(quota_id = %quota_id))]
    pub async fn cancel_quota(
        &self,
        quota_id: Uuid,
        reason: &str,
        actor: Uuid,
    ) -> Result<Quota, BillingError> {
        let result = if reason.trim().is_empty() {
            Err(BillingError::BadRequest(anyhow::anyhow!(
                "Cancellation reason is required"
            )))
        } else {
            retry_with_backoff(&self.settings.retry, "cancel_quota", || {
                self.try_cancel(quota_id, reason, actor)
            })
            .await
            .map_err(BillingError::from)
        };

        if let Err(e) = &result {
            record_error(e.kind(), "cancel_quota");
        }
        result
    }

    async fn try_adjust(
        &self,
        quota_id: Uuid,
        new_amount: Decimal,
        adjustment_type: AdjustmentType,
        reason: &str,
        actor: Uuid,
    ) -> Result<Quota, BillingError> {
        let mut tx = self.store.begin().await?;
        let mut quota = match lock_quota(&mut tx, quota_id).await {
            Ok(quota) => quota,
            Err(e) => {
                tx.rollback().await?;
                return Err(e);
            }
        };

        let adjusted = match self.apply_adjustment(&mut quota, new_amount, adjustment_type).await {
            Ok(adjusted) => adjusted,
            Err(e) => {
                tx.rollback().await?;
                return Err(e);
            }
        };

        let updated = tx.update_quota(&quota).await?;
        let adjustment = QuotaAdjustment::new(
            quota.id,
            adjusted.previous,
            adjusted.new,
            adjustment_type,
            reason.trim(),
            Some(actor),
        );
        tx.insert_adjustment(&adjustment).await?;
        tx.commit().await?;

        record_quota_adjustment(adjustment_type.as_str());
        info!(
            previous_amount = %adjusted.previous,
            new_amount = %adjusted.new,
            balance = %updated.balance,
            status = %updated.status,
            "Quota adjusted"
        );
        Ok(updated)
    }

    /// Mutate `quota` for the adjustment and return the recorded amounts.
    async fn apply_adjustment(
        &self,
        quota: &mut Quota,
        new_amount: Decimal,
        adjustment_type: AdjustmentType,
    ) -> Result<AdjustedAmounts, BillingError> {
        let scale = self.currency_scale(&quota.currency).await?;
        let new_amount = money::round_money(new_amount, scale);
        let previous = quota.base_amount;
        if new_amount == previous {
            return Err(BillingError::BadRequest(anyhow::anyhow!(
                "Quota {} already has amount {}",
                quota.id,
                previous
            )));
        }

        if adjustment_type == AdjustmentType::Waiver {
            if quota.paid_amount > Decimal::ZERO {
                return Err(BillingError::BadRequest(anyhow::anyhow!(
                    "Quota {} has payments and cannot be waived",
                    quota.id
                )));
            }
            quota.base_amount = Decimal::ZERO;
            quota.amount_in_base_currency = Decimal::ZERO;
            quota.interest_amount = Decimal::ZERO;
            quota.balance = quota.computed_balance();
            quota.status = QuotaStatus::Cancelled;
            return Ok(AdjustedAmounts {
                previous,
                new: Decimal::ZERO,
            });
        }

        let base_scale = self.base_scale().await?;
        let in_base = match quota.exchange_rate_used {
            Some(rate) => money::convert(new_amount, rate, base_scale)?,
            None => money::round_money(new_amount, base_scale),
        };
        let new_total = in_base + quota.interest_amount;
        if new_total < quota.paid_amount {
            return Err(BillingError::BadRequest(anyhow::anyhow!(
                "Quota {} total {} would fall below the {} already paid",
                quota.id,
                new_total,
                quota.paid_amount
            )));
        }

        quota.base_amount = new_amount;
        quota.amount_in_base_currency = in_base;
        quota.refresh(Utc::now().date_naive());
        if quota.balance < Decimal::ZERO {
            return Err(BillingError::InvariantViolation(format!(
                "quota {} balance would become {}",
                quota.id, quota.balance
            )));
        }
        Ok(AdjustedAmounts {
            previous,
            new: new_amount,
        })
    }

    async fn try_cancel(
        &self,
        quota_id: Uuid,
        reason: &str,
        actor: Uuid,
    ) -> Result<Quota, BillingError> {
        let mut tx = self.store.begin().await?;
        let mut quota = match lock_quota(&mut tx, quota_id).await {
            Ok(quota) => quota,
            Err(e) => {
                tx.rollback().await?;
                return Err(e);
            }
        };
        if quota.paid_amount > Decimal::ZERO {
            tx.rollback().await?;
            return Err(BillingError::BadRequest(anyhow::anyhow!(
                "Quota {} has payments and cannot be cancelled",
                quota_id
            )));
        }

        let previous = quota.balance;
        quota.status = QuotaStatus::Cancelled;
        let updated = tx.update_quota(&quota).await?;
        let adjustment = QuotaAdjustment::new(
            quota.id,
            previous,
            Decimal::ZERO,
            AdjustmentType::Cancellation,
            reason.trim(),
            Some(actor),
        );
        tx.insert_adjustment(&adjustment).await?;
        tx.commit().await?;

        record_quota_adjustment(AdjustmentType::Cancellation.as_str());
        info!(previous_balance = %previous, "Quota cancelled");
        Ok(updated)
    }
}

struct AdjustedAmounts {
    previous: Decimal,
    new: Decimal,
}

/// Lock a quota that can still be changed.
async fn lock_quota<T: StoreTransaction>(tx: &mut T, quota_id: Uuid) -> Result<Quota, BillingError> {
    let quota = tx
        .lock_quota(quota_id)
        .await?
        .ok_or_else(|| BillingError::NotFound(anyhow::anyhow!("Quota {} not found", quota_id)))?;
    if quota.status == QuotaStatus::Cancelled {
        return Err(BillingError::BadRequest(anyhow::anyhow!(
            "Quota {} is cancelled",
            quota_id
        )));
    }
    Ok(quota)
}
