//! Payment allocation waterfall.

use super::BillingEngine;
use crate::error::BillingError;
use crate::models::{
    AllocationResult, Payment, PaymentApplication, PaymentStatus, PendingAllocation,
    PendingAllocationStatus, Quota, QuotaStatus,
};
use crate::services::metrics::{
    record_allocated_amount, record_error, record_payment_allocated, record_pending_allocation,
};
use crate::services::store::{BillingStore, CurrencyDirectory, StoreTransaction, UnitDirectory};
use rust_decimal::Decimal;
use service_core::retry::retry_with_backoff;
use tracing::{info, instrument};
use uuid::Uuid;

/// Split of an amount applied to one quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppliedSplit {
    pub to_interest: Decimal,
    pub to_principal: Decimal,
}

impl AppliedSplit {
    pub fn total(&self) -> Decimal {
        self.to_interest + self.to_principal
    }
}

/// Apply up to `available` to `quota`, interest first, and settle its status.
///
/// Returns the split actually applied, never more than the balance.
pub fn apply_to_quota(quota: &mut Quota, available: Decimal) -> Result<AppliedSplit, BillingError> {
    let applied = available.min(quota.balance).max(Decimal::ZERO);
    let to_interest = applied.min(quota.interest_outstanding());
    let to_principal = applied - to_interest;

    quota.paid_amount += applied;
    quota.interest_paid += to_interest;
    quota.balance = quota.computed_balance();
    quota.status = if quota.balance.is_zero() {
        QuotaStatus::Paid
    } else {
        QuotaStatus::Partial
    };

    if quota.balance < Decimal::ZERO {
        return Err(BillingError::InvariantViolation(format!(
            "quota {} balance would become {}",
            quota.id, quota.balance
        )));
    }

    Ok(AppliedSplit {
        to_interest,
        to_principal,
    })
}

/// Check `Σ applied + Σ unapplied pending == expected` for one payment.
pub fn check_conservation(
    payment_id: Uuid,
    applications: &[PaymentApplication],
    pending: &[PendingAllocation],
    expected: Decimal,
) -> Result<(), BillingError> {
    let applied: Decimal = applications.iter().map(|a| a.applied_amount).sum();
    let unapplied: Decimal = pending.iter().map(|p| p.unapplied_amount()).sum();
    if applied + unapplied != expected {
        return Err(BillingError::InvariantViolation(format!(
            "payment {}: applied {} + pending {} != {}",
            payment_id, applied, unapplied, expected
        )));
    }
    Ok(())
}

/// Outcome of allocating a payment inside a transaction.
pub(crate) enum Allocation {
    /// The payment had been allocated before; nothing was written.
    Existing(AllocationResult),
    Created(AllocationResult),
}

impl Allocation {
    pub(crate) fn into_result(self) -> AllocationResult {
        match self {
            Allocation::Existing(result) | Allocation::Created(result) => result,
        }
    }
}

/// Run the waterfall for a locked, completed `payment` worth `amount` in the
/// base currency. The caller owns the transaction.
pub(crate) async fn allocate_in_tx<T: StoreTransaction>(
    tx: &mut T,
    payment: &Payment,
    amount: Decimal,
    base_currency: &str,
) -> Result<Allocation, BillingError> {
    let existing_applications = tx.applications_for_payment(payment.id).await?;
    let existing_pending = tx.pending_allocations_for_payment(payment.id).await?;
    if !existing_applications.is_empty() || !existing_pending.is_empty() {
        let open = existing_pending
            .iter()
            .find(|p| p.status == PendingAllocationStatus::Pending)
            .or_else(|| existing_pending.last())
            .cloned();
        return Ok(Allocation::Existing(AllocationResult {
            applications: existing_applications,
            pending_allocation: open,
        }));
    }

    let quotas = tx.lock_outstanding_quotas(payment.unit_id).await?;
    let mut remaining = amount;
    let mut applications = Vec::new();

    for mut quota in quotas {
        if remaining <= Decimal::ZERO {
            break;
        }
        let split = apply_to_quota(&mut quota, remaining)?;
        if split.total().is_zero() {
            continue;
        }

        tx.update_quota(&quota).await?;
        let application =
            PaymentApplication::new(payment.id, quota.id, split.to_interest, split.to_principal);
        tx.insert_application(&application).await?;
        remaining -= application.applied_amount;
        applications.push(application);
    }

    let pending_allocation = if remaining > Decimal::ZERO {
        let pending = PendingAllocation::new(payment.id, remaining, base_currency);
        tx.insert_pending_allocation(&pending).await?;
        Some(pending)
    } else {
        None
    };

    check_conservation(
        payment.id,
        &applications,
        pending_allocation.as_slice(),
        amount,
    )?;

    Ok(Allocation::Created(AllocationResult {
        applications,
        pending_allocation,
    }))
}

impl<S, U, C> BillingEngine<S, U, C>
where
    S: BillingStore,
    U: UnitDirectory,
    C: CurrencyDirectory,
{
    /// Apply a completed payment to the unit's outstanding quotas, oldest due
    /// date first. Any remainder becomes a pending allocation. Allocating the
    /// same payment again returns the existing result.
    #[instrument(skip(self), fields(payment_id = %payment_id))]
    pub async fn allocate_payment(&self, payment_id: Uuid) -> Result<AllocationResult, BillingError> {
        let result = retry_with_backoff(&self.settings.retry, "allocate_payment", || {
            self.try_allocate(payment_id)
        })
        .await
        .map_err(BillingError::from);

        if let Err(e) = &result {
            record_error(e.kind(), "allocate_payment");
        }
        result
    }

    async fn try_allocate(&self, payment_id: Uuid) -> Result<AllocationResult, BillingError> {
        let payment = self.store.get_payment(payment_id).await?.ok_or_else(|| {
            BillingError::NotFound(anyhow::anyhow!("Payment {} not found", payment_id))
        })?;
        if payment.status != PaymentStatus::Completed {
            return Err(BillingError::BadRequest(anyhow::anyhow!(
                "Payment {} is {}, only completed payments can be allocated",
                payment_id,
                payment.status.as_str()
            )));
        }
        let amount = self.payment_amount_in_base(&payment).await?;

        let mut tx = self.store.begin().await?;
        let Some(payment) = tx.lock_payment(payment_id).await? else {
            tx.rollback().await?;
            return Err(BillingError::NotFound(anyhow::anyhow!(
                "Payment {} not found",
                payment_id
            )));
        };

        match allocate_in_tx(&mut tx, &payment, amount, &self.settings.base_currency).await {
            Ok(Allocation::Existing(result)) => {
                tx.rollback().await?;
                info!("Payment already allocated");
                record_payment_allocated("already_allocated");
                Ok(result)
            }
            Ok(Allocation::Created(result)) => {
                tx.commit().await?;
                self.record_allocation(&payment, amount, &result);
                Ok(result)
            }
            Err(e) => {
                tx.rollback().await?;
                Err(e)
            }
        }
    }

    /// Metrics and log line for a freshly written allocation.
    pub(crate) fn record_allocation(
        &self,
        payment: &Payment,
        amount: Decimal,
        result: &AllocationResult,
    ) {
        record_payment_allocated("allocated");
        record_allocated_amount(&self.settings.base_currency, result.total_applied());
        if result.pending_allocation.is_some() {
            record_pending_allocation("created");
        }

        info!(
            unit_id = %payment.unit_id,
            amount = %amount,
            applications = result.applications.len(),
            applied = %result.total_applied(),
            pending = %result.total_pending(),
            "Payment allocated"
        );
    }
}
