//! Administrative resolution of pending allocations.

use super::allocator::{apply_to_quota, check_conservation};
use super::BillingEngine;
use crate::error::BillingError;
use crate::models::{
    PaymentApplication, PendingAllocation, PendingAllocationStatus, QuotaStatus, Resolution,
    ResolutionType,
};
use crate::services::metrics::{record_allocated_amount, record_error, record_pending_allocation};
use crate::services::store::{BillingStore, CurrencyDirectory, StoreTransaction, UnitDirectory};
use chrono::Utc;
use rust_decimal::Decimal;
use service_core::retry::retry_with_backoff;
use tracing::{info, instrument};
use uuid::Uuid;

impl<S, U, C> BillingEngine<S, U, C>
where
    S: BillingStore,
    U: UnitDirectory,
    C: CurrencyDirectory,
{
    /// Apply a pending allocation to a quota of the same unit, or mark it
    /// refunded. A resolved allocation cannot be resolved again.
    #[instrument(skip(self, resolution), fields(pending_id = %pending_id, actor = %actor))]
    pub async fn resolve_pending_allocation(
        &self,
        pending_id: Uuid,
        resolution: Resolution,
        actor: Uuid,
    ) -> Result<PendingAllocation, BillingError> {
        let result = match &resolution {
            Resolution::Refund { notes } if notes.trim().is_empty() => Err(
                BillingError::BadRequest(anyhow::anyhow!("Refund notes are required")),
            ),
            _ => retry_with_backoff(&self.settings.retry, "resolve_pending_allocation", || {
                self.try_resolve(pending_id, &resolution, actor)
            })
            .await
            .map_err(BillingError::from),
        };

        if let Err(e) = &result {
            record_error(e.kind(), "resolve_pending_allocation");
        }
        result
    }

    async fn try_resolve(
        &self,
        pending_id: Uuid,
        resolution: &Resolution,
        actor: Uuid,
    ) -> Result<PendingAllocation, BillingError> {
        let pending = self
            .store
            .get_pending_allocation(pending_id)
            .await?
            .ok_or_else(|| {
                BillingError::NotFound(anyhow::anyhow!("Pending allocation {} not found", pending_id))
            })?;
        let payment = self
            .store
            .get_payment(pending.payment_id)
            .await?
            .ok_or_else(|| {
                BillingError::NotFound(anyhow::anyhow!("Payment {} not found", pending.payment_id))
            })?;
        let expected = self.payment_amount_in_base(&payment).await?;

        let mut tx = self.store.begin().await?;
        let outcome = resolve_in_tx(&mut tx, pending_id, resolution, actor, payment.unit_id).await;
        let resolved = match outcome {
            Ok(resolved) => resolved,
            Err(e) => {
                tx.rollback().await?;
                return Err(e);
            }
        };

        let applications = tx.applications_for_payment(payment.id).await?;
        let pendings = tx.pending_allocations_for_payment(payment.id).await?;
        if let Err(e) = check_conservation(payment.id, &applications, &pendings, expected) {
            tx.rollback().await?;
            return Err(e);
        }
        tx.commit().await?;

        let event = resolved.pending.status.as_str();
        record_pending_allocation(event);
        if resolved.leftover.is_some() {
            record_pending_allocation("created");
        }
        if let Some(application) = &resolved.application {
            record_allocated_amount(&resolved.pending.currency, application.applied_amount);
        }

        info!(
            payment_id = %payment.id,
            status = event,
            quota_id = ?resolved.pending.allocated_to_quota_id,
            leftover = %resolved.leftover.as_ref().map(|p| p.pending_amount).unwrap_or(Decimal::ZERO),
            "Pending allocation resolved"
        );
        Ok(resolved.pending)
    }
}

struct Resolved {
    pending: PendingAllocation,
    application: Option<PaymentApplication>,
    leftover: Option<PendingAllocation>,
}

async fn resolve_in_tx<T: StoreTransaction>(
    tx: &mut T,
    pending_id: Uuid,
    resolution: &Resolution,
    actor: Uuid,
    unit_id: Uuid,
) -> Result<Resolved, BillingError> {
    let mut pending = tx.lock_pending_allocation(pending_id).await?.ok_or_else(|| {
        BillingError::NotFound(anyhow::anyhow!("Pending allocation {} not found", pending_id))
    })?;
    if pending.status != PendingAllocationStatus::Pending {
        return Err(BillingError::BadRequest(anyhow::anyhow!(
            "Pending allocation {} is already {}",
            pending_id,
            pending.status.as_str()
        )));
    }

    let now = Utc::now();
    pending.allocated_by = Some(actor);
    pending.allocated_at = Some(now);

    match resolution {
        Resolution::Refund { notes } => {
            pending.status = PendingAllocationStatus::Refunded;
            pending.resolution_type = Some(ResolutionType::Refunded);
            pending.resolution_notes = Some(notes.trim().to_string());
            tx.update_pending_allocation(&pending).await?;
            Ok(Resolved {
                pending,
                application: None,
                leftover: None,
            })
        }
        Resolution::ApplyToQuota { quota_id, notes } => {
            let mut quota = tx.lock_quota(*quota_id).await?.ok_or_else(|| {
                BillingError::NotFound(anyhow::anyhow!("Quota {} not found", quota_id))
            })?;
            if matches!(quota.status, QuotaStatus::Paid | QuotaStatus::Cancelled) {
                return Err(BillingError::BadRequest(anyhow::anyhow!(
                    "Quota {} is {}",
                    quota_id,
                    quota.status
                )));
            }
            if quota.unit_id != unit_id {
                return Err(BillingError::BadRequest(anyhow::anyhow!(
                    "Quota {} does not belong to unit {}",
                    quota_id,
                    unit_id
                )));
            }
            if quota.balance <= Decimal::ZERO {
                return Err(BillingError::BadRequest(anyhow::anyhow!(
                    "Quota {} has nothing outstanding",
                    quota_id
                )));
            }

            let split = apply_to_quota(&mut quota, pending.pending_amount)?;
            tx.update_quota(&quota).await?;
            let application = PaymentApplication::new(
                pending.payment_id,
                quota.id,
                split.to_interest,
                split.to_principal,
            );
            tx.insert_application(&application).await?;

            let remainder = pending.pending_amount - application.applied_amount;
            let leftover = if remainder > Decimal::ZERO {
                let leftover =
                    PendingAllocation::new(pending.payment_id, remainder, pending.currency.clone());
                tx.insert_pending_allocation(&leftover).await?;
                Some(leftover)
            } else {
                None
            };

            pending.applied_amount = Some(application.applied_amount);
            pending.status = PendingAllocationStatus::Allocated;
            pending.resolution_type = Some(ResolutionType::AppliedToQuota);
            pending.resolution_notes = notes.clone();
            pending.allocated_to_quota_id = Some(quota.id);
            tx.update_pending_allocation(&pending).await?;

            Ok(Resolved {
                pending,
                application: Some(application),
                leftover,
            })
        }
    }
}
