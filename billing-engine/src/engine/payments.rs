//! Administrative verification of payments awaiting review.

use super::allocator::{allocate_in_tx, Allocation};
use super::BillingEngine;
use crate::error::BillingError;
use crate::models::{AllocationResult, Payment, PaymentStatus};
use crate::services::metrics::{record_error, record_payment_verification};
use crate::services::store::{BillingStore, CurrencyDirectory, StoreTransaction, UnitDirectory};
use serde::{Deserialize, Serialize};
use service_core::retry::retry_with_backoff;
use tracing::{info, instrument};
use uuid::Uuid;

/// A verified payment and the allocation made for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifiedPayment {
    pub payment: Payment,
    pub allocation: AllocationResult,
}

impl<S, U, C> BillingEngine<S, U, C>
where
    S: BillingStore,
    U: UnitDirectory,
    C: CurrencyDirectory,
{
    /// Approve a payment awaiting verification and allocate it in the same
    /// transaction.
    #[instrument(skip(self, notes), fields(payment_id = %payment_id, actor = %actor))]
    pub async fn verify_payment(
        &self,
        payment_id: Uuid,
        actor: Uuid,
        notes: Option<&str>,
    ) -> Result<VerifiedPayment, BillingError> {
        let result = retry_with_backoff(&self.settings.retry, "verify_payment", || {
            self.try_verify(payment_id, actor, notes)
        })
        .await
        .map_err(BillingError::from);

        if let Err(e) = &result {
            record_error(e.kind(), "verify_payment");
        }
        result
    }

    /// Reject a payment awaiting verification. Nothing is allocated.
    #[instrument(skip(self, notes), fields(payment_id = %payment_id, actor = %actor))]
    pub async fn reject_payment(
        &self,
        payment_id: Uuid,
        actor: Uuid,
        notes: Option<&str>,
    ) -> Result<Payment, BillingError> {
        let result = retry_with_backoff(&self.settings.retry, "reject_payment", || {
            self.try_reject(payment_id, actor, notes)
        })
        .await
        .map_err(BillingError::from);

        if let Err(e) = &result {
            record_error(e.kind(), "reject_payment");
        }
        result
    }

    async fn try_verify(
        &self,
        payment_id: Uuid,
        actor: Uuid,
        notes: Option<&str>,
    ) -> Result<VerifiedPayment, BillingError> {
        let payment = self
            .store
            .get_payment(payment_id)
            .await?
            .ok_or_else(|| payment_not_found(payment_id))?;
        payment.ensure_pending_verification()?;
        let amount = self.payment_amount_in_base(&payment).await?;

        let mut tx = self.store.begin().await?;
        let outcome = async {
            let mut payment = tx
                .lock_payment(payment_id)
                .await?
                .ok_or_else(|| payment_not_found(payment_id))?;
            payment.settle_verification(PaymentStatus::Completed, actor, notes)?;
            tx.update_payment_verification(&payment).await?;
            let allocation =
                allocate_in_tx(&mut tx, &payment, amount, &self.settings.base_currency).await?;
            Ok::<_, BillingError>((payment, allocation))
        }
        .await;

        let (payment, allocation) = match outcome {
            Ok(done) => done,
            Err(e) => {
                tx.rollback().await?;
                return Err(e);
            }
        };
        tx.commit().await?;

        record_payment_verification(payment.status.as_str());
        let allocation = match allocation {
            Allocation::Created(result) => {
                self.record_allocation(&payment, amount, &result);
                result
            }
            existing => existing.into_result(),
        };

        info!(unit_id = %payment.unit_id, "Payment verified");
        Ok(VerifiedPayment {
            payment,
            allocation,
        })
    }

    async fn try_reject(
        &self,
        payment_id: Uuid,
        actor: Uuid,
        notes: Option<&str>,
    ) -> Result<Payment, BillingError> {
        let mut tx = self.store.begin().await?;
        let outcome = async {
            let mut payment = tx
                .lock_payment(payment_id)
                .await?
                .ok_or_else(|| payment_not_found(payment_id))?;
            payment.settle_verification(PaymentStatus::Rejected, actor, notes)?;
            tx.update_payment_verification(&payment).await?;
            Ok::<_, BillingError>(payment)
        }
        .await;

        let payment = match outcome {
            Ok(payment) => payment,
            Err(e) => {
                tx.rollback().await?;
                return Err(e);
            }
        };
        tx.commit().await?;

        record_payment_verification(payment.status.as_str());
        info!(unit_id = %payment.unit_id, "Payment rejected");
        Ok(payment)
    }
}

fn payment_not_found(payment_id: Uuid) -> BillingError {
    BillingError::NotFound(anyhow::anyhow!("Payment {} not found", payment_id))
}
