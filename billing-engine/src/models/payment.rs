//! Payment, application and pending allocation models.

use crate::error::BillingError;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    PendingVerification,
    Completed,
    Rejected,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::PendingVerification => "pending_verification",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Rejected => "rejected",
        }
    }
}

/// Money received from a unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Payment {
    pub id: Uuid,
    pub unit_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub paid_amount: Decimal,
    pub paid_currency: String,
    pub exchange_rate: Option<Decimal>,
    pub payment_date: NaiveDate,
    pub status: PaymentStatus,
    /// Administrator who verified or rejected the payment.
    pub verified_by: Option<Uuid>,
    pub verified_at: Option<DateTime<Utc>>,
    pub verification_notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Payment {
    pub fn ensure_pending_verification(&self) -> Result<(), BillingError> {
        if self.status != PaymentStatus::PendingVerification {
            return Err(BillingError::BadRequest(anyhow::anyhow!(
                "Payment {} is not pending verification. Current status: {}",
                self.id,
                self.status.as_str()
            )));
        }
        Ok(())
    }

    /// Record an administrator's decision on a payment awaiting verification.
    pub fn settle_verification(
        &mut self,
        status: PaymentStatus,
        actor: Uuid,
        notes: Option<&str>,
    ) -> Result<(), BillingError> {
        self.ensure_pending_verification()?;
        self.status = status;
        self.verified_by = Some(actor);
        self.verified_at = Some(Utc::now());
        self.verification_notes = notes
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string);
        Ok(())
    }
}

/// Portion of a payment applied to one quota. Never updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct PaymentApplication {
    pub id: Uuid,
    pub payment_id: Uuid,
    pub quota_id: Uuid,
    pub applied_amount: Decimal,
    pub applied_to_interest: Decimal,
    pub applied_to_principal: Decimal,
    pub created_at: DateTime<Utc>,
}

impl PaymentApplication {
    pub fn new(payment_id: Uuid, quota_id: Uuid, to_interest: Decimal, to_principal: Decimal) -> Self {
        Self {
            id: Uuid::new_v4(),
            payment_id,
            quota_id,
            applied_amount: to_interest + to_principal,
            applied_to_interest: to_interest,
            applied_to_principal: to_principal,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PendingAllocationStatus {
    Pending,
    Allocated,
    Refunded,
}

impl PendingAllocationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PendingAllocationStatus::Pending => "pending",
            PendingAllocationStatus::Allocated => "allocated",
            PendingAllocationStatus::Refunded => "refunded",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ResolutionType {
    AppliedToQuota,
    Refunded,
}

impl ResolutionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionType::AppliedToQuota => "applied_to_quota",
            ResolutionType::Refunded => "refunded",
        }
    }
}

/// Excess of a payment awaiting an administrative decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct PendingAllocation {
    pub id: Uuid,
    pub payment_id: Uuid,
    /// Amount parked when the allocation was created. Never changes.
    pub pending_amount: Decimal,
    /// Part of `pending_amount` applied to a quota on resolution; the rest
    /// moves to a new pending allocation.
    pub applied_amount: Option<Decimal>,
    pub currency: String,
    pub status: PendingAllocationStatus,
    pub resolution_type: Option<ResolutionType>,
    pub resolution_notes: Option<String>,
    pub allocated_to_quota_id: Option<Uuid>,
    pub allocated_by: Option<Uuid>,
    pub allocated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl PendingAllocation {
    pub fn new(payment_id: Uuid, pending_amount: Decimal, currency: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            payment_id,
            pending_amount,
            applied_amount: None,
            currency: currency.into(),
            status: PendingAllocationStatus::Pending,
            resolution_type: None,
            resolution_notes: None,
            allocated_to_quota_id: None,
            allocated_by: None,
            allocated_at: None,
            created_at: Utc::now(),
        }
    }

    /// Money of this allocation not yet applied to a quota.
    pub fn unapplied_amount(&self) -> Decimal {
        match self.status {
            PendingAllocationStatus::Allocated => Decimal::ZERO,
            _ => self.pending_amount,
        }
    }
}

/// Administrative decision on a pending allocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Resolution {
    ApplyToQuota {
        quota_id: Uuid,
        notes: Option<String>,
    },
    Refund {
        notes: String,
    },
}

/// Result of allocating one payment.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AllocationResult {
    pub applications: Vec<PaymentApplication>,
    pub pending_allocation: Option<PendingAllocation>,
}

impl AllocationResult {
    pub fn total_applied(&self) -> Decimal {
        self.applications.iter().map(|a| a.applied_amount).sum()
    }

    pub fn total_pending(&self) -> Decimal {
        self.pending_allocation
            .as_ref()
            .map(|p| p.pending_amount)
            .unwrap_or(Decimal::ZERO)
    }
}
