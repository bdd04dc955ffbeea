//! Quota and quota adjustment models.

use crate::models::Period;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Quota lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum QuotaStatus {
    Pending,
    Partial,
    Paid,
    Overdue,
    Cancelled,
}

impl QuotaStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuotaStatus::Pending => "pending",
            QuotaStatus::Partial => "partial",
            QuotaStatus::Paid => "paid",
            QuotaStatus::Overdue => "overdue",
            QuotaStatus::Cancelled => "cancelled",
        }
    }

    /// Statuses that still expect money.
    pub fn is_outstanding(&self) -> bool {
        matches!(
            self,
            QuotaStatus::Pending | QuotaStatus::Partial | QuotaStatus::Overdue
        )
    }
}

impl std::fmt::Display for QuotaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A periodic charge for one unit and payment concept.
///
/// `base_amount` is in the charge currency. Interest, payments and the
/// balance are tracked in the base currency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Quota {
    pub id: Uuid,
    pub unit_id: Uuid,
    pub condominium_id: Uuid,
    pub building_id: Uuid,
    pub payment_concept_id: Uuid,
    pub period_year: i32,
    pub period_month: i32,
    pub period_description: String,
    pub base_amount: Decimal,
    pub currency: String,
    pub amount_in_base_currency: Decimal,
    pub exchange_rate_used: Option<Decimal>,
    pub interest_amount: Decimal,
    pub interest_paid: Decimal,
    pub paid_amount: Decimal,
    pub balance: Decimal,
    pub issue_date: NaiveDate,
    pub due_date: NaiveDate,
    pub status: QuotaStatus,
    pub generation_log_id: Option<Uuid>,
    pub version: i32,
    pub created_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Quota {
    pub fn period(&self) -> Option<Period> {
        Period::new(self.period_year, self.period_month as u32)
    }

    /// Total owed: charge plus interest, in the base currency.
    pub fn total_due(&self) -> Decimal {
        self.amount_in_base_currency + self.interest_amount
    }

    /// Interest accrued but not yet covered by payments.
    pub fn interest_outstanding(&self) -> Decimal {
        (self.interest_amount - self.interest_paid).max(Decimal::ZERO)
    }

    /// Part of `paid_amount` that went to the charge itself.
    pub fn principal_paid(&self) -> Decimal {
        self.paid_amount - self.interest_paid
    }

    /// Charge amount not yet paid.
    pub fn principal_outstanding(&self) -> Decimal {
        (self.amount_in_base_currency - self.principal_paid()).max(Decimal::ZERO)
    }

    /// Balance implied by the ledger fields.
    pub fn computed_balance(&self) -> Decimal {
        self.total_due() - self.paid_amount
    }

    /// Derive balance and status after the ledger fields changed.
    pub fn refresh(&mut self, today: NaiveDate) {
        self.balance = self.computed_balance();
        if self.status == QuotaStatus::Cancelled {
            return;
        }
        self.status = if self.balance.is_zero() {
            QuotaStatus::Paid
        } else if self.due_date < today {
            QuotaStatus::Overdue
        } else if self.paid_amount > Decimal::ZERO {
            QuotaStatus::Partial
        } else {
            QuotaStatus::Pending
        };
    }
}

/// Kind of administrative change recorded against a quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AdjustmentType {
    Discount,
    Increase,
    Correction,
    Waiver,
    Interest,
    Cancellation,
}

impl AdjustmentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdjustmentType::Discount => "discount",
            AdjustmentType::Increase => "increase",
            AdjustmentType::Correction => "correction",
            AdjustmentType::Waiver => "waiver",
            AdjustmentType::Interest => "interest",
            AdjustmentType::Cancellation => "cancellation",
        }
    }
}

/// Immutable audit record of a quota amount change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct QuotaAdjustment {
    pub id: Uuid,
    pub quota_id: Uuid,
    pub previous_amount: Decimal,
    pub new_amount: Decimal,
    pub adjustment_type: AdjustmentType,
    pub reason: String,
    pub created_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl QuotaAdjustment {
    pub fn new(
        quota_id: Uuid,
        previous_amount: Decimal,
        new_amount: Decimal,
        adjustment_type: AdjustmentType,
        reason: impl Into<String>,
        created_by: Option<Uuid>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            quota_id,
            previous_amount,
            new_amount,
            adjustment_type,
            reason: reason.into(),
            created_by,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn quota(amount: Decimal, due: NaiveDate) -> Quota {
        Quota {
            id: Uuid::new_v4(),
            unit_id: Uuid::new_v4(),
            condominium_id: Uuid::new_v4(),
            building_id: Uuid::new_v4(),
            payment_concept_id: Uuid::new_v4(),
            period_year: 2025,
            period_month: 1,
            period_description: "January 2025".to_string(),
            base_amount: amount,
            currency: "USD".to_string(),
            amount_in_base_currency: amount,
            exchange_rate_used: None,
            interest_amount: Decimal::ZERO,
            interest_paid: Decimal::ZERO,
            paid_amount: Decimal::ZERO,
            balance: amount,
            issue_date: due,
            due_date: due,
            status: QuotaStatus::Pending,
            generation_log_id: None,
            version: 1,
            created_by: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_refresh_status_transitions() {
        let mut q = quota(dec!(100), date(2025, 1, 15));

        q.paid_amount = dec!(40);
        q.refresh(date(2025, 1, 10));
        assert_eq!(q.balance, dec!(60));
        assert_eq!(q.status, QuotaStatus::Partial);

        q.refresh(date(2025, 2, 1));
        assert_eq!(q.status, QuotaStatus::Overdue);

        q.paid_amount = dec!(100);
        q.refresh(date(2025, 2, 1));
        assert_eq!(q.balance, Decimal::ZERO);
        assert_eq!(q.status, QuotaStatus::Paid);
    }

    #[test]
    fn test_cancelled_status_is_sticky() {
        let mut q = quota(dec!(100), date(2025, 1, 15));
        q.status = QuotaStatus::Cancelled;
        q.refresh(date(2025, 3, 1));
        assert_eq!(q.status, QuotaStatus::Cancelled);
    }

    #[test]
    fn test_interest_and_principal_split() {
        let mut q = quota(dec!(80), date(2025, 1, 15));
        q.interest_amount = dec!(20);
        q.interest_paid = dec!(5);
        q.paid_amount = dec!(15);
        assert_eq!(q.interest_outstanding(), dec!(15));
        assert_eq!(q.principal_paid(), dec!(10));
        assert_eq!(q.principal_outstanding(), dec!(70));
        assert_eq!(q.computed_balance(), dec!(85));
    }
}
