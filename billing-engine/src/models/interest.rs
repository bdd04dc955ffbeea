//! Interest configuration and accrual summary models.

use crate::models::RecordState;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum InterestType {
    Simple,
    Compound,
    Fixed,
}

impl InterestType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InterestType::Simple => "simple",
            InterestType::Compound => "compound",
            InterestType::Fixed => "fixed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CalculationPeriod {
    Daily,
    Monthly,
}

impl CalculationPeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            CalculationPeriod::Daily => "daily",
            CalculationPeriod::Monthly => "monthly",
        }
    }
}

/// Late-payment interest policy for a condominium, building or concept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct InterestConfiguration {
    pub id: Uuid,
    pub condominium_id: Uuid,
    pub building_id: Option<Uuid>,
    pub payment_concept_id: Option<Uuid>,
    pub name: String,
    pub interest_type: InterestType,
    pub rate: Option<Decimal>,
    pub fixed_amount: Option<Decimal>,
    pub calculation_period: CalculationPeriod,
    pub grace_period_days: i32,
    pub effective_from: NaiveDate,
    pub effective_to: Option<NaiveDate>,
    pub state: RecordState,
    pub created_at: DateTime<Utc>,
}

impl InterestConfiguration {
    pub fn is_effective_on(&self, date: NaiveDate) -> bool {
        self.state.is_active()
            && self.effective_from <= date
            && self.effective_to.map_or(true, |to| date <= to)
    }

    /// Whether this configuration covers a quota with the given scope.
    pub fn applies_to(&self, condominium_id: Uuid, building_id: Uuid, concept_id: Uuid) -> bool {
        self.condominium_id == condominium_id
            && self.building_id.map_or(true, |b| b == building_id)
            && self.payment_concept_id.map_or(true, |c| c == concept_id)
    }

    /// Higher is more specific: building + concept, building, concept, condominium.
    pub fn specificity(&self) -> u8 {
        match (self.building_id.is_some(), self.payment_concept_id.is_some()) {
            (true, true) => 3,
            (true, false) => 2,
            (false, true) => 1,
            (false, false) => 0,
        }
    }
}

/// Narrows an accrual run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AccrualScope {
    #[default]
    All,
    Condominium(Uuid),
    Building(Uuid),
}

/// Quota that could not be accrued, with the reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccrualFailure {
    pub quota_id: Uuid,
    pub error_type: String,
    pub reason: String,
}

/// Outcome of one accrual run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AccrualSummary {
    pub as_of: Option<NaiveDate>,
    pub quotas_scanned: u32,
    pub quotas_updated: u32,
    pub quotas_marked_overdue: u32,
    pub quotas_failed: u32,
    pub failures: Vec<AccrualFailure>,
    pub total_interest: Decimal,
}
