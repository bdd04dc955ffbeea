//! Generation rule and schedule models.

use crate::models::{Period, RecordState};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Binds a payment concept to a formula for a condominium or one of its buildings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct GenerationRule {
    pub id: Uuid,
    pub condominium_id: Uuid,
    pub building_id: Option<Uuid>,
    pub payment_concept_id: Uuid,
    pub quota_formula_id: Uuid,
    pub name: String,
    pub effective_from: NaiveDate,
    pub effective_to: Option<NaiveDate>,
    pub state: RecordState,
    pub created_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl GenerationRule {
    /// Active and within `[effective_from, effective_to]` on `date`.
    pub fn is_effective_on(&self, date: NaiveDate) -> bool {
        self.state.is_active()
            && self.effective_from <= date
            && self.effective_to.map_or(true, |to| date <= to)
    }

    /// Whether this rule applies to a unit in `building_id`.
    pub fn covers_building(&self, building_id: Uuid) -> bool {
        self.building_id.map_or(true, |b| b == building_id)
    }
}

/// Schedule frequency unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    Days,
    Monthly,
    Quarterly,
    SemiAnnual,
    Annual,
}

impl Frequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Frequency::Days => "days",
            Frequency::Monthly => "monthly",
            Frequency::Quarterly => "quarterly",
            Frequency::SemiAnnual => "semi_annual",
            Frequency::Annual => "annual",
        }
    }

    /// Months covered by one unit of this frequency. `days` schedules still
    /// produce monthly quota periods.
    pub fn months(&self) -> u32 {
        match self {
            Frequency::Days | Frequency::Monthly => 1,
            Frequency::Quarterly => 3,
            Frequency::SemiAnnual => 6,
            Frequency::Annual => 12,
        }
    }
}

/// When and how far ahead quotas are generated for a rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct GenerationSchedule {
    pub id: Uuid,
    pub rule_id: Uuid,
    pub name: String,
    pub frequency: Frequency,
    pub frequency_value: i32,
    pub generation_day: i32,
    pub periods_in_advance: i32,
    pub issue_day: i32,
    pub due_day: i32,
    pub grace_days: i32,
    pub state: RecordState,
    pub last_generated_period: Option<String>,
    pub last_generated_at: Option<DateTime<Utc>>,
    pub next_generation_date: Option<NaiveDate>,
    pub version: i32,
    pub created_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GenerationSchedule {
    /// Parsed `last_generated_period`; an unparseable value counts as none.
    pub fn last_period(&self) -> Option<Period> {
        self.last_generated_period
            .as_deref()
            .and_then(|p| p.parse().ok())
    }

    /// Months between two consecutive generated periods.
    pub fn step_months(&self) -> u32 {
        match self.frequency {
            Frequency::Days => 1,
            other => other.months() * self.frequency_value.max(1) as u32,
        }
    }
}
