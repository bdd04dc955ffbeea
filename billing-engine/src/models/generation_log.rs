//! Generation log model.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

/// How a generation run was triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum GenerationMethod {
    Scheduled,
    Manual,
}

impl GenerationMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationMethod::Scheduled => "scheduled",
            GenerationMethod::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum GenerationStatus {
    Completed,
    Partial,
    Failed,
    Skipped,
}

impl GenerationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationStatus::Completed => "completed",
            GenerationStatus::Partial => "partial",
            GenerationStatus::Failed => "failed",
            GenerationStatus::Skipped => "skipped",
        }
    }

    /// Status of a run from its counters.
    pub fn from_counts(created: u32, failed: u32) -> Self {
        match (created, failed) {
            (_, 0) => GenerationStatus::Completed,
            (0, _) => GenerationStatus::Failed,
            _ => GenerationStatus::Partial,
        }
    }
}

/// Audit record of one generation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct GenerationLog {
    pub id: Uuid,
    pub schedule_id: Option<Uuid>,
    pub rule_id: Uuid,
    pub generation_method: GenerationMethod,
    pub period_year: Option<i32>,
    pub period_month: Option<i32>,
    pub period_description: Option<String>,
    pub quotas_created: i32,
    pub quotas_failed: i32,
    pub quotas_skipped: i32,
    pub total_amount: Decimal,
    pub currency: Option<String>,
    pub units_affected: Json<Vec<Uuid>>,
    pub parameters: Json<serde_json::Value>,
    pub formula_snapshot: Json<serde_json::Value>,
    pub status: GenerationStatus,
    pub error_details: Option<String>,
    pub generated_by: Option<Uuid>,
    pub generated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_from_counts() {
        assert_eq!(GenerationStatus::from_counts(5, 0), GenerationStatus::Completed);
        assert_eq!(GenerationStatus::from_counts(0, 0), GenerationStatus::Completed);
        assert_eq!(GenerationStatus::from_counts(3, 2), GenerationStatus::Partial);
        assert_eq!(GenerationStatus::from_counts(0, 4), GenerationStatus::Failed);
    }
}
