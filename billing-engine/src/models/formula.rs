//! Quota formula model.

use crate::engine::formula::{is_reserved_variable, Expr};
use crate::error::BillingError;
use crate::models::RecordState;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use std::collections::BTreeMap;
use uuid::Uuid;

/// How a formula derives a unit's base amount.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FormulaKind {
    Fixed {
        amount: Decimal,
    },
    Expression {
        expression: String,
        #[serde(default)]
        variables: BTreeMap<String, Decimal>,
    },
    UnitAmounts {
        amounts: BTreeMap<Uuid, Decimal>,
    },
}

impl FormulaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FormulaKind::Fixed { .. } => "fixed",
            FormulaKind::Expression { .. } => "expression",
            FormulaKind::UnitAmounts { .. } => "unit_amounts",
        }
    }

    /// Check the variant is internally consistent.
    pub fn validate(&self) -> Result<(), BillingError> {
        match self {
            FormulaKind::Fixed { amount } => {
                if *amount < Decimal::ZERO {
                    return Err(BillingError::ConfigurationError(format!(
                        "fixed amount must not be negative, got {}",
                        amount
                    )));
                }
            }
            FormulaKind::Expression {
                expression,
                variables,
            } => {
                if let Some(name) = variables.keys().find(|k| is_reserved_variable(k)) {
                    return Err(BillingError::ConfigurationError(format!(
                        "formula variable '{}' shadows a unit attribute",
                        name
                    )));
                }
                Expr::parse(expression, |name| {
                    is_reserved_variable(name) || variables.contains_key(name)
                })?;
            }
            FormulaKind::UnitAmounts { amounts } => {
                if amounts.is_empty() {
                    return Err(BillingError::ConfigurationError(
                        "unit amounts formula has no entries".to_string(),
                    ));
                }
                if let Some((unit_id, amount)) =
                    amounts.iter().find(|(_, a)| **a < Decimal::ZERO)
                {
                    return Err(BillingError::ConfigurationError(format!(
                        "amount {} for unit {} must not be negative",
                        amount, unit_id
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Admin-authored rule producing a base charge amount for a unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaFormula {
    pub id: Uuid,
    pub condominium_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub kind: FormulaKind,
    pub currency: String,
    pub state: RecordState,
    pub version: i32,
    pub updated_by: Option<Uuid>,
    pub update_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QuotaFormula {
    /// Build an active formula, validating `kind`.
    pub fn new(
        condominium_id: Uuid,
        name: impl Into<String>,
        kind: FormulaKind,
        currency: impl Into<String>,
    ) -> Result<Self, BillingError> {
        kind.validate()?;
        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4(),
            condominium_id,
            name: name.into(),
            description: None,
            kind,
            currency: currency.into(),
            state: RecordState::Active,
            version: 1,
            updated_by: None,
            update_reason: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Replace the formula body and record who changed it and why. The
    /// version is bumped by the store when the revision is written.
    pub fn revise(
        &mut self,
        kind: FormulaKind,
        updated_by: Uuid,
        reason: &str,
    ) -> Result<(), BillingError> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(BillingError::BadRequest(anyhow::anyhow!(
                "A reason is required to change formula '{}'",
                self.name
            )));
        }
        kind.validate()?;
        self.kind = kind;
        self.updated_by = Some(updated_by);
        self.update_reason = Some(reason.to_string());
        self.updated_at = Utc::now();
        Ok(())
    }
}

impl From<&QuotaFormula> for QuotaFormulaRow {
    fn from(formula: &QuotaFormula) -> Self {
        let (fixed_amount, expression, variables, unit_amounts) = match &formula.kind {
            FormulaKind::Fixed { amount } => (Some(*amount), None, None, None),
            FormulaKind::Expression {
                expression,
                variables,
            } => (None, Some(expression.clone()), Some(Json(variables.clone())), None),
            FormulaKind::UnitAmounts { amounts } => (None, None, None, Some(Json(amounts.clone()))),
        };
        Self {
            id: formula.id,
            condominium_id: formula.condominium_id,
            name: formula.name.clone(),
            description: formula.description.clone(),
            formula_type: formula.kind.as_str().to_string(),
            fixed_amount,
            expression,
            variables,
            unit_amounts,
            currency: formula.currency.clone(),
            state: formula.state,
            version: formula.version,
            updated_by: formula.updated_by,
            update_reason: formula.update_reason.clone(),
            created_at: formula.created_at,
            updated_at: formula.updated_at,
        }
    }
}

/// Flat storage row for [`QuotaFormula`].
#[derive(Debug, Clone, FromRow)]
pub struct QuotaFormulaRow {
    pub id: Uuid,
    pub condominium_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub formula_type: String,
    pub fixed_amount: Option<Decimal>,
    pub expression: Option<String>,
    pub variables: Option<Json<BTreeMap<String, Decimal>>>,
    pub unit_amounts: Option<Json<BTreeMap<Uuid, Decimal>>>,
    pub currency: String,
    pub state: RecordState,
    pub version: i32,
    pub updated_by: Option<Uuid>,
    pub update_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<QuotaFormulaRow> for QuotaFormula {
    type Error = BillingError;

    fn try_from(row: QuotaFormulaRow) -> Result<Self, Self::Error> {
        let missing = |field: &str| {
            BillingError::ConfigurationError(format!(
                "formula {} of type {} has no {}",
                row.id, row.formula_type, field
            ))
        };

        let kind = match row.formula_type.as_str() {
            "fixed" => FormulaKind::Fixed {
                amount: row.fixed_amount.ok_or_else(|| missing("fixed_amount"))?,
            },
            "expression" => FormulaKind::Expression {
                expression: row.expression.clone().ok_or_else(|| missing("expression"))?,
                variables: row.variables.clone().map(|v| v.0).unwrap_or_default(),
            },
            "unit_amounts" => FormulaKind::UnitAmounts {
                amounts: row
                    .unit_amounts
                    .clone()
                    .map(|v| v.0)
                    .ok_or_else(|| missing("unit_amounts"))?,
            },
            other => {
                return Err(BillingError::ConfigurationError(format!(
                    "unknown formula type '{}'",
                    other
                )))
            }
        };

        Ok(Self {
            id: row.id,
            condominium_id: row.condominium_id,
            name: row.name,
            description: row.description,
            kind,
            currency: row.currency,
            state: row.state,
            version: row.version,
            updated_by: row.updated_by,
            update_reason: row.update_reason,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
