//! Formula revision tests for billing-engine.

mod common;

use billing_engine::error::BillingError;
use billing_engine::models::{FormulaKind, Period};
use billing_engine::services::BillingStore;
use common::{date, TestBilling};
use rust_decimal_macros::dec;
use uuid::Uuid;

#[tokio::test]
async fn revision_bumps_version_and_drives_later_generation() {
    let billing = TestBilling::new();
    let unit = billing.add_unit("A-1", None);
    let formula = billing.add_fixed_formula(dec!(100)).await;
    let rule = billing.add_rule(formula.id, None, date(2024, 1, 1)).await;
    let schedule = billing
        .add_monthly_schedule(rule.id, Some(date(2025, 3, 1)))
        .await;

    billing
        .engine
        .generate_quotas_for_period(schedule.id, Period::new(2025, 2).unwrap(), None)
        .await
        .unwrap();

    let revised = billing
        .engine
        .revise_formula(
            formula.id,
            FormulaKind::Fixed { amount: dec!(120) },
            " Budget 2025 ",
            billing.admin_id,
        )
        .await
        .unwrap();

    assert_eq!(revised.version, 2);
    assert_eq!(revised.kind, FormulaKind::Fixed { amount: dec!(120) });
    assert_eq!(revised.updated_by, Some(billing.admin_id));
    assert_eq!(revised.update_reason.as_deref(), Some("Budget 2025"));
    assert_eq!(
        billing.store.get_formula(formula.id).await.unwrap(),
        Some(revised.clone())
    );

    let log = billing
        .engine
        .generate_quotas(schedule.id, date(2025, 3, 1), None)
        .await
        .unwrap();
    assert_eq!(log.formula_snapshot.0[formula.id.to_string()]["version"], 2);

    let quotas = billing.quotas_for(unit.id).await;
    assert_eq!(quotas.len(), 2);
    assert_eq!(quotas[0].base_amount, dec!(100));
    assert_eq!(quotas[1].base_amount, dec!(120));
}

#[tokio::test]
async fn invalid_revisions_leave_the_formula_untouched() {
    let billing = TestBilling::new();
    let formula = billing.add_fixed_formula(dec!(100)).await;

    let blank = billing
        .engine
        .revise_formula(
            formula.id,
            FormulaKind::Fixed { amount: dec!(90) },
            "   ",
            billing.admin_id,
        )
        .await;
    assert!(matches!(blank, Err(BillingError::BadRequest(_))));

    let unparseable = billing
        .engine
        .revise_formula(
            formula.id,
            FormulaKind::Expression {
                expression: "area_m2 * (".to_string(),
                variables: Default::default(),
            },
            "Switch to area",
            billing.admin_id,
        )
        .await;
    assert!(matches!(unparseable, Err(BillingError::EvaluationError(_))));

    assert_eq!(
        billing.store.get_formula(formula.id).await.unwrap(),
        Some(formula)
    );

    let missing = billing
        .engine
        .revise_formula(
            Uuid::new_v4(),
            FormulaKind::Fixed { amount: dec!(1) },
            "Unknown",
            billing.admin_id,
        )
        .await;
    assert!(matches!(missing, Err(BillingError::NotFound(_))));
}

#[tokio::test]
async fn revision_is_retried_under_lock_contention() {
    let billing = TestBilling::new();
    let formula = billing.add_fixed_formula(dec!(100)).await;

    billing.store.inject_lock_contention(1);
    let revised = billing
        .engine
        .revise_formula(
            formula.id,
            FormulaKind::Fixed { amount: dec!(110) },
            "Inflation",
            billing.admin_id,
        )
        .await
        .unwrap();

    assert_eq!(revised.version, 2);
}
