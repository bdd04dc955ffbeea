//! Interest accrual integration tests for billing-engine.

mod common;

use billing_engine::models::{
    AccrualScope, AdjustmentType, CalculationPeriod, InterestConfiguration, InterestType,
    QuotaStatus, RecordState,
};
use billing_engine::services::BillingStore;
use chrono::Utc;
use common::{date, quota_fixture, TestBilling};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use uuid::Uuid;

#[tokio::test]
async fn simple_daily_interest_marks_quota_overdue() {
    let billing = TestBilling::new();
    let unit = billing.add_unit("A-1", None);
    let quota = billing.seed_quota(unit.id, date(2025, 1, 15), dec!(100)).await;
    billing
        .add_interest_configuration(
            InterestType::Simple,
            Some(dec!(0.001)),
            None,
            CalculationPeriod::Daily,
            0,
        )
        .await;

    let summary = billing
        .engine
        .accrue_interest(date(2025, 1, 25), AccrualScope::All)
        .await
        .unwrap();

    assert_eq!(summary.quotas_scanned, 1);
    assert_eq!(summary.quotas_updated, 1);
    assert_eq!(summary.quotas_marked_overdue, 1);
    assert_eq!(summary.quotas_failed, 0);
    assert_eq!(summary.total_interest, dec!(1.00));

    let stored = billing.quota(quota.id).await;
    assert_eq!(stored.interest_amount, dec!(1.00));
    assert_eq!(stored.balance, dec!(101.00));
    assert_eq!(stored.status, QuotaStatus::Overdue);
    assert_eq!(stored.version, 2);

    let adjustments = billing.store.list_adjustments(quota.id).await.unwrap();
    assert_eq!(adjustments.len(), 1);
    assert_eq!(adjustments[0].adjustment_type, AdjustmentType::Interest);
    assert_eq!(adjustments[0].previous_amount, Decimal::ZERO);
    assert_eq!(adjustments[0].new_amount, dec!(1.00));
}

#[tokio::test]
async fn rerunning_for_the_same_date_changes_nothing() {
    let billing = TestBilling::new();
    let unit = billing.add_unit("A-2", None);
    let quota = billing.seed_quota(unit.id, date(2025, 1, 15), dec!(100)).await;
    billing
        .add_interest_configuration(
            InterestType::Simple,
            Some(dec!(0.001)),
            None,
            CalculationPeriod::Daily,
            0,
        )
        .await;

    let as_of = date(2025, 1, 25);
    billing
        .engine
        .accrue_interest(as_of, AccrualScope::All)
        .await
        .unwrap();
    let first = billing.quota(quota.id).await;

    let summary = billing
        .engine
        .accrue_interest(as_of, AccrualScope::All)
        .await
        .unwrap();

    assert_eq!(summary.quotas_scanned, 1);
    assert_eq!(summary.quotas_updated, 0);
    assert_eq!(summary.quotas_marked_overdue, 0);
    assert_eq!(summary.total_interest, dec!(1.00));
    assert_eq!(billing.quota(quota.id).await, first);
    assert_eq!(billing.store.list_adjustments(quota.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn grace_period_defers_interest_but_not_overdue_status() {
    let billing = TestBilling::new();
    let unit = billing.add_unit("A-3", None);
    let quota = billing.seed_quota(unit.id, date(2025, 1, 15), dec!(100)).await;
    billing
        .add_interest_configuration(
            InterestType::Simple,
            Some(dec!(0.001)),
            None,
            CalculationPeriod::Daily,
            15,
        )
        .await;

    let summary = billing
        .engine
        .accrue_interest(date(2025, 1, 25), AccrualScope::All)
        .await
        .unwrap();

    assert_eq!(summary.quotas_updated, 0);
    assert_eq!(summary.quotas_marked_overdue, 1);

    let stored = billing.quota(quota.id).await;
    assert_eq!(stored.interest_amount, Decimal::ZERO);
    assert_eq!(stored.balance, dec!(100));
    assert_eq!(stored.status, QuotaStatus::Overdue);
    assert!(billing.store.list_adjustments(quota.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn compound_monthly_interest() {
    let billing = TestBilling::new();
    let unit = billing.add_unit("B-1", None);
    let quota = billing.seed_quota(unit.id, date(2025, 1, 15), dec!(1000)).await;
    billing
        .add_interest_configuration(
            InterestType::Compound,
            Some(dec!(0.02)),
            None,
            CalculationPeriod::Monthly,
            0,
        )
        .await;

    billing
        .engine
        .accrue_interest(date(2025, 3, 15), AccrualScope::All)
        .await
        .unwrap();

    let stored = billing.quota(quota.id).await;
    assert_eq!(stored.interest_amount, dec!(40.40));
    assert_eq!(stored.balance, dec!(1040.40));
}

#[tokio::test]
async fn fixed_fee_counts_started_periods() {
    let billing = TestBilling::new();
    let unit = billing.add_unit("B-2", None);
    let quota = billing.seed_quota(unit.id, date(2025, 1, 15), dec!(200)).await;
    billing
        .add_interest_configuration(
            InterestType::Fixed,
            None,
            Some(dec!(5)),
            CalculationPeriod::Monthly,
            0,
        )
        .await;

    billing
        .engine
        .accrue_interest(date(2025, 2, 20), AccrualScope::All)
        .await
        .unwrap();

    assert_eq!(billing.quota(quota.id).await.interest_amount, dec!(10.00));
}

#[tokio::test]
async fn conflicting_configuration_fails_only_its_quotas() {
    let billing = TestBilling::new();
    let tower = Uuid::new_v4();
    let good_unit = billing.add_unit("C-1", None);
    let bad_unit = billing.add_unit_in(tower, "T-1", None);

    let good = billing.seed_quota(good_unit.id, date(2025, 1, 15), dec!(100)).await;
    let bad = quota_fixture(
        bad_unit.id,
        billing.condominium_id,
        tower,
        Uuid::new_v4(),
        date(2025, 1, 15),
        dec!(100),
    );
    billing.store.seed_quota(bad.clone()).await;

    billing
        .add_interest_configuration(
            InterestType::Simple,
            Some(dec!(0.001)),
            None,
            CalculationPeriod::Daily,
            0,
        )
        .await;
    billing
        .store
        .insert_interest_configuration(InterestConfiguration {
            id: Uuid::new_v4(),
            condominium_id: billing.condominium_id,
            building_id: Some(tower),
            payment_concept_id: None,
            name: "Tower surcharge".to_string(),
            interest_type: InterestType::Simple,
            rate: Some(dec!(0.01)),
            fixed_amount: Some(dec!(3)),
            calculation_period: CalculationPeriod::Daily,
            grace_period_days: 0,
            effective_from: date(2024, 1, 1),
            effective_to: None,
            state: RecordState::Active,
            created_at: Utc::now(),
        })
        .await;

    let summary = billing
        .engine
        .accrue_interest(date(2025, 1, 25), AccrualScope::All)
        .await
        .unwrap();

    assert_eq!(summary.quotas_scanned, 2);
    assert_eq!(summary.quotas_updated, 1);
    assert_eq!(summary.quotas_failed, 1);
    assert_eq!(summary.failures[0].quota_id, bad.id);
    assert_eq!(summary.failures[0].error_type, "configuration");

    assert_eq!(billing.quota(good.id).await.interest_amount, dec!(1.00));
    let untouched = billing.quota(bad.id).await;
    assert_eq!(untouched.interest_amount, Decimal::ZERO);
    assert_eq!(untouched.status, QuotaStatus::Pending);
}

#[tokio::test]
async fn scope_limits_the_quotas_scanned() {
    let billing = TestBilling::new();
    let tower = Uuid::new_v4();
    let inside = billing.add_unit("D-1", None);
    let outside = billing.add_unit_in(tower, "T-2", None);

    let in_scope = billing.seed_quota(inside.id, date(2025, 1, 15), dec!(100)).await;
    let out_of_scope = quota_fixture(
        outside.id,
        billing.condominium_id,
        tower,
        Uuid::new_v4(),
        date(2025, 1, 15),
        dec!(100),
    );
    billing.store.seed_quota(out_of_scope.clone()).await;
    billing
        .add_interest_configuration(
            InterestType::Simple,
            Some(dec!(0.001)),
            None,
            CalculationPeriod::Daily,
            0,
        )
        .await;

    let summary = billing
        .engine
        .accrue_interest(date(2025, 1, 25), AccrualScope::Building(billing.building_id))
        .await
        .unwrap();

    assert_eq!(summary.quotas_scanned, 1);
    assert_eq!(billing.quota(in_scope.id).await.interest_amount, dec!(1.00));
    assert_eq!(billing.quota(out_of_scope.id).await.interest_amount, Decimal::ZERO);
}

#[tokio::test]
async fn quotas_not_yet_due_are_left_alone() {
    let billing = TestBilling::new();
    let unit = billing.add_unit("E-1", None);
    let quota = billing.seed_quota(unit.id, date(2025, 2, 15), dec!(100)).await;
    billing
        .add_interest_configuration(
            InterestType::Simple,
            Some(dec!(0.001)),
            None,
            CalculationPeriod::Daily,
            0,
        )
        .await;

    let summary = billing
        .engine
        .accrue_interest(date(2025, 2, 15), AccrualScope::All)
        .await
        .unwrap();

    assert_eq!(summary.quotas_scanned, 0);
    assert_eq!(billing.quota(quota.id).await.status, QuotaStatus::Pending);
}
