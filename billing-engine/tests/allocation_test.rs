//! Payment allocation integration tests for billing-engine.

mod common;

use billing_engine::error::BillingError;
use billing_engine::models::{PaymentStatus, PendingAllocationStatus, QuotaStatus};
use billing_engine::services::BillingStore;
use common::{date, quota_fixture, TestBilling, LOCAL_CURRENCY};
use proptest::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use uuid::Uuid;

#[tokio::test]
async fn payment_is_applied_oldest_quota_first() {
    let billing = TestBilling::new();
    let unit = billing.add_unit("A-1", None);
    let march = billing.seed_quota(unit.id, date(2025, 3, 1), dec!(100)).await;
    let january = billing.seed_quota(unit.id, date(2025, 1, 1), dec!(100)).await;
    let february = billing.seed_quota(unit.id, date(2025, 2, 1), dec!(100)).await;
    let payment = billing.add_payment(unit.id, dec!(150)).await;

    let result = billing.engine.allocate_payment(payment.id).await.unwrap();

    assert_eq!(result.applications.len(), 2);
    assert_eq!(result.applications[0].quota_id, january.id);
    assert_eq!(result.applications[0].applied_amount, dec!(100));
    assert_eq!(result.applications[1].quota_id, february.id);
    assert_eq!(result.applications[1].applied_amount, dec!(50));
    assert!(result.pending_allocation.is_none());
    assert_eq!(result.total_applied(), dec!(150));

    let january = billing.quota(january.id).await;
    assert_eq!(january.status, QuotaStatus::Paid);
    assert_eq!(january.balance, Decimal::ZERO);

    let february = billing.quota(february.id).await;
    assert_eq!(february.status, QuotaStatus::Partial);
    assert_eq!(february.paid_amount, dec!(50));
    assert_eq!(february.balance, dec!(50));

    let march = billing.quota(march.id).await;
    assert_eq!(march.status, QuotaStatus::Pending);
    assert_eq!(march.balance, dec!(100));
}

#[tokio::test]
async fn interest_is_settled_before_principal() {
    let billing = TestBilling::new();
    let unit = billing.add_unit("A-2", None);
    let mut quota = quota_fixture(
        unit.id,
        billing.condominium_id,
        billing.building_id,
        Uuid::new_v4(),
        date(2025, 1, 15),
        dec!(80),
    );
    quota.interest_amount = dec!(20);
    quota.balance = dec!(100);
    quota.status = QuotaStatus::Overdue;
    billing.store.seed_quota(quota.clone()).await;
    let payment = billing.add_payment(unit.id, dec!(30)).await;

    let result = billing.engine.allocate_payment(payment.id).await.unwrap();

    let application = &result.applications[0];
    assert_eq!(application.applied_to_interest, dec!(20));
    assert_eq!(application.applied_to_principal, dec!(10));
    assert_eq!(application.applied_amount, dec!(30));

    let stored = billing.quota(quota.id).await;
    assert_eq!(stored.interest_paid, dec!(20));
    assert_eq!(stored.paid_amount, dec!(30));
    assert_eq!(stored.balance, dec!(70));
    assert_eq!(stored.status, QuotaStatus::Partial);
}

#[tokio::test]
async fn overpayment_creates_pending_allocation() {
    let billing = TestBilling::new();
    let unit = billing.add_unit("A-3", None);
    let quota = billing.seed_quota(unit.id, date(2025, 1, 1), dec!(100)).await;
    let payment = billing.add_payment(unit.id, dec!(130)).await;

    let result = billing.engine.allocate_payment(payment.id).await.unwrap();

    assert_eq!(result.total_applied(), dec!(100));
    let pending = result.pending_allocation.expect("pending allocation");
    assert_eq!(pending.pending_amount, dec!(30));
    assert_eq!(pending.status, PendingAllocationStatus::Pending);
    assert_eq!(pending.payment_id, payment.id);
    assert_eq!(billing.quota(quota.id).await.status, QuotaStatus::Paid);

    let stored = billing
        .store
        .list_pending_allocations_for_payment(payment.id)
        .await
        .unwrap();
    assert_eq!(stored, vec![pending]);
}

#[tokio::test]
async fn unit_without_debt_sends_everything_to_pending() {
    let billing = TestBilling::new();
    let unit = billing.add_unit("A-4", None);
    let payment = billing.add_payment(unit.id, dec!(45.50)).await;

    let result = billing.engine.allocate_payment(payment.id).await.unwrap();

    assert!(result.applications.is_empty());
    assert_eq!(result.total_pending(), dec!(45.50));
}

#[tokio::test]
async fn allocating_twice_returns_the_first_result() {
    let billing = TestBilling::new();
    let unit = billing.add_unit("A-5", None);
    let quota = billing.seed_quota(unit.id, date(2025, 1, 1), dec!(100)).await;
    let payment = billing.add_payment(unit.id, dec!(60)).await;

    let first = billing.engine.allocate_payment(payment.id).await.unwrap();
    let second = billing.engine.allocate_payment(payment.id).await.unwrap();

    assert_eq!(first, second);
    let stored = billing.quota(quota.id).await;
    assert_eq!(stored.paid_amount, dec!(60));
    assert_eq!(stored.version, 2);
    assert_eq!(
        billing
            .store
            .list_applications_for_payment(payment.id)
            .await
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn only_completed_payments_are_allocated() {
    let billing = TestBilling::new();
    let unit = billing.add_unit("A-6", None);
    billing.seed_quota(unit.id, date(2025, 1, 1), dec!(100)).await;
    let mut payment = billing.add_payment(unit.id, dec!(50)).await;
    payment.id = Uuid::new_v4();
    payment.status = PaymentStatus::PendingVerification;
    billing.store.insert_payment(payment.clone()).await;

    let unverified = billing.engine.allocate_payment(payment.id).await;
    assert!(matches!(unverified, Err(BillingError::BadRequest(_))));

    let missing = billing.engine.allocate_payment(Uuid::new_v4()).await;
    assert!(matches!(missing, Err(BillingError::NotFound(_))));
}

#[tokio::test]
async fn lock_contention_is_retried() {
    let billing = TestBilling::new();
    let unit = billing.add_unit("A-7", None);
    let quota = billing.seed_quota(unit.id, date(2025, 1, 1), dec!(100)).await;
    let payment = billing.add_payment(unit.id, dec!(100)).await;

    billing.store.inject_lock_contention(1);
    let result = billing.engine.allocate_payment(payment.id).await.unwrap();

    assert_eq!(result.total_applied(), dec!(100));
    assert_eq!(billing.quota(quota.id).await.status, QuotaStatus::Paid);
}

#[tokio::test]
async fn persistent_contention_exhausts_retries_without_writing() {
    let billing = TestBilling::new();
    let unit = billing.add_unit("A-8", None);
    let quota = billing.seed_quota(unit.id, date(2025, 1, 1), dec!(100)).await;
    let payment = billing.add_payment(unit.id, dec!(100)).await;

    billing.store.inject_lock_contention(10);
    let result = billing.engine.allocate_payment(payment.id).await;
    billing.store.inject_lock_contention(0);

    match result {
        Err(BillingError::RetryExhausted {
            operation,
            attempts,
            ..
        }) => {
            assert_eq!(operation, "allocate_payment");
            assert_eq!(attempts, 3);
        }
        other => panic!("expected RetryExhausted, got {:?}", other),
    }

    let stored = billing.quota(quota.id).await;
    assert_eq!(stored.paid_amount, Decimal::ZERO);
    assert!(billing
        .store
        .list_applications_for_payment(payment.id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn foreign_currency_payment_uses_its_rate() {
    let billing = TestBilling::new();
    let unit = billing.add_unit("A-9", None);
    let quota = billing.seed_quota(unit.id, date(2025, 1, 1), dec!(100)).await;
    let payment = billing
        .add_payment_in(unit.id, dec!(2000), LOCAL_CURRENCY, Some(dec!(0.025)))
        .await;

    let result = billing.engine.allocate_payment(payment.id).await.unwrap();

    assert_eq!(result.total_applied(), dec!(50.00));
    assert_eq!(billing.quota(quota.id).await.balance, dec!(50.00));
}

#[tokio::test]
async fn foreign_currency_payment_falls_back_to_directory_rate() {
    let billing = TestBilling::new();
    billing.add_rate(LOCAL_CURRENCY, dec!(0.02), date(2025, 3, 1));
    let unit = billing.add_unit("A-10", None);
    billing.seed_quota(unit.id, date(2025, 1, 1), dec!(100)).await;
    let payment = billing
        .add_payment_in(unit.id, dec!(1000), LOCAL_CURRENCY, None)
        .await;

    let result = billing.engine.allocate_payment(payment.id).await.unwrap();

    assert_eq!(result.total_applied(), dec!(20.00));
}

#[tokio::test]
async fn cancelled_quotas_are_not_paid() {
    let billing = TestBilling::new();
    let unit = billing.add_unit("A-11", None);
    let cancelled = billing.seed_quota(unit.id, date(2025, 1, 1), dec!(100)).await;
    let open = billing.seed_quota(unit.id, date(2025, 2, 1), dec!(100)).await;
    billing
        .engine
        .cancel_quota(cancelled.id, "Duplicate charge", billing.admin_id)
        .await
        .unwrap();
    let payment = billing.add_payment(unit.id, dec!(100)).await;

    let result = billing.engine.allocate_payment(payment.id).await.unwrap();

    assert_eq!(result.applications.len(), 1);
    assert_eq!(result.applications[0].quota_id, open.id);
    assert_eq!(billing.quota(cancelled.id).await.paid_amount, Decimal::ZERO);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Every cent of a payment lands in an application or the pending
    /// allocation, and no quota ends with a negative balance.
    #[test]
    fn prop_allocation_conserves_payment(
        quota_cents in prop::collection::vec(1u32..50_000u32, 0..6),
        payment_cents in 1u32..200_000u32,
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let billing = TestBilling::new();
            let unit = billing.add_unit("P-1", None);
            let mut seeded = Vec::new();
            for (i, cents) in quota_cents.iter().enumerate() {
                let due = date(2025, 1, 1 + i as u32);
                let quota = billing
                    .seed_quota(unit.id, due, Decimal::new(*cents as i64, 2))
                    .await;
                seeded.push(quota);
            }
            let amount = Decimal::new(payment_cents as i64, 2);
            let payment = billing.add_payment(unit.id, amount).await;

            let result = billing.engine.allocate_payment(payment.id).await.unwrap();

            prop_assert_eq!(result.total_applied() + result.total_pending(), amount);
            let owed: Decimal = seeded.iter().map(|q| q.balance).sum();
            prop_assert_eq!(result.total_applied(), amount.min(owed));

            for quota in &seeded {
                let stored = billing.quota(quota.id).await;
                prop_assert!(stored.balance >= Decimal::ZERO);
                prop_assert_eq!(stored.balance + stored.paid_amount, quota.balance);
            }
            Ok(())
        })?;
    }
}
