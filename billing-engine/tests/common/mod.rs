//! Test helper module for billing-engine integration tests.
//!
//! Drives a [`BillingEngine`] over the in-memory store and directory, with
//! fixtures for one condominium, one building and one payment concept.

#![allow(dead_code)]

use billing_engine::engine::{BillingEngine, EngineSettings};
use billing_engine::models::{
    CalculationPeriod, Currency, ExchangeRate, FormulaKind, Frequency, GenerationRule,
    GenerationSchedule, InterestConfiguration, InterestType, Payment, PaymentStatus, Quota,
    QuotaFormula, QuotaStatus, RecordState, Unit,
};
use billing_engine::services::{init_metrics, MemoryDirectory, MemoryStore};
use chrono::{Datelike, NaiveDate, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use service_core::retry::RetryConfig;
use std::sync::{Arc, Once};
use std::time::Duration;
use uuid::Uuid;

pub const BASE_CURRENCY: &str = "USD";
pub const LOCAL_CURRENCY: &str = "VES";

static TRACING: Once = Once::new();

/// Install tracing once for the whole test binary.
pub fn init_test_tracing() {
    TRACING.call_once(|| {
        let level = std::env::var("TEST_LOG").unwrap_or_else(|_| "warn".to_string());
        service_core::observability::init_tracing("billing-engine-test", &level, None);
        init_metrics();
    });
}

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

/// Fast retries so contention tests finish quickly.
pub fn test_settings() -> EngineSettings {
    EngineSettings {
        base_currency: BASE_CURRENCY.to_string(),
        retry: RetryConfig {
            max_retries: 2,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            backoff_multiplier: 2.0,
            add_jitter: false,
        },
        generation_concurrency: 2,
        accrual_concurrency: 4,
    }
}

pub type MemoryEngine = BillingEngine<MemoryStore, MemoryDirectory, MemoryDirectory>;

/// Engine plus fixture identifiers.
pub struct TestBilling {
    pub store: Arc<MemoryStore>,
    pub directory: Arc<MemoryDirectory>,
    pub engine: MemoryEngine,
    pub condominium_id: Uuid,
    pub building_id: Uuid,
    pub concept_id: Uuid,
    pub admin_id: Uuid,
}

impl TestBilling {
    pub fn new() -> Self {
        Self::with_settings(test_settings())
    }

    pub fn with_settings(settings: EngineSettings) -> Self {
        init_test_tracing();

        let store = Arc::new(MemoryStore::new());
        let directory = Arc::new(MemoryDirectory::new());

        directory.add_currency(Currency {
            code: BASE_CURRENCY.to_string(),
            name: "US Dollar".to_string(),
            decimal_places: 2,
            is_base: true,
        });
        directory.add_currency(Currency {
            code: LOCAL_CURRENCY.to_string(),
            name: "Bolivar".to_string(),
            decimal_places: 2,
            is_base: false,
        });

        let engine = BillingEngine::new(store.clone(), directory.clone(), directory.clone(), settings);

        Self {
            store,
            directory,
            engine,
            condominium_id: Uuid::new_v4(),
            building_id: Uuid::new_v4(),
            concept_id: Uuid::new_v4(),
            admin_id: Uuid::new_v4(),
        }
    }

    /// Register `rate` units of base currency per unit of `from`.
    pub fn add_rate(&self, from: &str, rate: Decimal, effective_date: NaiveDate) {
        self.directory.add_rate(ExchangeRate {
            id: Uuid::new_v4(),
            from_currency: from.to_string(),
            to_currency: BASE_CURRENCY.to_string(),
            rate,
            effective_date,
        });
    }

    pub fn add_unit(&self, unit_number: &str, area_m2: Option<Decimal>) -> Unit {
        self.add_unit_in(self.building_id, unit_number, area_m2)
    }

    pub fn add_unit_in(&self, building_id: Uuid, unit_number: &str, area_m2: Option<Decimal>) -> Unit {
        let unit = Unit {
            id: Uuid::new_v4(),
            condominium_id: self.condominium_id,
            building_id,
            unit_number: unit_number.to_string(),
            floor: Some(1),
            area_m2,
            aliquot_percentage: Some(dec!(2.5)),
            bedrooms: Some(2),
            bathrooms: Some(1),
            parking_spaces: Some(1),
            state: RecordState::Active,
        };
        self.directory.add_unit(unit.clone());
        unit
    }

    pub async fn add_formula(&self, name: &str, kind: FormulaKind, currency: &str) -> QuotaFormula {
        let formula = QuotaFormula::new(self.condominium_id, name, kind, currency)
            .expect("valid formula");
        self.store.insert_formula(formula.clone()).await;
        formula
    }

    pub async fn add_fixed_formula(&self, amount: Decimal) -> QuotaFormula {
        self.add_formula("Monthly fee", FormulaKind::Fixed { amount }, BASE_CURRENCY)
            .await
    }

    pub async fn add_rule(
        &self,
        formula_id: Uuid,
        building_id: Option<Uuid>,
        effective_from: NaiveDate,
    ) -> GenerationRule {
        let rule = GenerationRule {
            id: Uuid::new_v4(),
            condominium_id: self.condominium_id,
            building_id,
            payment_concept_id: self.concept_id,
            quota_formula_id: formula_id,
            name: "Maintenance".to_string(),
            effective_from,
            effective_to: None,
            state: RecordState::Active,
            created_by: Some(self.admin_id),
            created_at: Utc::now(),
        };
        self.store.insert_rule(rule.clone()).await;
        rule
    }

    /// Monthly schedule issuing on the 1st and due on the 15th.
    pub async fn add_monthly_schedule(
        &self,
        rule_id: Uuid,
        next_generation_date: Option<NaiveDate>,
    ) -> GenerationSchedule {
        let now = Utc::now();
        let schedule = GenerationSchedule {
            id: Uuid::new_v4(),
            rule_id,
            name: "Monthly maintenance".to_string(),
            frequency: Frequency::Monthly,
            frequency_value: 1,
            generation_day: 1,
            periods_in_advance: 1,
            issue_day: 1,
            due_day: 15,
            grace_days: 0,
            state: RecordState::Active,
            last_generated_period: None,
            last_generated_at: None,
            next_generation_date,
            version: 1,
            created_by: Some(self.admin_id),
            created_at: now,
            updated_at: now,
        };
        self.store.insert_schedule(schedule.clone()).await;
        schedule
    }

    /// Rule and schedule over every unit of the condominium, charging a
    /// fixed base-currency amount.
    pub async fn fixed_schedule(
        &self,
        amount: Decimal,
        next_generation_date: NaiveDate,
    ) -> GenerationSchedule {
        let formula = self.add_fixed_formula(amount).await;
        let rule = self.add_rule(formula.id, None, date(2024, 1, 1)).await;
        self.add_monthly_schedule(rule.id, Some(next_generation_date))
            .await
    }

    /// Seed an unpaid base-currency quota due on `due_date`.
    pub async fn seed_quota(&self, unit_id: Uuid, due_date: NaiveDate, amount: Decimal) -> Quota {
        let quota = quota_fixture(
            unit_id,
            self.condominium_id,
            self.building_id,
            Uuid::new_v4(),
            due_date,
            amount,
        );
        self.store.seed_quota(quota.clone()).await;
        quota
    }

    pub async fn add_payment(&self, unit_id: Uuid, amount: Decimal) -> Payment {
        self.add_payment_in(unit_id, amount, BASE_CURRENCY, None).await
    }

    pub async fn add_payment_in(
        &self,
        unit_id: Uuid,
        paid_amount: Decimal,
        paid_currency: &str,
        exchange_rate: Option<Decimal>,
    ) -> Payment {
        let payment = Payment {
            id: Uuid::new_v4(),
            unit_id,
            amount: paid_amount,
            currency: paid_currency.to_string(),
            paid_amount,
            paid_currency: paid_currency.to_string(),
            exchange_rate,
            payment_date: date(2025, 3, 5),
            status: PaymentStatus::Completed,
            verified_by: None,
            verified_at: None,
            verification_notes: None,
            created_at: Utc::now(),
        };
        self.store.insert_payment(payment.clone()).await;
        payment
    }

    /// Payment registered by a resident and not yet reviewed.
    pub async fn add_unverified_payment(&self, unit_id: Uuid, amount: Decimal) -> Payment {
        let mut payment = self.add_payment(unit_id, amount).await;
        payment.status = PaymentStatus::PendingVerification;
        self.store.insert_payment(payment.clone()).await;
        payment
    }

    pub async fn add_interest_configuration(
        &self,
        interest_type: InterestType,
        rate: Option<Decimal>,
        fixed_amount: Option<Decimal>,
        calculation_period: CalculationPeriod,
        grace_period_days: i32,
    ) -> InterestConfiguration {
        let config = InterestConfiguration {
            id: Uuid::new_v4(),
            condominium_id: self.condominium_id,
            building_id: None,
            payment_concept_id: None,
            name: format!("{} interest", interest_type.as_str()),
            interest_type,
            rate,
            fixed_amount,
            calculation_period,
            grace_period_days,
            effective_from: date(2024, 1, 1),
            effective_to: None,
            state: RecordState::Active,
            created_at: Utc::now(),
        };
        self.store.insert_interest_configuration(config.clone()).await;
        config
    }

    pub async fn quota(&self, quota_id: Uuid) -> Quota {
        use billing_engine::services::BillingStore;
        self.store
            .get_quota(quota_id)
            .await
            .unwrap()
            .expect("quota exists")
    }

    pub async fn quotas_for(&self, unit_id: Uuid) -> Vec<Quota> {
        use billing_engine::services::BillingStore;
        self.store.list_quotas_for_unit(unit_id).await.unwrap()
    }
}

/// Unpaid quota with no exchange involved.
pub fn quota_fixture(
    unit_id: Uuid,
    condominium_id: Uuid,
    building_id: Uuid,
    payment_concept_id: Uuid,
    due_date: NaiveDate,
    amount: Decimal,
) -> Quota {
    let now = Utc::now();
    Quota {
        id: Uuid::new_v4(),
        unit_id,
        condominium_id,
        building_id,
        payment_concept_id,
        period_year: due_date.year(),
        period_month: due_date.month() as i32,
        period_description: format!("{}", due_date.format("%B %Y")),
        base_amount: amount,
        currency: BASE_CURRENCY.to_string(),
        amount_in_base_currency: amount,
        exchange_rate_used: None,
        interest_amount: Decimal::ZERO,
        interest_paid: Decimal::ZERO,
        paid_amount: Decimal::ZERO,
        balance: amount,
        issue_date: due_date,
        due_date,
        status: QuotaStatus::Pending,
        generation_log_id: None,
        version: 1,
        created_by: None,
        created_at: now,
        updated_at: now,
    }
}
