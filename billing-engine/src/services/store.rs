//! Persistence and directory seams used by the engine.
//!
//! Reads outside a transaction see committed data only. Every mutation goes
//! through a [`StoreTransaction`]; rows fetched with a `lock_*` method stay
//! locked until the transaction commits or rolls back.

use crate::error::BillingError;
use crate::models::{
    AccrualScope, Currency, ExchangeRate, GenerationLog, GenerationRule, GenerationSchedule,
    InterestConfiguration, Payment, PaymentApplication, PendingAllocation, Period, Quota,
    QuotaAdjustment, QuotaFormula, Unit,
};
use async_trait::async_trait;
use chrono::NaiveDate;
use uuid::Uuid;

/// Units known to the property-management system.
#[async_trait]
pub trait UnitDirectory: Send + Sync {
    /// Active units of a building.
    async fn list_units_by_building(&self, building_id: Uuid) -> Result<Vec<Unit>, BillingError>;

    /// Active units of every building of a condominium.
    async fn list_units_by_condominium(
        &self,
        condominium_id: Uuid,
    ) -> Result<Vec<Unit>, BillingError>;
}

/// Currency metadata and exchange rates.
#[async_trait]
pub trait CurrencyDirectory: Send + Sync {
    async fn get_currency(&self, code: &str) -> Result<Option<Currency>, BillingError>;

    /// Latest rate from `from` to `to` with an effective date on or before `on`.
    async fn latest_rate(
        &self,
        from: &str,
        to: &str,
        on: NaiveDate,
    ) -> Result<Option<ExchangeRate>, BillingError>;
}

/// One unit of work against the store.
#[async_trait]
pub trait StoreTransaction: Send {
    async fn commit(self) -> Result<(), BillingError>;

    async fn rollback(self) -> Result<(), BillingError>;

    // Schedules

    async fn lock_schedule(
        &mut self,
        schedule_id: Uuid,
    ) -> Result<Option<GenerationSchedule>, BillingError>;

    /// Persist tracking fields if the stored version still equals
    /// `schedule.version`; the stored version is bumped.
    async fn update_schedule_tracking(
        &mut self,
        schedule: &GenerationSchedule,
    ) -> Result<(), BillingError>;

    async fn insert_generation_log(&mut self, log: &GenerationLog) -> Result<(), BillingError>;

    // Formulas

    async fn lock_formula(&mut self, formula_id: Uuid)
        -> Result<Option<QuotaFormula>, BillingError>;

    /// Write the body and update trail of `formula` if the stored version
    /// equals `formula.version` and return it with the bumped version.
    async fn update_formula(&mut self, formula: &QuotaFormula) -> Result<QuotaFormula, BillingError>;

    // Quotas

    async fn quota_exists(
        &mut self,
        unit_id: Uuid,
        payment_concept_id: Uuid,
        period: Period,
    ) -> Result<bool, BillingError>;

    /// Insert a quota. Returns `false` when one already exists for the same
    /// unit, concept and period.
    async fn insert_quota(&mut self, quota: &Quota) -> Result<bool, BillingError>;

    async fn lock_quota(&mut self, quota_id: Uuid) -> Result<Option<Quota>, BillingError>;

    /// Lock a unit's quotas with a positive balance that are not cancelled,
    /// ordered by due date, creation time and id.
    async fn lock_outstanding_quotas(&mut self, unit_id: Uuid) -> Result<Vec<Quota>, BillingError>;

    /// Write `quota` if the stored version equals `quota.version` and return
    /// it with the bumped version.
    async fn update_quota(&mut self, quota: &Quota) -> Result<Quota, BillingError>;

    async fn insert_adjustment(&mut self, adjustment: &QuotaAdjustment)
        -> Result<(), BillingError>;

    // Payments

    async fn lock_payment(&mut self, payment_id: Uuid) -> Result<Option<Payment>, BillingError>;

    /// Persist a payment's status and verification fields.
    async fn update_payment_verification(&mut self, payment: &Payment)
        -> Result<(), BillingError>;

    async fn applications_for_payment(
        &mut self,
        payment_id: Uuid,
    ) -> Result<Vec<PaymentApplication>, BillingError>;

    async fn insert_application(
        &mut self,
        application: &PaymentApplication,
    ) -> Result<(), BillingError>;

    async fn pending_allocations_for_payment(
        &mut self,
        payment_id: Uuid,
    ) -> Result<Vec<PendingAllocation>, BillingError>;

    async fn insert_pending_allocation(
        &mut self,
        pending: &PendingAllocation,
    ) -> Result<(), BillingError>;

    async fn lock_pending_allocation(
        &mut self,
        pending_id: Uuid,
    ) -> Result<Option<PendingAllocation>, BillingError>;

    async fn update_pending_allocation(
        &mut self,
        pending: &PendingAllocation,
    ) -> Result<(), BillingError>;
}

/// Transactional storage for billing data.
#[async_trait]
pub trait BillingStore: Send + Sync {
    type Tx: StoreTransaction;

    async fn begin(&self) -> Result<Self::Tx, BillingError>;

    async fn get_schedule(
        &self,
        schedule_id: Uuid,
    ) -> Result<Option<GenerationSchedule>, BillingError>;

    /// Active schedules whose next generation date is unset or on/before `as_of`.
    async fn list_due_schedules(
        &self,
        as_of: NaiveDate,
    ) -> Result<Vec<GenerationSchedule>, BillingError>;

    async fn get_rule(&self, rule_id: Uuid) -> Result<Option<GenerationRule>, BillingError>;

    /// Every rule of a condominium for a payment concept, any state.
    async fn list_rules_for_concept(
        &self,
        condominium_id: Uuid,
        payment_concept_id: Uuid,
    ) -> Result<Vec<GenerationRule>, BillingError>;

    async fn get_formula(&self, formula_id: Uuid) -> Result<Option<QuotaFormula>, BillingError>;

    async fn list_interest_configurations(
        &self,
        condominium_id: Uuid,
    ) -> Result<Vec<InterestConfiguration>, BillingError>;

    /// Outstanding quotas due before `as_of` with a positive balance.
    async fn list_accrual_candidates(
        &self,
        as_of: NaiveDate,
        scope: AccrualScope,
    ) -> Result<Vec<Quota>, BillingError>;

    async fn get_quota(&self, quota_id: Uuid) -> Result<Option<Quota>, BillingError>;

    async fn list_quotas_for_unit(&self, unit_id: Uuid) -> Result<Vec<Quota>, BillingError>;

    async fn list_adjustments(&self, quota_id: Uuid) -> Result<Vec<QuotaAdjustment>, BillingError>;

    async fn get_payment(&self, payment_id: Uuid) -> Result<Option<Payment>, BillingError>;

    async fn list_applications_for_payment(
        &self,
        payment_id: Uuid,
    ) -> Result<Vec<PaymentApplication>, BillingError>;

    async fn get_pending_allocation(
        &self,
        pending_id: Uuid,
    ) -> Result<Option<PendingAllocation>, BillingError>;

    async fn list_pending_allocations_for_payment(
        &self,
        payment_id: Uuid,
    ) -> Result<Vec<PendingAllocation>, BillingError>;

    async fn list_generation_logs(
        &self,
        schedule_id: Uuid,
    ) -> Result<Vec<GenerationLog>, BillingError>;
}
