//! In-process store and directory.
//!
//! A transaction takes the store mutex for its whole lifetime and works on a
//! copy of the state; commit swaps the copy in, rollback or drop discards it.
//! Callers must not use the non-transactional reads of the same store while
//! holding a transaction.

use crate::error::BillingError;
use crate::models::{
    AccrualScope, Currency, ExchangeRate, GenerationLog, GenerationRule, GenerationSchedule,
    InterestConfiguration, Payment, PaymentApplication, PendingAllocation, Period, Quota,
    QuotaAdjustment, QuotaFormula, Unit,
};
use crate::services::store::{BillingStore, CurrencyDirectory, StoreTransaction, UnitDirectory};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
struct MemoryState {
    schedules: HashMap<Uuid, GenerationSchedule>,
    rules: HashMap<Uuid, GenerationRule>,
    formulas: HashMap<Uuid, QuotaFormula>,
    interest_configurations: HashMap<Uuid, InterestConfiguration>,
    quotas: HashMap<Uuid, Quota>,
    adjustments: Vec<QuotaAdjustment>,
    payments: HashMap<Uuid, Payment>,
    applications: Vec<PaymentApplication>,
    pending_allocations: HashMap<Uuid, PendingAllocation>,
    generation_logs: Vec<GenerationLog>,
}

impl MemoryState {
    fn has_quota(&self, unit_id: Uuid, concept_id: Uuid, period: Period) -> bool {
        self.quotas.values().any(|q| {
            q.unit_id == unit_id
                && q.payment_concept_id == concept_id
                && q.period_year == period.year
                && q.period_month == period.month as i32
        })
    }
}

fn sort_by_due(quotas: &mut [Quota]) {
    quotas.sort_by(|a, b| {
        a.due_date
            .cmp(&b.due_date)
            .then(a.created_at.cmp(&b.created_at))
            .then(a.id.cmp(&b.id))
    });
}

/// Billing store kept in process memory.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    contention: Arc<AtomicU32>,
    log_failures: Arc<AtomicU32>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` row locks fail as if another writer held them.
    pub fn inject_lock_contention(&self, count: u32) {
        self.contention.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` generation log writes fail with a database error.
    pub fn inject_log_write_failure(&self, count: u32) {
        self.log_failures.store(count, Ordering::SeqCst);
    }

    pub async fn insert_formula(&self, formula: QuotaFormula) {
        self.state.lock().await.formulas.insert(formula.id, formula);
    }

    pub async fn insert_rule(&self, rule: GenerationRule) {
        self.state.lock().await.rules.insert(rule.id, rule);
    }

    pub async fn insert_schedule(&self, schedule: GenerationSchedule) {
        self.state.lock().await.schedules.insert(schedule.id, schedule);
    }

    pub async fn insert_interest_configuration(&self, config: InterestConfiguration) {
        self.state
            .lock()
            .await
            .interest_configurations
            .insert(config.id, config);
    }

    pub async fn insert_payment(&self, payment: Payment) {
        self.state.lock().await.payments.insert(payment.id, payment);
    }

    /// Seed a quota directly, bypassing generation.
    pub async fn seed_quota(&self, quota: Quota) {
        self.state.lock().await.quotas.insert(quota.id, quota);
    }
}

#[async_trait]
impl BillingStore for MemoryStore {
    type Tx = MemoryTransaction;

    async fn begin(&self) -> Result<Self::Tx, BillingError> {
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        Ok(MemoryTransaction {
            guard,
            working,
            contention: self.contention.clone(),
            log_failures: self.log_failures.clone(),
        })
    }

    async fn get_schedule(
        &self,
        schedule_id: Uuid,
    ) -> Result<Option<GenerationSchedule>, BillingError> {
        Ok(self.state.lock().await.schedules.get(&schedule_id).cloned())
    }

    async fn list_due_schedules(
        &self,
        as_of: NaiveDate,
    ) -> Result<Vec<GenerationSchedule>, BillingError> {
        let state = self.state.lock().await;
        let mut due: Vec<_> = state
            .schedules
            .values()
            .filter(|s| s.state.is_active())
            .filter(|s| s.next_generation_date.map_or(true, |d| d <= as_of))
            .cloned()
            .collect();
        due.sort_by_key(|s| (s.next_generation_date, s.id));
        Ok(due)
    }

    async fn get_rule(&self, rule_id: Uuid) -> Result<Option<GenerationRule>, BillingError> {
        Ok(self.state.lock().await.rules.get(&rule_id).cloned())
    }

    async fn list_rules_for_concept(
        &self,
        condominium_id: Uuid,
        payment_concept_id: Uuid,
    ) -> Result<Vec<GenerationRule>, BillingError> {
        let state = self.state.lock().await;
        Ok(state
            .rules
            .values()
            .filter(|r| {
                r.condominium_id == condominium_id && r.payment_concept_id == payment_concept_id
            })
            .cloned()
            .collect())
    }

    async fn get_formula(&self, formula_id: Uuid) -> Result<Option<QuotaFormula>, BillingError> {
        Ok(self.state.lock().await.formulas.get(&formula_id).cloned())
    }

    async fn list_interest_configurations(
        &self,
        condominium_id: Uuid,
    ) -> Result<Vec<InterestConfiguration>, BillingError> {
        let state = self.state.lock().await;
        Ok(state
            .interest_configurations
            .values()
            .filter(|c| c.condominium_id == condominium_id)
            .cloned()
            .collect())
    }

    async fn list_accrual_candidates(
        &self,
        as_of: NaiveDate,
        scope: AccrualScope,
    ) -> Result<Vec<Quota>, BillingError> {
        let state = self.state.lock().await;
        let mut quotas: Vec<_> = state
            .quotas
            .values()
            .filter(|q| q.status.is_outstanding())
            .filter(|q| q.balance > rust_decimal::Decimal::ZERO && q.due_date < as_of)
            .filter(|q| match scope {
                AccrualScope::All => true,
                AccrualScope::Condominium(id) => q.condominium_id == id,
                AccrualScope::Building(id) => q.building_id == id,
            })
            .cloned()
            .collect();
        sort_by_due(&mut quotas);
        Ok(quotas)
    }

    async fn get_quota(&self, quota_id: Uuid) -> Result<Option<Quota>, BillingError> {
        Ok(self.state.lock().await.quotas.get(&quota_id).cloned())
    }

    async fn list_quotas_for_unit(&self, unit_id: Uuid) -> Result<Vec<Quota>, BillingError> {
        let state = self.state.lock().await;
        let mut quotas: Vec<_> = state
            .quotas
            .values()
            .filter(|q| q.unit_id == unit_id)
            .cloned()
            .collect();
        sort_by_due(&mut quotas);
        Ok(quotas)
    }

    async fn list_adjustments(&self, quota_id: Uuid) -> Result<Vec<QuotaAdjustment>, BillingError> {
        let state = self.state.lock().await;
        Ok(state
            .adjustments
            .iter()
            .filter(|a| a.quota_id == quota_id)
            .cloned()
            .collect())
    }

    async fn get_payment(&self, payment_id: Uuid) -> Result<Option<Payment>, BillingError> {
        Ok(self.state.lock().await.payments.get(&payment_id).cloned())
    }

    async fn list_applications_for_payment(
        &self,
        payment_id: Uuid,
    ) -> Result<Vec<PaymentApplication>, BillingError> {
        let state = self.state.lock().await;
        Ok(state
            .applications
            .iter()
            .filter(|a| a.payment_id == payment_id)
            .cloned()
            .collect())
    }

    async fn get_pending_allocation(
        &self,
        pending_id: Uuid,
    ) -> Result<Option<PendingAllocation>, BillingError> {
        Ok(self
            .state
            .lock()
            .await
            .pending_allocations
            .get(&pending_id)
            .cloned())
    }

    async fn list_pending_allocations_for_payment(
        &self,
        payment_id: Uuid,
    ) -> Result<Vec<PendingAllocation>, BillingError> {
        let state = self.state.lock().await;
        let mut pending: Vec<_> = state
            .pending_allocations
            .values()
            .filter(|p| p.payment_id == payment_id)
            .cloned()
            .collect();
        pending.sort_by_key(|p| (p.created_at, p.id));
        Ok(pending)
    }

    async fn list_generation_logs(
        &self,
        schedule_id: Uuid,
    ) -> Result<Vec<GenerationLog>, BillingError> {
        let state = self.state.lock().await;
        Ok(state
            .generation_logs
            .iter()
            .filter(|l| l.schedule_id == Some(schedule_id))
            .cloned()
            .collect())
    }
}

/// Transaction over a [`MemoryStore`].
pub struct MemoryTransaction {
    guard: OwnedMutexGuard<MemoryState>,
    working: MemoryState,
    contention: Arc<AtomicU32>,
    log_failures: Arc<AtomicU32>,
}

fn take_injected(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl MemoryTransaction {
    fn check_contention(&self, what: &str) -> Result<(), BillingError> {
        if take_injected(&self.contention) {
            return Err(BillingError::ConcurrencyConflict(format!(
                "could not lock {}",
                what
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn commit(self) -> Result<(), BillingError> {
        let MemoryTransaction {
            mut guard, working, ..
        } = self;
        *guard = working;
        Ok(())
    }

    async fn rollback(self) -> Result<(), BillingError> {
        Ok(())
    }

    async fn lock_schedule(
        &mut self,
        schedule_id: Uuid,
    ) -> Result<Option<GenerationSchedule>, BillingError> {
        self.check_contention("schedule")?;
        Ok(self.working.schedules.get(&schedule_id).cloned())
    }

    async fn update_schedule_tracking(
        &mut self,
        schedule: &GenerationSchedule,
    ) -> Result<(), BillingError> {
        let stored = self.working.schedules.get_mut(&schedule.id).ok_or_else(|| {
            BillingError::NotFound(anyhow::anyhow!("Schedule {} not found", schedule.id))
        })?;
        if stored.version != schedule.version {
            return Err(BillingError::ConcurrencyConflict(format!(
                "schedule {} changed (version {} != {})",
                schedule.id, stored.version, schedule.version
            )));
        }
        stored.last_generated_period = schedule.last_generated_period.clone();
        stored.last_generated_at = schedule.last_generated_at;
        stored.next_generation_date = schedule.next_generation_date;
        stored.version += 1;
        stored.updated_at = Utc::now();
        Ok(())
    }

    async fn insert_generation_log(&mut self, log: &GenerationLog) -> Result<(), BillingError> {
        if take_injected(&self.log_failures) {
            return Err(BillingError::DatabaseError(anyhow::anyhow!(
                "generation log write failed"
            )));
        }
        self.working.generation_logs.push(log.clone());
        Ok(())
    }

    async fn lock_formula(
        &mut self,
        formula_id: Uuid,
    ) -> Result<Option<QuotaFormula>, BillingError> {
        self.check_contention("formula")?;
        Ok(self.working.formulas.get(&formula_id).cloned())
    }

    async fn update_formula(&mut self, formula: &QuotaFormula) -> Result<QuotaFormula, BillingError> {
        let stored = self.working.formulas.get_mut(&formula.id).ok_or_else(|| {
            BillingError::NotFound(anyhow::anyhow!("Formula {} not found", formula.id))
        })?;
        if stored.version != formula.version {
            return Err(BillingError::ConcurrencyConflict(format!(
                "formula {} changed (version {} != {})",
                formula.id, stored.version, formula.version
            )));
        }
        let mut updated = formula.clone();
        updated.version += 1;
        updated.updated_at = Utc::now();
        *stored = updated.clone();
        Ok(updated)
    }

    async fn quota_exists(
        &mut self,
        unit_id: Uuid,
        payment_concept_id: Uuid,
        period: Period,
    ) -> Result<bool, BillingError> {
        Ok(self.working.has_quota(unit_id, payment_concept_id, period))
    }

    async fn insert_quota(&mut self, quota: &Quota) -> Result<bool, BillingError> {
        let Some(period) = quota.period() else {
            return Err(BillingError::BadRequest(anyhow::anyhow!(
                "Quota {} has an invalid period",
                quota.id
            )));
        };
        if self
            .working
            .has_quota(quota.unit_id, quota.payment_concept_id, period)
        {
            return Ok(false);
        }
        self.working.quotas.insert(quota.id, quota.clone());
        Ok(true)
    }

    async fn lock_quota(&mut self, quota_id: Uuid) -> Result<Option<Quota>, BillingError> {
        self.check_contention("quota")?;
        Ok(self.working.quotas.get(&quota_id).cloned())
    }

    async fn lock_outstanding_quotas(&mut self, unit_id: Uuid) -> Result<Vec<Quota>, BillingError> {
        self.check_contention("outstanding quotas")?;
        let mut quotas: Vec<_> = self
            .working
            .quotas
            .values()
            .filter(|q| q.unit_id == unit_id)
            .filter(|q| q.status != crate::models::QuotaStatus::Cancelled)
            .filter(|q| q.balance > rust_decimal::Decimal::ZERO)
            .cloned()
            .collect();
        sort_by_due(&mut quotas);
        Ok(quotas)
    }

    async fn update_quota(&mut self, quota: &Quota) -> Result<Quota, BillingError> {
        let stored = self.working.quotas.get_mut(&quota.id).ok_or_else(|| {
            BillingError::NotFound(anyhow::anyhow!("Quota {} not found", quota.id))
        })?;
        if stored.version != quota.version {
            return Err(BillingError::ConcurrencyConflict(format!(
                "quota {} changed (version {} != {})",
                quota.id, stored.version, quota.version
            )));
        }
        let mut updated = quota.clone();
        updated.version += 1;
        updated.updated_at = Utc::now();
        *stored = updated.clone();
        Ok(updated)
    }

    async fn insert_adjustment(
        &mut self,
        adjustment: &QuotaAdjustment,
    ) -> Result<(), BillingError> {
        self.working.adjustments.push(adjustment.clone());
        Ok(())
    }

    async fn lock_payment(&mut self, payment_id: Uuid) -> Result<Option<Payment>, BillingError> {
        self.check_contention("payment")?;
        Ok(self.working.payments.get(&payment_id).cloned())
    }

    async fn update_payment_verification(
        &mut self,
        payment: &Payment,
    ) -> Result<(), BillingError> {
        let stored = self.working.payments.get_mut(&payment.id).ok_or_else(|| {
            BillingError::NotFound(anyhow::anyhow!("Payment {} not found", payment.id))
        })?;
        stored.status = payment.status;
        stored.verified_by = payment.verified_by;
        stored.verified_at = payment.verified_at;
        stored.verification_notes = payment.verification_notes.clone();
        Ok(())
    }

    async fn applications_for_payment(
        &mut self,
        payment_id: Uuid,
    ) -> Result<Vec<PaymentApplication>, BillingError> {
        Ok(self
            .working
            .applications
            .iter()
            .filter(|a| a.payment_id == payment_id)
            .cloned()
            .collect())
    }

    async fn insert_application(
        &mut self,
        application: &PaymentApplication,
    ) -> Result<(), BillingError> {
        self.working.applications.push(application.clone());
        Ok(())
    }

    async fn pending_allocations_for_payment(
        &mut self,
        payment_id: Uuid,
    ) -> Result<Vec<PendingAllocation>, BillingError> {
        let mut pending: Vec<_> = self
            .working
            .pending_allocations
            .values()
            .filter(|p| p.payment_id == payment_id)
            .cloned()
            .collect();
        pending.sort_by_key(|p| (p.created_at, p.id));
        Ok(pending)
    }

    async fn insert_pending_allocation(
        &mut self,
        pending: &PendingAllocation,
    ) -> Result<(), BillingError> {
        self.working
            .pending_allocations
            .insert(pending.id, pending.clone());
        Ok(())
    }

    async fn lock_pending_allocation(
        &mut self,
        pending_id: Uuid,
    ) -> Result<Option<PendingAllocation>, BillingError> {
        self.check_contention("pending allocation")?;
        Ok(self.working.pending_allocations.get(&pending_id).cloned())
    }

    async fn update_pending_allocation(
        &mut self,
        pending: &PendingAllocation,
    ) -> Result<(), BillingError> {
        match self.working.pending_allocations.get_mut(&pending.id) {
            Some(stored) => {
                *stored = pending.clone();
                Ok(())
            }
            None => Err(BillingError::NotFound(anyhow::anyhow!(
                "Pending allocation {} not found",
                pending.id
            ))),
        }
    }
}

#[derive(Debug, Default)]
struct DirectoryState {
    units: HashMap<Uuid, Unit>,
    currencies: HashMap<String, Currency>,
    rates: Vec<ExchangeRate>,
}

/// Unit and currency directory kept in process memory.
#[derive(Clone, Default)]
pub struct MemoryDirectory {
    state: Arc<std::sync::RwLock<DirectoryState>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_unit(&self, unit: Unit) {
        if let Ok(mut state) = self.state.write() {
            state.units.insert(unit.id, unit);
        }
    }

    pub fn add_currency(&self, currency: Currency) {
        if let Ok(mut state) = self.state.write() {
            state.currencies.insert(currency.code.clone(), currency);
        }
    }

    pub fn add_rate(&self, rate: ExchangeRate) {
        if let Ok(mut state) = self.state.write() {
            state.rates.push(rate);
        }
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, DirectoryState>, BillingError> {
        self.state
            .read()
            .map_err(|_| BillingError::DatabaseError(anyhow::anyhow!("Directory lock poisoned")))
    }

    fn units_where(&self, pred: impl Fn(&Unit) -> bool) -> Result<Vec<Unit>, BillingError> {
        let state = self.read()?;
        let mut units: Vec<_> = state
            .units
            .values()
            .filter(|u| u.state.is_active() && pred(u))
            .cloned()
            .collect();
        units.sort_by(|a, b| a.unit_number.cmp(&b.unit_number).then(a.id.cmp(&b.id)));
        Ok(units)
    }
}

#[async_trait]
impl UnitDirectory for MemoryDirectory {
    async fn list_units_by_building(&self, building_id: Uuid) -> Result<Vec<Unit>, BillingError> {
        self.units_where(|u| u.building_id == building_id)
    }

    async fn list_units_by_condominium(
        &self,
        condominium_id: Uuid,
    ) -> Result<Vec<Unit>, BillingError> {
        self.units_where(|u| u.condominium_id == condominium_id)
    }
}

#[async_trait]
impl CurrencyDirectory for MemoryDirectory {
    async fn get_currency(&self, code: &str) -> Result<Option<Currency>, BillingError> {
        Ok(self.read()?.currencies.get(code).cloned())
    }

    async fn latest_rate(
        &self,
        from: &str,
        to: &str,
        on: NaiveDate,
    ) -> Result<Option<ExchangeRate>, BillingError> {
        let state = self.read()?;
        Ok(state
            .rates
            .iter()
            .filter(|r| r.from_currency == from && r.to_currency == to && r.effective_date <= on)
            .max_by_key(|r| r.effective_date)
            .cloned())
    }
}
