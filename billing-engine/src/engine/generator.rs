//! Quota generation from schedules and formulas.

use super::schedule::{self, PeriodPlan, ScheduleState};
use super::{formula, money, BillingEngine};
use crate::error::BillingError;
use crate::models::{
    GenerationLog, GenerationMethod, GenerationRule, GenerationSchedule, GenerationStatus, Period,
    Quota, QuotaFormula, QuotaStatus, Unit,
};
use crate::services::metrics::{record_error, record_generation_run, record_quotas_generated};
use crate::services::store::{BillingStore, CurrencyDirectory, StoreTransaction, UnitDirectory};
use chrono::{NaiveDate, Utc};
use futures::stream::{self, StreamExt};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use service_core::retry::retry_with_backoff;
use sqlx::types::Json;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Outcome of [`BillingEngine::run_due_schedules`].
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct DueRunReport {
    pub schedules_processed: u32,
    pub schedules_succeeded: u32,
    pub schedules_failed: u32,
    pub logs: Vec<GenerationLog>,
    pub failures: Vec<ScheduleFailure>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleFailure {
    pub schedule_id: Uuid,
    pub error_type: String,
    pub reason: String,
}

struct UnitFailure {
    unit_id: Uuid,
    period: Period,
    reason: String,
}

#[derive(Default)]
struct Preparation {
    quotas: Vec<Quota>,
    failures: Vec<UnitFailure>,
    formulas: BTreeMap<Uuid, QuotaFormula>,
}

/// Effective rule for a unit in `building_id` on `date`: building-specific
/// rules beat condominium rules, then the latest `effective_from` wins.
pub fn resolve_effective_rule<'a>(
    rules: &'a [GenerationRule],
    building_id: Uuid,
    date: NaiveDate,
) -> Option<&'a GenerationRule> {
    rules
        .iter()
        .filter(|r| r.is_effective_on(date) && r.covers_building(building_id))
        .max_by_key(|r| (r.building_id.is_some(), r.effective_from, r.created_at))
}

impl<S, U, C> BillingEngine<S, U, C>
where
    S: BillingStore,
    U: UnitDirectory,
    C: CurrencyDirectory,
{
    /// Generate every due period of a schedule.
    ///
    /// A schedule that is not due yields a persisted `skipped` log. Quotas that
    /// already exist are skipped, so re-running for the same period creates
    /// nothing new. Per-unit configuration and evaluation failures are counted
    /// in the log; storage failures abort the whole batch.
    #[instrument(skip(self), fields(schedule_id = %schedule_id, as_of = %as_of))]
    pub async fn generate_quotas(
        &self,
        schedule_id: Uuid,
        as_of: NaiveDate,
        actor: Option<Uuid>,
    ) -> Result<GenerationLog, BillingError> {
        let result = retry_with_backoff(&self.settings.retry, "generate_quotas", || {
            self.try_generate(schedule_id, as_of, None, GenerationMethod::Scheduled, actor)
        })
        .await
        .map_err(BillingError::from);

        self.record_generation_outcome(&result, GenerationMethod::Scheduled, "generate_quotas");
        result
    }

    /// Generate one explicit period of a schedule regardless of its due date.
    /// The schedule's tracking fields are left untouched.
    #[instrument(skip(self), fields(schedule_id = %schedule_id, period = %period))]
    pub async fn generate_quotas_for_period(
        &self,
        schedule_id: Uuid,
        period: Period,
        actor: Option<Uuid>,
    ) -> Result<GenerationLog, BillingError> {
        let as_of = Utc::now().date_naive();
        let result = retry_with_backoff(&self.settings.retry, "generate_quotas_for_period", || {
            self.try_generate(
                schedule_id,
                as_of,
                Some(period),
                GenerationMethod::Manual,
                actor,
            )
        })
        .await
        .map_err(BillingError::from);

        self.record_generation_outcome(
            &result,
            GenerationMethod::Manual,
            "generate_quotas_for_period",
        );
        result
    }

    /// Run every due schedule, at most `generation_concurrency` at a time.
    /// A failing schedule does not stop the others.
    #[instrument(skip(self), fields(as_of = %as_of))]
    pub async fn run_due_schedules(
        &self,
        as_of: NaiveDate,
        actor: Option<Uuid>,
    ) -> Result<DueRunReport, BillingError> {
        let schedules = self.store.list_due_schedules(as_of).await?;
        info!(count = schedules.len(), "Found schedules due for generation");

        let results: Vec<(Uuid, Result<GenerationLog, BillingError>)> =
            stream::iter(schedules.into_iter().map(|s| s.id))
                .map(|id| async move { (id, self.generate_quotas(id, as_of, actor).await) })
                .buffer_unordered(self.settings.generation_concurrency.max(1))
                .collect()
                .await;

        let mut report = DueRunReport::default();
        for (schedule_id, result) in results {
            report.schedules_processed += 1;
            match result {
                Ok(log) => {
                    if log.status == GenerationStatus::Failed {
                        report.schedules_failed += 1;
                    } else {
                        report.schedules_succeeded += 1;
                    }
                    report.logs.push(log);
                }
                Err(e) => {
                    error!(schedule_id = %schedule_id, error = %e, "Schedule generation failed");
                    report.schedules_failed += 1;
                    report.failures.push(ScheduleFailure {
                        schedule_id,
                        error_type: e.kind().to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        info!(
            processed = report.schedules_processed,
            succeeded = report.schedules_succeeded,
            failed = report.schedules_failed,
            "Due schedules run completed"
        );
        Ok(report)
    }

    fn record_generation_outcome(
        &self,
        result: &Result<GenerationLog, BillingError>,
        method: GenerationMethod,
        operation: &str,
    ) {
        match result {
            Ok(log) => {
                record_generation_run(method.as_str(), log.status.as_str());
                record_quotas_generated(method.as_str(), log.quotas_created.max(0) as u64);
            }
            Err(e) => record_error(e.kind(), operation),
        }
    }

    async fn try_generate(
        &self,
        schedule_id: Uuid,
        as_of: NaiveDate,
        explicit_period: Option<Period>,
        method: GenerationMethod,
        actor: Option<Uuid>,
    ) -> Result<GenerationLog, BillingError> {
        let schedule = self.store.get_schedule(schedule_id).await?.ok_or_else(|| {
            BillingError::NotFound(anyhow::anyhow!("Schedule {} not found", schedule_id))
        })?;

        if explicit_period.is_none() {
            let state = schedule::state(&schedule, as_of);
            if state != ScheduleState::Due {
                let reason = match state {
                    ScheduleState::Inactive => "schedule is inactive".to_string(),
                    _ => format!(
                        "schedule is not due until {}",
                        schedule
                            .next_generation_date
                            .map(|d| d.to_string())
                            .unwrap_or_default()
                    ),
                };
                info!(reason = %reason, "Skipping schedule");
                let log = self.base_log(&schedule, method, actor, GenerationStatus::Skipped);
                let log = GenerationLog {
                    error_details: Some(reason),
                    ..log
                };
                let mut tx = self.store.begin().await?;
                tx.insert_generation_log(&log).await?;
                tx.commit().await?;
                return Ok(log);
            }
        }

        let rule = self.store.get_rule(schedule.rule_id).await?.ok_or_else(|| {
            BillingError::NotFound(anyhow::anyhow!("Generation rule {} not found", schedule.rule_id))
        })?;
        if !rule.state.is_active() {
            return Err(BillingError::ConfigurationError(format!(
                "generation rule {} is inactive",
                rule.id
            )));
        }

        let plans = match explicit_period {
            Some(period) => vec![schedule::period_dates(&schedule, period)?],
            None => schedule::target_periods(&schedule, as_of)?,
        };

        if plans.is_empty() {
            return self.skip_generated_horizon(&schedule, method, actor, as_of).await;
        }

        let units = match rule.building_id {
            Some(building_id) => self.units.list_units_by_building(building_id).await?,
            None => self.units.list_units_by_condominium(rule.condominium_id).await?,
        };

        let log_id = Uuid::new_v4();
        let mut log = self.base_log(&schedule, method, actor, GenerationStatus::Failed);
        log.id = log_id;
        log.rule_id = rule.id;
        self.describe_periods(&mut log, &schedule, &plans, as_of);

        if units.is_empty() {
            warn!(rule_id = %rule.id, "No active units in rule scope");
            log.error_details = Some("no active units in rule scope".to_string());
            let mut tx = self.store.begin().await?;
            tx.insert_generation_log(&log).await?;
            tx.commit().await?;
            return Ok(log);
        }

        let prepared = self
            .prepare_quotas(&rule, &plans, &units, log_id, actor)
            .await?;

        let mut tx = self.store.begin().await?;
        let Some(locked) = lock_unchanged(&mut tx, &schedule).await? else {
            tx.rollback().await?;
            return Err(modified_during_generation(schedule.id));
        };

        let mut created: i32 = 0;
        let mut skipped: i32 = 0;
        let mut total_amount = Decimal::ZERO;
        let mut units_affected = BTreeSet::new();

        for quota in &prepared.quotas {
            let Some(period) = quota.period() else {
                continue;
            };
            if tx
                .quota_exists(quota.unit_id, quota.payment_concept_id, period)
                .await?
            {
                skipped += 1;
                continue;
            }
            if tx.insert_quota(quota).await? {
                created += 1;
                total_amount += quota.amount_in_base_currency;
                units_affected.insert(quota.unit_id);
            } else {
                skipped += 1;
            }
        }

        let failed = prepared.failures.len() as i32;
        let status = GenerationStatus::from_counts(created as u32, failed as u32);

        log.quotas_created = created;
        log.quotas_skipped = skipped;
        log.quotas_failed = failed;
        log.total_amount = total_amount;
        log.units_affected = Json(units_affected.into_iter().collect());
        log.formula_snapshot = Json(formula_snapshot(&prepared.formulas));
        log.status = status;
        if !prepared.failures.is_empty() {
            log.error_details = Some(
                prepared
                    .failures
                    .iter()
                    .map(|f| format!("unit {} ({}): {}", f.unit_id, f.period, f.reason))
                    .collect::<Vec<_>>()
                    .join("; "),
            );
        }

        if explicit_period.is_none() && status != GenerationStatus::Failed {
            let mut advanced = locked.clone();
            advanced.last_generated_period = plans.last().map(|p| p.period.to_string());
            advanced.last_generated_at = Some(Utc::now());
            advanced.next_generation_date = Some(schedule::advance(&locked, as_of));
            tx.update_schedule_tracking(&advanced).await?;
        }

        tx.insert_generation_log(&log).await?;
        tx.commit().await?;

        info!(
            log_id = %log.id,
            status = log.status.as_str(),
            created = created,
            skipped = skipped,
            failed = failed,
            total_amount = %total_amount,
            "Quota generation completed"
        );
        Ok(log)
    }

    /// Every period up to the horizon already exists: move the schedule on
    /// without writing quotas.
    async fn skip_generated_horizon(
        &self,
        schedule: &GenerationSchedule,
        method: GenerationMethod,
        actor: Option<Uuid>,
        as_of: NaiveDate,
    ) -> Result<GenerationLog, BillingError> {
        let mut tx = self.store.begin().await?;
        let Some(locked) = lock_unchanged(&mut tx, schedule).await? else {
            tx.rollback().await?;
            return Err(modified_during_generation(schedule.id));
        };

        let mut advanced = locked.clone();
        advanced.next_generation_date = Some(schedule::advance(&locked, as_of));
        tx.update_schedule_tracking(&advanced).await?;

        let mut log = self.base_log(schedule, method, actor, GenerationStatus::Skipped);
        self.describe_periods(&mut log, schedule, &[], as_of);
        log.error_details = Some(format!(
            "periods through {} already generated",
            locked.last_generated_period.as_deref().unwrap_or("-")
        ));
        tx.insert_generation_log(&log).await?;
        tx.commit().await?;

        info!(
            next_generation_date = ?advanced.next_generation_date,
            "Generation horizon already covered, schedule advanced"
        );
        Ok(log)
    }

    /// Evaluate every unit and period outside the write transaction.
    async fn prepare_quotas(
        &self,
        rule: &GenerationRule,
        plans: &[PeriodPlan],
        units: &[Unit],
        log_id: Uuid,
        actor: Option<Uuid>,
    ) -> Result<Preparation, BillingError> {
        let rules = self
            .store
            .list_rules_for_concept(rule.condominium_id, rule.payment_concept_id)
            .await?;
        let base_scale = self.base_scale().await?;
        let mut formulas: HashMap<Uuid, QuotaFormula> = HashMap::new();
        let mut out = Preparation::default();

        for plan in plans {
            for unit in units {
                match self
                    .prepare_one(&rules, plan, unit, base_scale, &mut formulas, log_id, actor)
                    .await
                {
                    Ok((quota, formula_id)) => {
                        if let Some(f) = formulas.get(&formula_id) {
                            out.formulas.insert(f.id, f.clone());
                        }
                        out.quotas.push(quota);
                    }
                    Err(e) if e.is_item_failure() => {
                        warn!(
                            unit_id = %unit.id,
                            period = %plan.period,
                            error = %e,
                            "Quota could not be prepared"
                        );
                        out.failures.push(UnitFailure {
                            unit_id: unit.id,
                            period: plan.period,
                            reason: e.to_string(),
                        });
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        Ok(out)
    }

    #[allow(clippy::too_many_arguments)]
    async fn prepare_one(
        &self,
        rules: &[GenerationRule],
        plan: &PeriodPlan,
        unit: &Unit,
        base_scale: u32,
        formulas: &mut HashMap<Uuid, QuotaFormula>,
        log_id: Uuid,
        actor: Option<Uuid>,
    ) -> Result<(Quota, Uuid), BillingError> {
        let rule = resolve_effective_rule(rules, unit.building_id, plan.issue_date).ok_or_else(
            || {
                BillingError::ConfigurationError(format!(
                    "no effective generation rule on {}",
                    plan.issue_date
                ))
            },
        )?;

        if !formulas.contains_key(&rule.quota_formula_id) {
            let formula = self
                .store
                .get_formula(rule.quota_formula_id)
                .await?
                .ok_or_else(|| {
                    BillingError::ConfigurationError(format!(
                        "formula {} not found",
                        rule.quota_formula_id
                    ))
                })?;
            formulas.insert(formula.id, formula);
        }
        let formula = formulas.get(&rule.quota_formula_id).ok_or_else(|| {
            BillingError::ConfigurationError(format!("formula {} not found", rule.quota_formula_id))
        })?;
        if !formula.state.is_active() {
            return Err(BillingError::ConfigurationError(format!(
                "formula '{}' is inactive",
                formula.name
            )));
        }

        let scale = self.currency_scale(&formula.currency).await?;
        let breakdown = formula::evaluate(formula, unit, plan.period, scale)?;

        let rate = self.rate_to_base(&formula.currency, plan.issue_date).await?;
        let amount_in_base = match rate {
            Some(rate) => money::convert(breakdown.amount, rate, base_scale)?,
            None => breakdown.amount,
        };

        let now = Utc::now();
        let quota = Quota {
            id: Uuid::new_v4(),
            unit_id: unit.id,
            condominium_id: unit.condominium_id,
            building_id: unit.building_id,
            payment_concept_id: rule.payment_concept_id,
            period_year: plan.period.year,
            period_month: plan.period.month as i32,
            period_description: plan.period.description(),
            base_amount: breakdown.amount,
            currency: formula.currency.clone(),
            amount_in_base_currency: amount_in_base,
            exchange_rate_used: rate,
            interest_amount: Decimal::ZERO,
            interest_paid: Decimal::ZERO,
            paid_amount: Decimal::ZERO,
            balance: amount_in_base,
            issue_date: plan.issue_date,
            due_date: plan.due_date,
            status: QuotaStatus::Pending,
            generation_log_id: Some(log_id),
            version: 1,
            created_by: actor,
            created_at: now,
            updated_at: now,
        };
        Ok((quota, formula.id))
    }

    fn base_log(
        &self,
        schedule: &GenerationSchedule,
        method: GenerationMethod,
        actor: Option<Uuid>,
        status: GenerationStatus,
    ) -> GenerationLog {
        GenerationLog {
            id: Uuid::new_v4(),
            schedule_id: Some(schedule.id),
            rule_id: schedule.rule_id,
            generation_method: method,
            period_year: None,
            period_month: None,
            period_description: None,
            quotas_created: 0,
            quotas_failed: 0,
            quotas_skipped: 0,
            total_amount: Decimal::ZERO,
            currency: Some(self.settings.base_currency.clone()),
            units_affected: Json(Vec::new()),
            parameters: Json(json!({})),
            formula_snapshot: Json(json!({})),
            status,
            error_details: None,
            generated_by: actor,
            generated_at: Utc::now(),
        }
    }

    fn describe_periods(
        &self,
        log: &mut GenerationLog,
        schedule: &GenerationSchedule,
        plans: &[PeriodPlan],
        as_of: NaiveDate,
    ) {
        if let Some(first) = plans.first() {
            log.period_year = Some(first.period.year);
            log.period_month = Some(first.period.month as i32);
            log.period_description = Some(match plans.last() {
                Some(last) if last.period != first.period => {
                    format!("{} - {}", first.period.description(), last.period.description())
                }
                _ => first.period.description(),
            });
        }
        log.parameters = Json(json!({
            "as_of": as_of,
            "frequency": schedule.frequency.as_str(),
            "frequency_value": schedule.frequency_value,
            "periods_in_advance": schedule.periods_in_advance,
            "grace_days": schedule.grace_days,
            "periods": plans,
        }));
    }
}

/// Lock `schedule` and return it if nobody changed it since it was read.
async fn lock_unchanged<T: StoreTransaction>(
    tx: &mut T,
    schedule: &GenerationSchedule,
) -> Result<Option<GenerationSchedule>, BillingError> {
    let locked = tx.lock_schedule(schedule.id).await?.ok_or_else(|| {
        BillingError::NotFound(anyhow::anyhow!("Schedule {} not found", schedule.id))
    })?;
    Ok((locked.version == schedule.version).then_some(locked))
}

fn modified_during_generation(schedule_id: Uuid) -> BillingError {
    BillingError::ConcurrencyConflict(format!(
        "schedule {} was modified during generation",
        schedule_id
    ))
}

fn formula_snapshot(formulas: &BTreeMap<Uuid, QuotaFormula>) -> serde_json::Value {
    let entries: serde_json::Map<String, serde_json::Value> = formulas
        .values()
        .map(|f| {
            (
                f.id.to_string(),
                json!({
                    "name": f.name,
                    "version": f.version,
                    "currency": f.currency,
                    "formula": f.kind,
                }),
            )
        })
        .collect();
    serde_json::Value::Object(entries)
}
