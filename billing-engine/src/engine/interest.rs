//! Interest accrual on overdue quotas.

use super::money::round_money;
use super::BillingEngine;
use crate::error::BillingError;
use crate::models::{
    AccrualFailure, AccrualScope, AccrualSummary, AdjustmentType, CalculationPeriod,
    InterestConfiguration, InterestType, Quota, QuotaAdjustment, QuotaStatus,
};
use crate::services::metrics::{record_error, record_interest_accrual};
use crate::services::store::{BillingStore, CurrencyDirectory, StoreTransaction, UnitDirectory};
use chrono::{Days, Months, NaiveDate};
use futures::stream::{self, StreamExt};
use rust_decimal::Decimal;
use service_core::retry::retry_with_backoff;
use std::collections::HashMap;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Elapsed time since a due date in calculation periods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElapsedPeriods {
    pub whole: u32,
    /// Fraction of the current, partial period in `[0, 1)`.
    pub fraction: Decimal,
}

impl ElapsedPeriods {
    pub fn total(&self) -> Decimal {
        Decimal::from(self.whole) + self.fraction
    }

    /// Periods started, counting a partial one.
    pub fn started(&self) -> u32 {
        if self.fraction.is_zero() {
            self.whole
        } else {
            self.whole + 1
        }
    }
}

/// Whole and partial periods from `from` to `to`.
pub fn elapsed_periods(from: NaiveDate, to: NaiveDate, period: CalculationPeriod) -> ElapsedPeriods {
    if to <= from {
        return ElapsedPeriods {
            whole: 0,
            fraction: Decimal::ZERO,
        };
    }
    match period {
        CalculationPeriod::Daily => ElapsedPeriods {
            whole: (to - from).num_days() as u32,
            fraction: Decimal::ZERO,
        },
        CalculationPeriod::Monthly => {
            let add = |n: u32| from.checked_add_months(Months::new(n)).unwrap_or(NaiveDate::MAX);
            let mut whole = 0;
            while add(whole + 1) <= to {
                whole += 1;
            }
            let start = add(whole);
            let end = add(whole + 1);
            let remainder = (to - start).num_days();
            let length = (end - start).num_days().max(1);
            ElapsedPeriods {
                whole,
                fraction: Decimal::from(remainder) / Decimal::from(length),
            }
        }
    }
}

fn overflow() -> BillingError {
    BillingError::EvaluationError("arithmetic overflow computing interest".to_string())
}

/// Interest owed on `quota` as of `as_of`, from scratch and rounded to `scale`.
///
/// Zero while the quota is within its grace period. Elapsed time counts from
/// the due date once the grace period has passed.
pub fn compute_interest(
    quota: &Quota,
    config: &InterestConfiguration,
    as_of: NaiveDate,
    scale: u32,
) -> Result<Decimal, BillingError> {
    let conflicting = || {
        BillingError::ConfigurationError(format!(
            "interest configuration '{}' must set exactly one of rate and fixed amount for type {}",
            config.name,
            config.interest_type.as_str()
        ))
    };

    let grace_end = quota
        .due_date
        .checked_add_days(Days::new(config.grace_period_days.max(0) as u64))
        .unwrap_or(NaiveDate::MAX);

    let elapsed = elapsed_periods(quota.due_date, as_of, config.calculation_period);
    let principal = quota.principal_outstanding();

    let interest = match (config.interest_type, config.rate, config.fixed_amount) {
        (InterestType::Fixed, None, Some(fee)) if fee >= Decimal::ZERO => {
            if grace_end >= as_of {
                return Ok(Decimal::ZERO);
            }
            fee.checked_mul(Decimal::from(elapsed.started()))
                .ok_or_else(overflow)?
        }
        (InterestType::Simple, Some(rate), None) if rate >= Decimal::ZERO => {
            if grace_end >= as_of {
                return Ok(Decimal::ZERO);
            }
            principal
                .checked_mul(rate)
                .and_then(|v| v.checked_mul(elapsed.total()))
                .ok_or_else(overflow)?
        }
        (InterestType::Compound, Some(rate), None) if rate >= Decimal::ZERO => {
            if grace_end >= as_of {
                return Ok(Decimal::ZERO);
            }
            let growth = Decimal::ONE + rate;
            let mut factor = Decimal::ONE;
            for _ in 0..elapsed.whole {
                factor = factor.checked_mul(growth).ok_or_else(overflow)?;
            }
            let partial = rate
                .checked_mul(elapsed.fraction)
                .map(|v| Decimal::ONE + v)
                .ok_or_else(overflow)?;
            factor = factor.checked_mul(partial).ok_or_else(overflow)?;
            principal
                .checked_mul(factor - Decimal::ONE)
                .ok_or_else(overflow)?
        }
        _ => return Err(conflicting()),
    };

    Ok(round_money(interest, scale))
}

/// Most specific active configuration covering `quota` on `as_of`:
/// building + concept, then building, then concept, then condominium-wide.
pub fn resolve_interest_configuration<'a>(
    configs: &'a [InterestConfiguration],
    quota: &Quota,
    as_of: NaiveDate,
) -> Option<&'a InterestConfiguration> {
    configs
        .iter()
        .filter(|c| c.is_effective_on(as_of))
        .filter(|c| c.applies_to(quota.condominium_id, quota.building_id, quota.payment_concept_id))
        .max_by_key(|c| (c.specificity(), c.effective_from, c.created_at))
}

#[derive(Debug, Default)]
struct QuotaAccrual {
    updated: bool,
    marked_overdue: bool,
    interest: Decimal,
}

impl<S, U, C> BillingEngine<S, U, C>
where
    S: BillingStore,
    U: UnitDirectory,
    C: CurrencyDirectory,
{
    /// Recompute interest and overdue status of every outstanding quota due
    /// before `as_of`. Re-running for the same date changes nothing.
    #[instrument(skip(self), fields(as_of = %as_of))]
    pub async fn accrue_interest(
        &self,
        as_of: NaiveDate,
        scope: AccrualScope,
    ) -> Result<AccrualSummary, BillingError> {
        let candidates = self.store.list_accrual_candidates(as_of, scope).await?;
        let scale = self.base_scale().await?;

        let mut configs: HashMap<Uuid, Vec<InterestConfiguration>> = HashMap::new();
        for quota in &candidates {
            if !configs.contains_key(&quota.condominium_id) {
                let list = self
                    .store
                    .list_interest_configurations(quota.condominium_id)
                    .await?;
                configs.insert(quota.condominium_id, list);
            }
        }

        info!(candidates = candidates.len(), "Accruing interest");

        let configs = &configs;
        let results: Vec<(Uuid, Result<QuotaAccrual, BillingError>)> = stream::iter(candidates)
            .map(|quota| async move {
                let config = configs
                    .get(&quota.condominium_id)
                    .and_then(|list| resolve_interest_configuration(list, &quota, as_of))
                    .cloned();
                let result = retry_with_backoff(&self.settings.retry, "accrue_interest", || {
                    self.accrue_one(quota.id, config.as_ref(), as_of, scale)
                })
                .await
                .map_err(BillingError::from);
                (quota.id, result)
            })
            .buffer_unordered(self.settings.accrual_concurrency.max(1))
            .collect()
            .await;

        let mut summary = AccrualSummary {
            as_of: Some(as_of),
            ..Default::default()
        };
        for (quota_id, result) in results {
            summary.quotas_scanned += 1;
            match result {
                Ok(outcome) => {
                    if outcome.updated {
                        summary.quotas_updated += 1;
                        record_interest_accrual("updated");
                    }
                    if outcome.marked_overdue {
                        summary.quotas_marked_overdue += 1;
                        record_interest_accrual("marked_overdue");
                    }
                    summary.total_interest += outcome.interest;
                }
                Err(e) => {
                    warn!(quota_id = %quota_id, error = %e, "Interest accrual failed for quota");
                    record_interest_accrual("failed");
                    record_error(e.kind(), "accrue_interest");
                    summary.quotas_failed += 1;
                    summary.failures.push(AccrualFailure {
                        quota_id,
                        error_type: e.kind().to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        info!(
            scanned = summary.quotas_scanned,
            updated = summary.quotas_updated,
            marked_overdue = summary.quotas_marked_overdue,
            failed = summary.quotas_failed,
            total_interest = %summary.total_interest,
            "Interest accrual completed"
        );
        Ok(summary)
    }

    async fn accrue_one(
        &self,
        quota_id: Uuid,
        config: Option<&InterestConfiguration>,
        as_of: NaiveDate,
        scale: u32,
    ) -> Result<QuotaAccrual, BillingError> {
        let mut tx = self.store.begin().await?;
        let Some(quota) = tx.lock_quota(quota_id).await? else {
            tx.rollback().await?;
            return Err(BillingError::NotFound(anyhow::anyhow!(
                "Quota {} not found",
                quota_id
            )));
        };

        if !quota.status.is_outstanding()
            || quota.balance <= Decimal::ZERO
            || quota.due_date >= as_of
        {
            tx.rollback().await?;
            return Ok(QuotaAccrual::default());
        }

        let new_interest = match config {
            Some(config) => match compute_interest(&quota, config, as_of, scale) {
                Ok(interest) => interest.max(quota.interest_paid),
                Err(e) => {
                    tx.rollback().await?;
                    return Err(e);
                }
            },
            None => quota.interest_amount,
        };

        let mut updated = quota.clone();
        updated.interest_amount = new_interest;
        updated.refresh(as_of);

        if updated.balance < Decimal::ZERO {
            tx.rollback().await?;
            return Err(BillingError::InvariantViolation(format!(
                "quota {} balance would become {}",
                quota.id, updated.balance
            )));
        }

        let interest_changed = updated.interest_amount != quota.interest_amount;
        let marked_overdue =
            quota.status != QuotaStatus::Overdue && updated.status == QuotaStatus::Overdue;

        if !interest_changed && updated.status == quota.status {
            tx.rollback().await?;
            return Ok(QuotaAccrual {
                interest: quota.interest_amount,
                ..Default::default()
            });
        }

        let saved = tx.update_quota(&updated).await?;
        if interest_changed {
            let reason = match config {
                Some(c) => format!("Interest as of {} ({})", as_of, c.name),
                None => format!("Interest as of {}", as_of),
            };
            tx.insert_adjustment(&QuotaAdjustment::new(
                quota.id,
                quota.interest_amount,
                saved.interest_amount,
                AdjustmentType::Interest,
                reason,
                None,
            ))
            .await?;
        }
        tx.commit().await?;

        Ok(QuotaAccrual {
            updated: interest_changed,
            marked_overdue,
            interest: saved.interest_amount,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RecordState;
    use chrono::{Datelike, Utc};
    use rust_decimal_macros::dec;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn quota(amount: Decimal, due: NaiveDate) -> Quota {
        Quota {
            id: Uuid::new_v4(),
            unit_id: Uuid::new_v4(),
            condominium_id: Uuid::nil(),
            building_id: Uuid::nil(),
            payment_concept_id: Uuid::nil(),
            period_year: due.year(),
            period_month: due.month() as i32,
            period_description: String::new(),
            base_amount: amount,
            currency: "USD".to_string(),
            amount_in_base_currency: amount,
            exchange_rate_used: None,
            interest_amount: Decimal::ZERO,
            interest_paid: Decimal::ZERO,
            paid_amount: Decimal::ZERO,
            balance: amount,
            issue_date: due,
            due_date: due,
            status: QuotaStatus::Pending,
            generation_log_id: None,
            version: 1,
            created_by: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn config(
        interest_type: InterestType,
        rate: Option<Decimal>,
        fixed: Option<Decimal>,
        period: CalculationPeriod,
        grace: i32,
    ) -> InterestConfiguration {
        InterestConfiguration {
            id: Uuid::new_v4(),
            condominium_id: Uuid::nil(),
            building_id: None,
            payment_concept_id: None,
            name: "Late".to_string(),
            interest_type,
            rate,
            fixed_amount: fixed,
            calculation_period: period,
            grace_period_days: grace,
            effective_from: date(2020, 1, 1),
            effective_to: None,
            state: RecordState::Active,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_elapsed_monthly_with_fraction() {
        let e = elapsed_periods(date(2025, 1, 15), date(2025, 3, 1), CalculationPeriod::Monthly);
        assert_eq!(e.whole, 1);
        // Feb 15 .. Mar 1 is 14 of 28 days
        assert_eq!(e.fraction, dec!(0.5));
        assert_eq!(e.started(), 2);
    }

    #[test]
    fn test_elapsed_daily() {
        let e = elapsed_periods(date(2025, 1, 1), date(2025, 1, 11), CalculationPeriod::Daily);
        assert_eq!(e.whole, 10);
        assert_eq!(e.total(), dec!(10));
    }

    #[test]
    fn test_simple_monthly() {
        let q = quota(dec!(1000), date(2025, 1, 15));
        let c = config(
            InterestType::Simple,
            Some(dec!(0.01)),
            None,
            CalculationPeriod::Monthly,
            0,
        );
        // 1000 * 0.01 * 2
        assert_eq!(compute_interest(&q, &c, date(2025, 3, 15), 2).unwrap(), dec!(20.00));
    }

    #[test]
    fn test_compound_monthly() {
        let q = quota(dec!(1000), date(2025, 1, 15));
        let c = config(
            InterestType::Compound,
            Some(dec!(0.10)),
            None,
            CalculationPeriod::Monthly,
            0,
        );
        // 1000 * (1.1^2 - 1) = 210
        assert_eq!(compute_interest(&q, &c, date(2025, 3, 15), 2).unwrap(), dec!(210.00));
    }

    #[test]
    fn test_fixed_per_started_period() {
        let q = quota(dec!(1000), date(2025, 1, 15));
        let c = config(
            InterestType::Fixed,
            None,
            Some(dec!(25)),
            CalculationPeriod::Monthly,
            0,
        );
        assert_eq!(compute_interest(&q, &c, date(2025, 1, 20), 2).unwrap(), dec!(25));
        assert_eq!(compute_interest(&q, &c, date(2025, 2, 20), 2).unwrap(), dec!(50));
    }

    #[test]
    fn test_grace_period() {
        let q = quota(dec!(1000), date(2025, 1, 15));
        let c = config(
            InterestType::Simple,
            Some(dec!(0.001)),
            None,
            CalculationPeriod::Daily,
            5,
        );
        assert_eq!(compute_interest(&q, &c, date(2025, 1, 20), 2).unwrap(), Decimal::ZERO);
        // Past grace: elapsed counts from the due date, 6 days.
        assert_eq!(compute_interest(&q, &c, date(2025, 1, 21), 2).unwrap(), dec!(6.00));
    }

    #[test]
    fn test_principal_excludes_paid_principal() {
        let mut q = quota(dec!(1000), date(2025, 1, 15));
        q.paid_amount = dec!(400);
        let c = config(
            InterestType::Simple,
            Some(dec!(0.01)),
            None,
            CalculationPeriod::Monthly,
            0,
        );
        assert_eq!(compute_interest(&q, &c, date(2025, 2, 15), 2).unwrap(), dec!(6.00));
    }

    #[test]
    fn test_rate_and_fixed_conflict() {
        let q = quota(dec!(1000), date(2025, 1, 15));
        let both = config(
            InterestType::Simple,
            Some(dec!(0.01)),
            Some(dec!(5)),
            CalculationPeriod::Monthly,
            0,
        );
        let neither = config(InterestType::Simple, None, None, CalculationPeriod::Monthly, 0);
        let mismatch = config(
            InterestType::Fixed,
            Some(dec!(0.01)),
            None,
            CalculationPeriod::Monthly,
            0,
        );
        for c in [both, neither, mismatch] {
            assert!(matches!(
                compute_interest(&q, &c, date(2025, 3, 1), 2),
                Err(BillingError::ConfigurationError(_))
            ));
        }
    }

    #[test]
    fn test_most_specific_configuration_wins() {
        let q = quota(dec!(100), date(2025, 1, 15));
        let general = config(
            InterestType::Simple,
            Some(dec!(0.01)),
            None,
            CalculationPeriod::Monthly,
            0,
        );
        let mut by_concept = general.clone();
        by_concept.id = Uuid::new_v4();
        by_concept.payment_concept_id = Some(q.payment_concept_id);
        let mut by_building = general.clone();
        by_building.id = Uuid::new_v4();
        by_building.building_id = Some(q.building_id);

        let configs = vec![general.clone(), by_concept.clone(), by_building.clone()];
        let chosen = resolve_interest_configuration(&configs, &q, date(2025, 2, 1)).unwrap();
        assert_eq!(chosen.id, by_building.id);

        let configs = vec![general.clone(), by_concept.clone()];
        let chosen = resolve_interest_configuration(&configs, &q, date(2025, 2, 1)).unwrap();
        assert_eq!(chosen.id, by_concept.id);
    }
}
