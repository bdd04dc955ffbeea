//! Schedule driver: due-ness, target periods and quota dates.

use crate::error::BillingError;
use crate::models::{Frequency, GenerationSchedule, Period};
use chrono::{Days, Months, NaiveDate};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScheduleState {
    Inactive,
    Idle,
    Due,
}

/// Issue and due dates of one generated period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodPlan {
    pub period: Period,
    pub issue_date: NaiveDate,
    pub due_date: NaiveDate,
}

pub fn state(schedule: &GenerationSchedule, as_of: NaiveDate) -> ScheduleState {
    if !schedule.state.is_active() {
        return ScheduleState::Inactive;
    }
    match schedule.next_generation_date {
        Some(next) if next > as_of => ScheduleState::Idle,
        _ => ScheduleState::Due,
    }
}

fn validate_days(schedule: &GenerationSchedule) -> Result<(), BillingError> {
    if schedule.frequency_value < 1 {
        return Err(BillingError::ConfigurationError(format!(
            "schedule {} has frequency_value {}, expected at least 1",
            schedule.id, schedule.frequency_value
        )));
    }
    if schedule.periods_in_advance < 1 {
        return Err(BillingError::ConfigurationError(format!(
            "schedule {} has periods_in_advance {}, expected at least 1",
            schedule.id, schedule.periods_in_advance
        )));
    }
    for (field, day) in [
        ("generation_day", schedule.generation_day),
        ("issue_day", schedule.issue_day),
        ("due_day", schedule.due_day),
    ] {
        if !(1..=31).contains(&day) {
            return Err(BillingError::ConfigurationError(format!(
                "schedule {} has {} {}, expected 1..=31",
                schedule.id, field, day
            )));
        }
    }
    if schedule.due_day < schedule.issue_day {
        return Err(BillingError::ConfigurationError(format!(
            "schedule {} has due_day {} before issue_day {}",
            schedule.id, schedule.due_day, schedule.issue_day
        )));
    }
    Ok(())
}

/// Issue and due date for `period`. Days past the month end clamp to it.
pub fn period_dates(
    schedule: &GenerationSchedule,
    period: Period,
) -> Result<PeriodPlan, BillingError> {
    validate_days(schedule)?;
    let issue_date = period.day_clamped(schedule.issue_day as u32);
    let offset = (schedule.due_day - schedule.issue_day) as u64;
    let due_date = issue_date
        .checked_add_days(Days::new(offset))
        .map(|d| d.min(period.last_day()))
        .unwrap_or_else(|| period.last_day());
    Ok(PeriodPlan {
        period,
        issue_date,
        due_date,
    })
}

/// Every period a run at `as_of` should produce, oldest first.
///
/// Starts after `last_generated_period` (or at the period of the next
/// generation date) and extends `periods_in_advance - 1` steps past the
/// period of the next generation date. Empty when every period up to that
/// horizon was already generated, as happens when a `days` schedule runs
/// several times within one month.
pub fn target_periods(
    schedule: &GenerationSchedule,
    as_of: NaiveDate,
) -> Result<Vec<PeriodPlan>, BillingError> {
    validate_days(schedule)?;
    let step = schedule.step_months();
    let anchor = Period::containing(schedule.next_generation_date.unwrap_or(as_of));
    let first = match schedule.last_period() {
        Some(last) => last.plus_months(step),
        None => anchor,
    };
    let horizon = anchor.plus_months(step * (schedule.periods_in_advance as u32 - 1));

    let mut plans = Vec::new();
    let mut current = first;
    while current <= horizon {
        plans.push(period_dates(schedule, current)?);
        current = current.plus_months(step);
    }
    Ok(plans)
}

/// Next generation date after a successful run.
pub fn advance(schedule: &GenerationSchedule, as_of: NaiveDate) -> NaiveDate {
    let from = schedule.next_generation_date.unwrap_or(as_of);
    match schedule.frequency {
        Frequency::Days => from
            .checked_add_days(Days::new(schedule.frequency_value.max(1) as u64))
            .unwrap_or(from),
        _ => {
            let next_month = from
                .checked_add_months(Months::new(schedule.step_months()))
                .unwrap_or(from);
            Period::containing(next_month).day_clamped(schedule.generation_day.max(1) as u32)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RecordState;
    use chrono::Utc;
    use uuid::Uuid;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn schedule(frequency: Frequency, next: Option<NaiveDate>) -> GenerationSchedule {
        GenerationSchedule {
            id: Uuid::new_v4(),
            rule_id: Uuid::new_v4(),
            name: "Monthly".to_string(),
            frequency,
            frequency_value: 1,
            generation_day: 1,
            periods_in_advance: 1,
            issue_day: 1,
            due_day: 15,
            grace_days: 0,
            state: RecordState::Active,
            last_generated_period: None,
            last_generated_at: None,
            next_generation_date: next,
            version: 1,
            created_by: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_state() {
        let mut s = schedule(Frequency::Monthly, Some(date(2025, 2, 1)));
        assert_eq!(state(&s, date(2025, 1, 31)), ScheduleState::Idle);
        assert_eq!(state(&s, date(2025, 2, 1)), ScheduleState::Due);
        s.next_generation_date = None;
        assert_eq!(state(&s, date(2025, 1, 31)), ScheduleState::Due);
        s.state = RecordState::Inactive;
        assert_eq!(state(&s, date(2025, 2, 1)), ScheduleState::Inactive);
    }

    #[test]
    fn test_period_dates_clamp() {
        let mut s = schedule(Frequency::Monthly, None);
        s.issue_day = 28;
        s.due_day = 31;
        let plan = period_dates(&s, Period::new(2025, 2).unwrap()).unwrap();
        assert_eq!(plan.issue_date, date(2025, 2, 28));
        assert_eq!(plan.due_date, date(2025, 2, 28));

        let plan = period_dates(&s, Period::new(2025, 3).unwrap()).unwrap();
        assert_eq!(plan.issue_date, date(2025, 3, 28));
        assert_eq!(plan.due_date, date(2025, 3, 31));
    }

    #[test]
    fn test_due_before_issue_is_configuration_error() {
        let mut s = schedule(Frequency::Monthly, None);
        s.issue_day = 10;
        s.due_day = 5;
        assert!(matches!(
            period_dates(&s, Period::new(2025, 1).unwrap()),
            Err(BillingError::ConfigurationError(_))
        ));
    }

    #[test]
    fn test_first_run_targets_next_generation_period() {
        let s = schedule(Frequency::Monthly, Some(date(2025, 1, 1)));
        let plans = target_periods(&s, date(2025, 1, 1)).unwrap();
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].period, Period::new(2025, 1).unwrap());
        assert_eq!(plans[0].due_date, date(2025, 1, 15));
    }

    #[test]
    fn test_periods_in_advance() {
        let mut s = schedule(Frequency::Monthly, Some(date(2025, 1, 1)));
        s.periods_in_advance = 3;
        let periods: Vec<_> = target_periods(&s, date(2025, 1, 1))
            .unwrap()
            .into_iter()
            .map(|p| p.period.to_string())
            .collect();
        assert_eq!(periods, vec!["2025-01", "2025-02", "2025-03"]);

        s.last_generated_period = Some("2025-03".to_string());
        s.next_generation_date = Some(date(2025, 2, 1));
        let periods: Vec<_> = target_periods(&s, date(2025, 2, 1))
            .unwrap()
            .into_iter()
            .map(|p| p.period.to_string())
            .collect();
        assert_eq!(periods, vec!["2025-04"]);
    }

    #[test]
    fn test_quarterly_step() {
        let mut s = schedule(Frequency::Quarterly, Some(date(2025, 4, 1)));
        s.last_generated_period = Some("2025-01".to_string());
        let plans = target_periods(&s, date(2025, 4, 1)).unwrap();
        assert_eq!(plans[0].period, Period::new(2025, 4).unwrap());
        assert_eq!(advance(&s, date(2025, 4, 1)), date(2025, 7, 1));
    }

    #[test]
    fn test_advance_clamps_generation_day() {
        let mut s = schedule(Frequency::Monthly, Some(date(2025, 1, 31)));
        s.generation_day = 31;
        assert_eq!(advance(&s, date(2025, 1, 31)), date(2025, 2, 28));
    }

    #[test]
    fn test_days_schedule_bills_each_month_once() {
        let mut s = schedule(Frequency::Days, Some(date(2025, 1, 1)));
        s.frequency_value = 7;

        let mut billed = Vec::new();
        for _ in 0..9 {
            let run_on = s.next_generation_date.unwrap();
            let plans = target_periods(&s, run_on).unwrap();
            if let Some(last) = plans.last() {
                s.last_generated_period = Some(last.period.to_string());
            }
            billed.extend(plans.into_iter().map(|p| (run_on, p.period.to_string())));
            s.next_generation_date = Some(advance(&s, run_on));
        }

        assert_eq!(
            billed,
            vec![
                (date(2025, 1, 1), "2025-01".to_string()),
                (date(2025, 2, 5), "2025-02".to_string()),
            ]
        );
        assert_eq!(s.next_generation_date, Some(date(2025, 3, 5)));
    }

    #[test]
    fn test_generated_horizon_yields_no_periods() {
        let mut s = schedule(Frequency::Monthly, Some(date(2025, 2, 1)));
        s.last_generated_period = Some("2025-02".to_string());
        assert!(target_periods(&s, date(2025, 2, 1)).unwrap().is_empty());
    }

    #[test]
    fn test_advance_days_frequency() {
        let mut s = schedule(Frequency::Days, Some(date(2025, 1, 1)));
        s.frequency_value = 10;
        assert_eq!(advance(&s, date(2025, 1, 1)), date(2025, 1, 11));
    }
}
