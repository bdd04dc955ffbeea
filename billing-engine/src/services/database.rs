//! PostgreSQL store for billing-engine.

use crate::error::BillingError;
use crate::models::{
    AccrualScope, Currency, ExchangeRate, GenerationLog, GenerationRule, GenerationSchedule,
    InterestConfiguration, Payment, PaymentApplication, PendingAllocation, Period, Quota,
    QuotaAdjustment, QuotaFormula, QuotaFormulaRow, Unit,
};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::store::{BillingStore, CurrencyDirectory, StoreTransaction, UnitDirectory};
use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use std::time::Duration;
use tracing::{debug, info, instrument};
use uuid::Uuid;

const QUOTA_COLUMNS: &str = "id, unit_id, condominium_id, building_id, payment_concept_id, \
    period_year, period_month, period_description, base_amount, currency, \
    amount_in_base_currency, exchange_rate_used, interest_amount, interest_paid, paid_amount, \
    balance, issue_date, due_date, status, generation_log_id, version, created_by, created_at, \
    updated_at";

const SCHEDULE_COLUMNS: &str = "id, rule_id, name, frequency, frequency_value, generation_day, \
    periods_in_advance, issue_day, due_day, grace_days, state, last_generated_period, \
    last_generated_at, next_generation_date, version, created_by, created_at, updated_at";

const RULE_COLUMNS: &str = "id, condominium_id, building_id, payment_concept_id, \
    quota_formula_id, name, effective_from, effective_to, state, created_by, created_at";

const PAYMENT_COLUMNS: &str = "id, unit_id, amount, currency, paid_amount, paid_currency, \
    exchange_rate, payment_date, status, verified_by, verified_at, verification_notes, created_at";

const APPLICATION_COLUMNS: &str = "id, payment_id, quota_id, applied_amount, \
    applied_to_interest, applied_to_principal, created_at";

const PENDING_COLUMNS: &str = "id, payment_id, pending_amount, applied_amount, currency, status, \
    resolution_type, resolution_notes, allocated_to_quota_id, allocated_by, allocated_at, \
    created_at";

const FORMULA_COLUMNS: &str = "id, condominium_id, name, description, formula_type, \
    fixed_amount, expression, variables, unit_amounts, currency, state, version, updated_by, \
    update_reason, created_at, updated_at";

const UNIT_COLUMNS: &str = "id, condominium_id, building_id, unit_number, floor, area_m2, \
    aliquot_percentage, bedrooms, bathrooms, parking_spaces, state";

/// Keep lock and serialization failures classifiable; wrap everything else
/// with `context`.
fn db_error(context: &'static str) -> impl Fn(sqlx::Error) -> BillingError {
    move |e| match BillingError::from(e) {
        BillingError::DatabaseError(inner) => {
            BillingError::DatabaseError(anyhow::anyhow!("Failed to {}: {}", context, inner))
        }
        other => other,
    }
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
    lock_timeout_ms: u64,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "billing-engine"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, BillingError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| BillingError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self {
            pool,
            lock_timeout_ms: 5_000,
        })
    }

    /// Bound how long a transaction waits for a row lock.
    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout_ms = lock_timeout.as_millis().max(1) as u64;
        self
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| BillingError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;

        timer.observe_duration();
        Ok(())
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), BillingError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| BillingError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }
}

#[async_trait]
impl BillingStore for Database {
    type Tx = PgStoreTransaction;

    async fn begin(&self) -> Result<Self::Tx, BillingError> {
        let mut tx = self.pool.begin().await.map_err(db_error("begin transaction"))?;

        // SET does not accept bind parameters.
        sqlx::query(&format!("SET LOCAL lock_timeout = '{}ms'", self.lock_timeout_ms))
            .execute(&mut *tx)
            .await
            .map_err(db_error("set lock timeout"))?;

        Ok(PgStoreTransaction { tx })
    }

    // =========================================================================
    // Schedule Operations
    // =========================================================================

    #[instrument(skip(self))]
    async fn get_schedule(
        &self,
        schedule_id: Uuid,
    ) -> Result<Option<GenerationSchedule>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_schedule"])
            .start_timer();

        let schedule = sqlx::query_as::<_, GenerationSchedule>(&format!(
            "SELECT {} FROM generation_schedules WHERE id = $1",
            SCHEDULE_COLUMNS
        ))
        .bind(schedule_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("get schedule"))?;

        timer.observe_duration();
        Ok(schedule)
    }

    #[instrument(skip(self))]
    async fn list_due_schedules(
        &self,
        as_of: NaiveDate,
    ) -> Result<Vec<GenerationSchedule>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_due_schedules"])
            .start_timer();

        let schedules = sqlx::query_as::<_, GenerationSchedule>(&format!(
            r#"
            SELECT {} FROM generation_schedules
            WHERE state = 'active'
              AND (next_generation_date IS NULL OR next_generation_date <= $1)
            ORDER BY next_generation_date NULLS FIRST, id
            "#,
            SCHEDULE_COLUMNS
        ))
        .bind(as_of)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("list due schedules"))?;

        timer.observe_duration();
        debug!(count = schedules.len(), "Due schedules loaded");
        Ok(schedules)
    }

    #[instrument(skip(self))]
    async fn get_rule(&self, rule_id: Uuid) -> Result<Option<GenerationRule>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_rule"])
            .start_timer();

        let rule = sqlx::query_as::<_, GenerationRule>(&format!(
            "SELECT {} FROM generation_rules WHERE id = $1",
            RULE_COLUMNS
        ))
        .bind(rule_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("get rule"))?;

        timer.observe_duration();
        Ok(rule)
    }

    #[instrument(skip(self))]
    async fn list_rules_for_concept(
        &self,
        condominium_id: Uuid,
        payment_concept_id: Uuid,
    ) -> Result<Vec<GenerationRule>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_rules_for_concept"])
            .start_timer();

        let rules = sqlx::query_as::<_, GenerationRule>(&format!(
            "SELECT {} FROM generation_rules WHERE condominium_id = $1 AND payment_concept_id = $2",
            RULE_COLUMNS
        ))
        .bind(condominium_id)
        .bind(payment_concept_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("list rules"))?;

        timer.observe_duration();
        Ok(rules)
    }

    // =========================================================================
    // Formula and Interest Configuration Operations
    // =========================================================================

    #[instrument(skip(self))]
    async fn get_formula(&self, formula_id: Uuid) -> Result<Option<QuotaFormula>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_formula"])
            .start_timer();

        let row = sqlx::query_as::<_, QuotaFormulaRow>(&format!(
            "SELECT {} FROM quota_formulas WHERE id = $1",
            FORMULA_COLUMNS
        ))
        .bind(formula_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("get formula"))?;

        timer.observe_duration();
        row.map(QuotaFormula::try_from).transpose()
    }

    #[instrument(skip(self))]
    async fn list_interest_configurations(
        &self,
        condominium_id: Uuid,
    ) -> Result<Vec<InterestConfiguration>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_interest_configurations"])
            .start_timer();

        let configs = sqlx::query_as::<_, InterestConfiguration>(
            r#"
            SELECT id, condominium_id, building_id, payment_concept_id, name, interest_type, rate,
                   fixed_amount, calculation_period, grace_period_days, effective_from,
                   effective_to, state, created_at
            FROM interest_configurations WHERE condominium_id = $1
            "#,
        )
        .bind(condominium_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("list interest configurations"))?;

        timer.observe_duration();
        Ok(configs)
    }

    // =========================================================================
    // Quota Operations
    // =========================================================================

    #[instrument(skip(self))]
    async fn list_accrual_candidates(
        &self,
        as_of: NaiveDate,
        scope: AccrualScope,
    ) -> Result<Vec<Quota>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_accrual_candidates"])
            .start_timer();

        let (condominium_id, building_id) = match scope {
            AccrualScope::All => (None, None),
            AccrualScope::Condominium(id) => (Some(id), None),
            AccrualScope::Building(id) => (None, Some(id)),
        };

        let quotas = sqlx::query_as::<_, Quota>(&format!(
            r#"
            SELECT {} FROM quotas
            WHERE status IN ('pending', 'partial', 'overdue')
              AND balance > 0
              AND due_date < $1
              AND ($2::uuid IS NULL OR condominium_id = $2)
              AND ($3::uuid IS NULL OR building_id = $3)
            ORDER BY due_date, created_at, id
            "#,
            QUOTA_COLUMNS
        ))
        .bind(as_of)
        .bind(condominium_id)
        .bind(building_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("list accrual candidates"))?;

        timer.observe_duration();
        Ok(quotas)
    }

    #[instrument(skip(self))]
    async fn get_quota(&self, quota_id: Uuid) -> Result<Option<Quota>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_quota"])
            .start_timer();

        let quota = sqlx::query_as::<_, Quota>(&format!(
            "SELECT {} FROM quotas WHERE id = $1",
            QUOTA_COLUMNS
        ))
        .bind(quota_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("get quota"))?;

        timer.observe_duration();
        Ok(quota)
    }

    #[instrument(skip(self))]
    async fn list_quotas_for_unit(&self, unit_id: Uuid) -> Result<Vec<Quota>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_quotas_for_unit"])
            .start_timer();

        let quotas = sqlx::query_as::<_, Quota>(&format!(
            "SELECT {} FROM quotas WHERE unit_id = $1 ORDER BY due_date, created_at, id",
            QUOTA_COLUMNS
        ))
        .bind(unit_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("list quotas"))?;

        timer.observe_duration();
        Ok(quotas)
    }

    #[instrument(skip(self))]
    async fn list_adjustments(&self, quota_id: Uuid) -> Result<Vec<QuotaAdjustment>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_adjustments"])
            .start_timer();

        let adjustments = sqlx::query_as::<_, QuotaAdjustment>(
            r#"
            SELECT id, quota_id, previous_amount, new_amount, adjustment_type, reason, created_by, created_at
            FROM quota_adjustments WHERE quota_id = $1
            ORDER BY created_at, id
            "#,
        )
        .bind(quota_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("list adjustments"))?;

        timer.observe_duration();
        Ok(adjustments)
    }

    // =========================================================================
    // Payment Operations
    // =========================================================================

    #[instrument(skip(self))]
    async fn get_payment(&self, payment_id: Uuid) -> Result<Option<Payment>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_payment"])
            .start_timer();

        let payment = sqlx::query_as::<_, Payment>(&format!(
            "SELECT {} FROM payments WHERE id = $1",
            PAYMENT_COLUMNS
        ))
        .bind(payment_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("get payment"))?;

        timer.observe_duration();
        Ok(payment)
    }

    #[instrument(skip(self))]
    async fn list_applications_for_payment(
        &self,
        payment_id: Uuid,
    ) -> Result<Vec<PaymentApplication>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_applications_for_payment"])
            .start_timer();

        let applications = sqlx::query_as::<_, PaymentApplication>(&format!(
            "SELECT {} FROM payment_applications WHERE payment_id = $1 ORDER BY created_at, id",
            APPLICATION_COLUMNS
        ))
        .bind(payment_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("list applications"))?;

        timer.observe_duration();
        Ok(applications)
    }

    #[instrument(skip(self))]
    async fn get_pending_allocation(
        &self,
        pending_id: Uuid,
    ) -> Result<Option<PendingAllocation>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_pending_allocation"])
            .start_timer();

        let pending = sqlx::query_as::<_, PendingAllocation>(&format!(
            "SELECT {} FROM payment_pending_allocations WHERE id = $1",
            PENDING_COLUMNS
        ))
        .bind(pending_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("get pending allocation"))?;

        timer.observe_duration();
        Ok(pending)
    }

    #[instrument(skip(self))]
    async fn list_pending_allocations_for_payment(
        &self,
        payment_id: Uuid,
    ) -> Result<Vec<PendingAllocation>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_pending_allocations_for_payment"])
            .start_timer();

        let pending = sqlx::query_as::<_, PendingAllocation>(&format!(
            "SELECT {} FROM payment_pending_allocations WHERE payment_id = $1 ORDER BY created_at, id",
            PENDING_COLUMNS
        ))
        .bind(payment_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("list pending allocations"))?;

        timer.observe_duration();
        Ok(pending)
    }

    // =========================================================================
    // Generation Log Operations
    // =========================================================================

    #[instrument(skip(self))]
    async fn list_generation_logs(
        &self,
        schedule_id: Uuid,
    ) -> Result<Vec<GenerationLog>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_generation_logs"])
            .start_timer();

        let logs = sqlx::query_as::<_, GenerationLog>(
            r#"
            SELECT id, schedule_id, rule_id, generation_method, period_year, period_month,
                   period_description, quotas_created, quotas_failed, quotas_skipped,
                   total_amount, currency, units_affected, parameters, formula_snapshot,
                   status, error_details, generated_by, generated_at
            FROM generation_logs WHERE schedule_id = $1
            ORDER BY generated_at, id
            "#,
        )
        .bind(schedule_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("list generation logs"))?;

        timer.observe_duration();
        Ok(logs)
    }
}

/// Transaction over the Postgres pool with a bounded lock wait.
pub struct PgStoreTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTransaction for PgStoreTransaction {
    async fn commit(self) -> Result<(), BillingError> {
        self.tx.commit().await.map_err(db_error("commit transaction"))
    }

    async fn rollback(self) -> Result<(), BillingError> {
        self.tx
            .rollback()
            .await
            .map_err(db_error("roll back transaction"))
    }

    async fn lock_schedule(
        &mut self,
        schedule_id: Uuid,
    ) -> Result<Option<GenerationSchedule>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["lock_schedule"])
            .start_timer();

        let schedule = sqlx::query_as::<_, GenerationSchedule>(&format!(
            "SELECT {} FROM generation_schedules WHERE id = $1 FOR UPDATE",
            SCHEDULE_COLUMNS
        ))
        .bind(schedule_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_error("lock schedule"))?;

        timer.observe_duration();
        Ok(schedule)
    }

    async fn update_schedule_tracking(
        &mut self,
        schedule: &GenerationSchedule,
    ) -> Result<(), BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_schedule_tracking"])
            .start_timer();

        let result = sqlx::query(
            r#"
            UPDATE generation_schedules
            SET last_generated_period = $2,
                last_generated_at = $3,
                next_generation_date = $4,
                version = version + 1,
                updated_at = NOW()
            WHERE id = $1 AND version = $5
            "#,
        )
        .bind(schedule.id)
        .bind(&schedule.last_generated_period)
        .bind(schedule.last_generated_at)
        .bind(schedule.next_generation_date)
        .bind(schedule.version)
        .execute(&mut *self.tx)
        .await
        .map_err(db_error("update schedule tracking"))?;

        timer.observe_duration();

        if result.rows_affected() == 0 {
            return Err(BillingError::ConcurrencyConflict(format!(
                "schedule {} changed since version {}",
                schedule.id, schedule.version
            )));
        }
        Ok(())
    }

    async fn insert_generation_log(&mut self, log: &GenerationLog) -> Result<(), BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_generation_log"])
            .start_timer();

        sqlx::query(
            r#"
            INSERT INTO generation_logs (id, schedule_id, rule_id, generation_method, period_year,
                period_month, period_description, quotas_created, quotas_failed, quotas_skipped,
                total_amount, currency, units_affected, parameters, formula_snapshot, status,
                error_details, generated_by, generated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
            "#,
        )
        .bind(log.id)
        .bind(log.schedule_id)
        .bind(log.rule_id)
        .bind(log.generation_method.as_str())
        .bind(log.period_year)
        .bind(log.period_month)
        .bind(&log.period_description)
        .bind(log.quotas_created)
        .bind(log.quotas_failed)
        .bind(log.quotas_skipped)
        .bind(log.total_amount)
        .bind(&log.currency)
        .bind(&log.units_affected)
        .bind(&log.parameters)
        .bind(&log.formula_snapshot)
        .bind(log.status.as_str())
        .bind(&log.error_details)
        .bind(log.generated_by)
        .bind(log.generated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(db_error("insert generation log"))?;

        timer.observe_duration();
        Ok(())
    }

    async fn lock_formula(
        &mut self,
        formula_id: Uuid,
    ) -> Result<Option<QuotaFormula>, BillingError> {
        let row = sqlx::query_as::<_, QuotaFormulaRow>(&format!(
            "SELECT {} FROM quota_formulas WHERE id = $1 FOR UPDATE",
            FORMULA_COLUMNS
        ))
        .bind(formula_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_error("lock formula"))?;

        row.map(QuotaFormula::try_from).transpose()
    }

    async fn update_formula(&mut self, formula: &QuotaFormula) -> Result<QuotaFormula, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_formula"])
            .start_timer();

        let row = QuotaFormulaRow::from(formula);
        let updated = sqlx::query_as::<_, QuotaFormulaRow>(&format!(
            r#"
            UPDATE quota_formulas
            SET description = $3,
                formula_type = $4,
                fixed_amount = $5,
                expression = $6,
                variables = $7,
                unit_amounts = $8,
                updated_by = $9,
                update_reason = $10,
                version = version + 1,
                updated_at = NOW()
            WHERE id = $1 AND version = $2
            RETURNING {}
            "#,
            FORMULA_COLUMNS
        ))
        .bind(row.id)
        .bind(row.version)
        .bind(&row.description)
        .bind(&row.formula_type)
        .bind(row.fixed_amount)
        .bind(&row.expression)
        .bind(&row.variables)
        .bind(&row.unit_amounts)
        .bind(row.updated_by)
        .bind(&row.update_reason)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_error("update formula"))?;

        timer.observe_duration();

        updated
            .ok_or_else(|| {
                BillingError::ConcurrencyConflict(format!(
                    "formula {} changed since version {}",
                    formula.id, formula.version
                ))
            })
            .and_then(QuotaFormula::try_from)
    }

    async fn quota_exists(
        &mut self,
        unit_id: Uuid,
        payment_concept_id: Uuid,
        period: Period,
    ) -> Result<bool, BillingError> {
        let exists = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM quotas
                WHERE unit_id = $1 AND payment_concept_id = $2
                  AND period_year = $3 AND period_month = $4
            )
            "#,
        )
        .bind(unit_id)
        .bind(payment_concept_id)
        .bind(period.year)
        .bind(period.month as i32)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(db_error("check quota"))?;

        Ok(exists)
    }

    async fn insert_quota(&mut self, quota: &Quota) -> Result<bool, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_quota"])
            .start_timer();

        let result = sqlx::query(&format!(
            r#"
            INSERT INTO quotas ({})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
                    $18, $19, $20, $21, $22, $23, $24)
            ON CONFLICT (unit_id, payment_concept_id, period_year, period_month) DO NOTHING
            "#,
            QUOTA_COLUMNS
        ))
        .bind(quota.id)
        .bind(quota.unit_id)
        .bind(quota.condominium_id)
        .bind(quota.building_id)
        .bind(quota.payment_concept_id)
        .bind(quota.period_year)
        .bind(quota.period_month)
        .bind(&quota.period_description)
        .bind(quota.base_amount)
        .bind(&quota.currency)
        .bind(quota.amount_in_base_currency)
        .bind(quota.exchange_rate_used)
        .bind(quota.interest_amount)
        .bind(quota.interest_paid)
        .bind(quota.paid_amount)
        .bind(quota.balance)
        .bind(quota.issue_date)
        .bind(quota.due_date)
        .bind(quota.status.as_str())
        .bind(quota.generation_log_id)
        .bind(quota.version)
        .bind(quota.created_by)
        .bind(quota.created_at)
        .bind(quota.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(db_error("insert quota"))?;

        timer.observe_duration();
        Ok(result.rows_affected() == 1)
    }

    async fn lock_quota(&mut self, quota_id: Uuid) -> Result<Option<Quota>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["lock_quota"])
            .start_timer();

        let quota = sqlx::query_as::<_, Quota>(&format!(
            "SELECT {} FROM quotas WHERE id = $1 FOR UPDATE",
            QUOTA_COLUMNS
        ))
        .bind(quota_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_error("lock quota"))?;

        timer.observe_duration();
        Ok(quota)
    }

    async fn lock_outstanding_quotas(&mut self, unit_id: Uuid) -> Result<Vec<Quota>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["lock_outstanding_quotas"])
            .start_timer();

        let quotas = sqlx::query_as::<_, Quota>(&format!(
            r#"
            SELECT {} FROM quotas
            WHERE unit_id = $1 AND status <> 'cancelled' AND balance > 0
            ORDER BY due_date, created_at, id
            FOR UPDATE
            "#,
            QUOTA_COLUMNS
        ))
        .bind(unit_id)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db_error("lock outstanding quotas"))?;

        timer.observe_duration();
        Ok(quotas)
    }

    async fn update_quota(&mut self, quota: &Quota) -> Result<Quota, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_quota"])
            .start_timer();

        let updated = sqlx::query_as::<_, Quota>(&format!(
            r#"
            UPDATE quotas
            SET base_amount = $3,
                amount_in_base_currency = $4,
                interest_amount = $5,
                interest_paid = $6,
                paid_amount = $7,
                balance = $8,
                status = $9,
                version = version + 1,
                updated_at = NOW()
            WHERE id = $1 AND version = $2
            RETURNING {}
            "#,
            QUOTA_COLUMNS
        ))
        .bind(quota.id)
        .bind(quota.version)
        .bind(quota.base_amount)
        .bind(quota.amount_in_base_currency)
        .bind(quota.interest_amount)
        .bind(quota.interest_paid)
        .bind(quota.paid_amount)
        .bind(quota.balance)
        .bind(quota.status.as_str())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_error("update quota"))?;

        timer.observe_duration();

        updated.ok_or_else(|| {
            BillingError::ConcurrencyConflict(format!(
                "quota {} changed since version {}",
                quota.id, quota.version
            ))
        })
    }

    async fn insert_adjustment(
        &mut self,
        adjustment: &QuotaAdjustment,
    ) -> Result<(), BillingError> {
        sqlx::query(
            r#"
            INSERT INTO quota_adjustments (id, quota_id, previous_amount, new_amount, adjustment_type, reason, created_by, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(adjustment.id)
        .bind(adjustment.quota_id)
        .bind(adjustment.previous_amount)
        .bind(adjustment.new_amount)
        .bind(adjustment.adjustment_type.as_str())
        .bind(&adjustment.reason)
        .bind(adjustment.created_by)
        .bind(adjustment.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(db_error("insert adjustment"))?;

        Ok(())
    }

    async fn lock_payment(&mut self, payment_id: Uuid) -> Result<Option<Payment>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["lock_payment"])
            .start_timer();

        let payment = sqlx::query_as::<_, Payment>(&format!(
            "SELECT {} FROM payments WHERE id = $1 FOR UPDATE",
            PAYMENT_COLUMNS
        ))
        .bind(payment_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_error("lock payment"))?;

        timer.observe_duration();
        Ok(payment)
    }

    async fn update_payment_verification(
        &mut self,
        payment: &Payment,
    ) -> Result<(), BillingError> {
        let result = sqlx::query(
            r#"
            UPDATE payments
            SET status = $2,
                verified_by = $3,
                verified_at = $4,
                verification_notes = $5
            WHERE id = $1
            "#,
        )
        .bind(payment.id)
        .bind(payment.status.as_str())
        .bind(payment.verified_by)
        .bind(payment.verified_at)
        .bind(&payment.verification_notes)
        .execute(&mut *self.tx)
        .await
        .map_err(db_error("update payment verification"))?;

        if result.rows_affected() == 0 {
            return Err(BillingError::NotFound(anyhow::anyhow!(
                "Payment {} not found",
                payment.id
            )));
        }
        Ok(())
    }

    async fn applications_for_payment(
        &mut self,
        payment_id: Uuid,
    ) -> Result<Vec<PaymentApplication>, BillingError> {
        let applications = sqlx::query_as::<_, PaymentApplication>(&format!(
            "SELECT {} FROM payment_applications WHERE payment_id = $1 ORDER BY created_at, id",
            APPLICATION_COLUMNS
        ))
        .bind(payment_id)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db_error("list applications"))?;

        Ok(applications)
    }

    async fn insert_application(
        &mut self,
        application: &PaymentApplication,
    ) -> Result<(), BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_application"])
            .start_timer();

        sqlx::query(&format!(
            "INSERT INTO payment_applications ({}) VALUES ($1, $2, $3, $4, $5, $6, $7)",
            APPLICATION_COLUMNS
        ))
        .bind(application.id)
        .bind(application.payment_id)
        .bind(application.quota_id)
        .bind(application.applied_amount)
        .bind(application.applied_to_interest)
        .bind(application.applied_to_principal)
        .bind(application.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(db_error("insert application"))?;

        timer.observe_duration();
        Ok(())
    }

    async fn pending_allocations_for_payment(
        &mut self,
        payment_id: Uuid,
    ) -> Result<Vec<PendingAllocation>, BillingError> {
        let pending = sqlx::query_as::<_, PendingAllocation>(&format!(
            "SELECT {} FROM payment_pending_allocations WHERE payment_id = $1 ORDER BY created_at, id",
            PENDING_COLUMNS
        ))
        .bind(payment_id)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db_error("list pending allocations"))?;

        Ok(pending)
    }

    async fn insert_pending_allocation(
        &mut self,
        pending: &PendingAllocation,
    ) -> Result<(), BillingError> {
        sqlx::query(&format!(
            "INSERT INTO payment_pending_allocations ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
            PENDING_COLUMNS
        ))
        .bind(pending.id)
        .bind(pending.payment_id)
        .bind(pending.pending_amount)
        .bind(pending.applied_amount)
        .bind(&pending.currency)
        .bind(pending.status.as_str())
        .bind(pending.resolution_type.map(|r| r.as_str()))
        .bind(&pending.resolution_notes)
        .bind(pending.allocated_to_quota_id)
        .bind(pending.allocated_by)
        .bind(pending.allocated_at)
        .bind(pending.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(db_error("insert pending allocation"))?;

        Ok(())
    }

    async fn lock_pending_allocation(
        &mut self,
        pending_id: Uuid,
    ) -> Result<Option<PendingAllocation>, BillingError> {
        let pending = sqlx::query_as::<_, PendingAllocation>(&format!(
            "SELECT {} FROM payment_pending_allocations WHERE id = $1 FOR UPDATE",
            PENDING_COLUMNS
        ))
        .bind(pending_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_error("lock pending allocation"))?;

        Ok(pending)
    }

    async fn update_pending_allocation(
        &mut self,
        pending: &PendingAllocation,
    ) -> Result<(), BillingError> {
        let result = sqlx::query(
            r#"
            UPDATE payment_pending_allocations
            SET applied_amount = $2,
                status = $3,
                resolution_type = $4,
                resolution_notes = $5,
                allocated_to_quota_id = $6,
                allocated_by = $7,
                allocated_at = $8
            WHERE id = $1
            "#,
        )
        .bind(pending.id)
        .bind(pending.applied_amount)
        .bind(pending.status.as_str())
        .bind(pending.resolution_type.map(|r| r.as_str()))
        .bind(&pending.resolution_notes)
        .bind(pending.allocated_to_quota_id)
        .bind(pending.allocated_by)
        .bind(pending.allocated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(db_error("update pending allocation"))?;

        if result.rows_affected() == 0 {
            return Err(BillingError::NotFound(anyhow::anyhow!(
                "Pending allocation {} not found",
                pending.id
            )));
        }
        Ok(())
    }
}

// =========================================================================
// Directory Operations
// =========================================================================

#[async_trait]
impl UnitDirectory for Database {
    #[instrument(skip(self))]
    async fn list_units_by_building(&self, building_id: Uuid) -> Result<Vec<Unit>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_units_by_building"])
            .start_timer();

        let units = sqlx::query_as::<_, Unit>(&format!(
            "SELECT {} FROM units WHERE building_id = $1 AND state = 'active' ORDER BY unit_number, id",
            UNIT_COLUMNS
        ))
        .bind(building_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("list units by building"))?;

        timer.observe_duration();
        Ok(units)
    }

    #[instrument(skip(self))]
    async fn list_units_by_condominium(
        &self,
        condominium_id: Uuid,
    ) -> Result<Vec<Unit>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_units_by_condominium"])
            .start_timer();

        let units = sqlx::query_as::<_, Unit>(&format!(
            "SELECT {} FROM units WHERE condominium_id = $1 AND state = 'active' ORDER BY unit_number, id",
            UNIT_COLUMNS
        ))
        .bind(condominium_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("list units by condominium"))?;

        timer.observe_duration();
        Ok(units)
    }
}

#[async_trait]
impl CurrencyDirectory for Database {
    #[instrument(skip(self))]
    async fn get_currency(&self, code: &str) -> Result<Option<Currency>, BillingError> {
        let currency = sqlx::query_as::<_, Currency>(
            "SELECT code, name, decimal_places, is_base FROM currencies WHERE code = $1",
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("get currency"))?;

        Ok(currency)
    }

    #[instrument(skip(self))]
    async fn latest_rate(
        &self,
        from: &str,
        to: &str,
        on: NaiveDate,
    ) -> Result<Option<ExchangeRate>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["latest_rate"])
            .start_timer();

        let rate = sqlx::query_as::<_, ExchangeRate>(
            r#"
            SELECT id, from_currency, to_currency, rate, effective_date
            FROM exchange_rates
            WHERE from_currency = $1 AND to_currency = $2 AND effective_date <= $3
            ORDER BY effective_date DESC
            LIMIT 1
            "#,
        )
        .bind(from)
        .bind(to)
        .bind(on)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("get exchange rate"))?;

        timer.observe_duration();
        Ok(rate)
    }
}
