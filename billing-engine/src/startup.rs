//! Application startup and the one-shot job pass.

use crate::config::BillingConfig;
use crate::engine::{BillingEngine, DueRunReport};
use crate::error::BillingError;
use crate::models::{AccrualScope, AccrualSummary};
use crate::services::Database;
use chrono::NaiveDate;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub type PgBillingEngine = BillingEngine<Database, Database, Database>;

/// What one pass did.
#[derive(Debug, Serialize)]
pub struct JobReport {
    pub as_of: NaiveDate,
    pub generation: Option<DueRunReport>,
    pub accrual: Option<AccrualSummary>,
}

impl JobReport {
    /// True when any schedule or quota failed.
    pub fn has_failures(&self) -> bool {
        let generation_failed = self
            .generation
            .as_ref()
            .is_some_and(|r| r.schedules_failed > 0);
        let accrual_failed = self.accrual.as_ref().is_some_and(|s| s.quotas_failed > 0);
        generation_failed || accrual_failed
    }
}

pub struct Application {
    config: BillingConfig,
    db: Arc<Database>,
    engine: PgBillingEngine,
}

impl Application {
    pub async fn build(config: BillingConfig) -> Result<Self, BillingError> {
        let db = Database::new(
            &config.database.url,
            config.database.max_connections,
            config.database.min_connections,
        )
        .await?
        .with_lock_timeout(Duration::from_millis(config.database.lock_timeout_ms));

        if config.run_migrations {
            db.run_migrations().await?;
        }
        db.health_check().await?;

        let db = Arc::new(db);
        let engine = BillingEngine::new(
            db.clone(),
            db.clone(),
            db.clone(),
            config.engine_settings(),
        );

        Ok(Self { config, db, engine })
    }

    pub fn engine(&self) -> &PgBillingEngine {
        &self.engine
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Generate due schedules, then accrue interest, for `as_of`.
    pub async fn run_once(&self, as_of: NaiveDate) -> Result<JobReport, BillingError> {
        let jobs = self.config.jobs;
        info!(
            as_of = %as_of,
            generation = jobs.generation,
            accrual = jobs.accrual,
            "Starting billing pass"
        );

        let generation = if jobs.generation {
            Some(self.engine.run_due_schedules(as_of, None).await?)
        } else {
            None
        };

        let accrual = if jobs.accrual {
            Some(self.engine.accrue_interest(as_of, AccrualScope::All).await?)
        } else {
            None
        };

        Ok(JobReport {
            as_of,
            generation,
            accrual,
        })
    }
}
