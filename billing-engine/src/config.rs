//! Configuration module for billing-engine.

use crate::engine::EngineSettings;
use crate::error::BillingError;
use chrono::NaiveDate;
use service_core::config as core_config;
use service_core::retry::RetryConfig;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct BillingConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub base_currency: String,
    pub retry: RetrySettings,
    pub generation_concurrency: usize,
    pub accrual_concurrency: usize,
    /// Date the job runs for; today when unset.
    pub as_of: Option<NaiveDate>,
    pub jobs: JobSelection,
    pub run_migrations: bool,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub lock_timeout_ms: u64,
}

#[derive(Debug, Clone)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

/// Passes the job binary performs, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobSelection {
    pub generation: bool,
    pub accrual: bool,
}

impl Default for JobSelection {
    fn default() -> Self {
        Self {
            generation: true,
            accrual: true,
        }
    }
}

impl JobSelection {
    /// Parse a comma separated list such as `generation,accrual`.
    pub fn parse(list: &str) -> Result<Self, BillingError> {
        let mut jobs = Self {
            generation: false,
            accrual: false,
        };
        for job in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            match job {
                "generation" => jobs.generation = true,
                "accrual" => jobs.accrual = true,
                other => {
                    return Err(BillingError::ConfigError(anyhow::anyhow!(
                        "Unknown job '{}' in BILLING_JOBS",
                        other
                    )))
                }
            }
        }
        Ok(jobs)
    }
}

impl BillingConfig {
    pub fn from_env() -> Result<Self, BillingError> {
        let common = core_config::Config::load()?;
        Self::from_lookup(common, |key| env::var(key).ok())
    }

    /// Build from `common` and a variable lookup.
    pub fn from_lookup(
        common: core_config::Config,
        var: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, BillingError> {
        let parsed = |key: &str| var(key).and_then(|s| s.trim().parse::<u64>().ok());

        let as_of = match var("BILLING_AS_OF") {
            Some(raw) => Some(NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").map_err(|e| {
                BillingError::ConfigError(anyhow::anyhow!("Invalid BILLING_AS_OF '{}': {}", raw, e))
            })?),
            None => None,
        };

        let jobs = match var("BILLING_JOBS") {
            Some(list) => JobSelection::parse(&list)?,
            None => JobSelection::default(),
        };

        Ok(Self {
            service_name: var("SERVICE_NAME").unwrap_or_else(|| "billing-engine".to_string()),
            log_level: var("LOG_LEVEL").unwrap_or_else(|| common.log_level.clone()),
            otlp_endpoint: var("OTLP_ENDPOINT").or_else(|| common.otlp_endpoint.clone()),
            database: DatabaseConfig {
                url: var("BILLING_DATABASE_URL").ok_or_else(|| {
                    BillingError::ConfigError(anyhow::anyhow!("BILLING_DATABASE_URL is required"))
                })?,
                max_connections: parsed("BILLING_DATABASE_MAX_CONNECTIONS").unwrap_or(10) as u32,
                min_connections: parsed("BILLING_DATABASE_MIN_CONNECTIONS").unwrap_or(2) as u32,
                lock_timeout_ms: parsed("BILLING_LOCK_TIMEOUT_MS").unwrap_or(5_000),
            },
            base_currency: var("BILLING_BASE_CURRENCY")
                .map(|c| c.trim().to_uppercase())
                .unwrap_or_else(|| "USD".to_string()),
            retry: RetrySettings {
                max_retries: parsed("BILLING_RETRY_MAX_RETRIES").unwrap_or(3) as u32,
                initial_backoff_ms: parsed("BILLING_RETRY_INITIAL_BACKOFF_MS").unwrap_or(50),
                max_backoff_ms: parsed("BILLING_RETRY_MAX_BACKOFF_MS").unwrap_or(2_000),
            },
            generation_concurrency: parsed("BILLING_GENERATION_CONCURRENCY").unwrap_or(4).max(1)
                as usize,
            accrual_concurrency: parsed("BILLING_ACCRUAL_CONCURRENCY").unwrap_or(8).max(1) as usize,
            as_of,
            jobs,
            run_migrations: var("BILLING_RUN_MIGRATIONS")
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(true),
            common,
        })
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.retry.max_retries,
            initial_backoff: Duration::from_millis(self.retry.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.retry.max_backoff_ms),
            ..RetryConfig::default()
        }
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            base_currency: self.base_currency.clone(),
            retry: self.retry_config(),
            generation_concurrency: self.generation_concurrency,
            accrual_concurrency: self.accrual_concurrency,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = BillingConfig::from_lookup(
            core_config::Config::default(),
            lookup(&[("BILLING_DATABASE_URL", "postgres://localhost/billing")]),
        )
        .unwrap();

        assert_eq!(config.service_name, "billing-engine");
        assert_eq!(config.base_currency, "USD");
        assert_eq!(config.database.max_connections, 10);
        assert_eq!(config.database.lock_timeout_ms, 5_000);
        assert_eq!(config.jobs, JobSelection::default());
        assert!(config.as_of.is_none());
        assert!(config.run_migrations);

        let settings = config.engine_settings();
        assert_eq!(settings.retry.max_retries, 3);
        assert_eq!(settings.accrual_concurrency, 8);
    }

    #[test]
    fn test_database_url_is_required() {
        let result = BillingConfig::from_lookup(core_config::Config::default(), lookup(&[]));
        assert!(matches!(result, Err(BillingError::ConfigError(_))));
    }

    #[test]
    fn test_overrides() {
        let config = BillingConfig::from_lookup(
            core_config::Config::default(),
            lookup(&[
                ("BILLING_DATABASE_URL", "postgres://db/billing"),
                ("BILLING_BASE_CURRENCY", "eur"),
                ("BILLING_AS_OF", "2025-03-01"),
                ("BILLING_JOBS", "accrual"),
                ("BILLING_RETRY_MAX_RETRIES", "5"),
                ("BILLING_ACCRUAL_CONCURRENCY", "0"),
            ]),
        )
        .unwrap();

        assert_eq!(config.base_currency, "EUR");
        assert_eq!(config.as_of, NaiveDate::from_ymd_opt(2025, 3, 1));
        assert!(!config.jobs.generation);
        assert!(config.jobs.accrual);
        assert_eq!(config.retry_config().max_retries, 5);
        assert_eq!(config.accrual_concurrency, 1);
    }

    #[test]
    fn test_invalid_as_of_and_job() {
        let base = [("BILLING_DATABASE_URL", "postgres://db/billing")];
        let mut bad_date = base.to_vec();
        bad_date.push(("BILLING_AS_OF", "03/01/2025"));
        assert!(
            BillingConfig::from_lookup(core_config::Config::default(), lookup(&bad_date)).is_err()
        );

        assert!(JobSelection::parse("generation, billing").is_err());
        assert_eq!(
            JobSelection::parse("generation").unwrap(),
            JobSelection {
                generation: true,
                accrual: false
            }
        );
    }
}
