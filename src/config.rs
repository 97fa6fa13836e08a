use std::time::Duration;

use serde::Deserialize;

/// Process configuration, read from the environment (and `.env` via dotenv).
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_address: String,
    /// Base address of the accrual authority polled by the reconciliation worker
    pub accrual_system_address: String,
    pub calculation_interval_secs: u64,
    pub calculation_batch_size: u32,
    pub reconciliation_interval_secs: u64,
    pub reconciliation_batch_size: u32,
    pub worker_concurrency: u32,
    pub claim_lease_secs: u64,
    pub authority_timeout_secs: u64,
    pub rate_limit_fallback_secs: u64,
    pub status_rate_limit_per_minute: u32,
    pub shutdown_grace_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .set_default("database_url", "postgresql://localhost/loyalty")?
            .set_default("bind_address", "0.0.0.0:8081")?
            .set_default("accrual_system_address", "http://localhost:8081")?
            .set_default("calculation_interval_secs", 5)?
            .set_default("calculation_batch_size", 5)?
            .set_default("reconciliation_interval_secs", 5)?
            .set_default("reconciliation_batch_size", 50)?
            .set_default("worker_concurrency", 16)?
            .set_default("claim_lease_secs", 60)?
            .set_default("authority_timeout_secs", 10)?
            .set_default("rate_limit_fallback_secs", 60)?
            .set_default("status_rate_limit_per_minute", 100)?
            .set_default("shutdown_grace_secs", 30)?
            .add_source(config::Environment::default().try_parsing(true))
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), config::ConfigError> {
        let positive = [
            ("CALCULATION_INTERVAL_SECS", self.calculation_interval_secs),
            ("CALCULATION_BATCH_SIZE", self.calculation_batch_size as u64),
            ("RECONCILIATION_INTERVAL_SECS", self.reconciliation_interval_secs),
            ("RECONCILIATION_BATCH_SIZE", self.reconciliation_batch_size as u64),
            ("WORKER_CONCURRENCY", self.worker_concurrency as u64),
            ("CLAIM_LEASE_SECS", self.claim_lease_secs),
            ("RATE_LIMIT_FALLBACK_SECS", self.rate_limit_fallback_secs),
            ("STATUS_RATE_LIMIT_PER_MINUTE", self.status_rate_limit_per_minute as u64),
        ];

        for (name, value) in positive {
            if value == 0 {
                return Err(config::ConfigError::Message(format!(
                    "{} must be greater than zero",
                    name
                )));
            }
        }

        Ok(())
    }

    pub fn claim_lease(&self) -> Duration {
        Duration::from_secs(self.claim_lease_secs)
    }

    pub fn authority_timeout(&self) -> Duration {
        Duration::from_secs(self.authority_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}
