//! Orchestrator configuration.

use std::path::PathBuf;
use std::time::Duration;

use chrono::NaiveTime;
use provbench_core::{AgreementId, TaskKind};
use provbench_market::{Image, Resources};
use thiserror::Error;

use crate::filter::ProviderScope;
use crate::retry::RetryPolicy;

/// Image the CPU suite runs in.
pub const DEFAULT_IMAGE_HASH: &str = "c317251c8e48a74e73f2bf0b74937a2d7e33e0a06ed04e043ab9e2ab";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("count must be at least 1")]
    ZeroCount,

    #[error("max replicas must be at least 1")]
    ZeroReplicas,

    #[error("price per hour must be positive, got {0}")]
    InvalidPrice(f64),

    #[error("budget must be positive, got {0}")]
    InvalidBudget(f64),

    #[error("invalid cron time '{0}', expected HH:MM")]
    InvalidCronTime(String),
}

/// Stage suite to run on every provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum Suite {
    /// Memory, CPU, disk and network benchmarks in a VM.
    #[default]
    Cpu,
    /// GPU probe and burn test.
    Gpu,
}

impl Suite {
    /// Task type reported for completions of this suite.
    pub fn task_kind(&self) -> TaskKind {
        match self {
            Self::Cpu => TaskKind::Cpu,
            Self::Gpu => TaskKind::Gpu,
        }
    }
}

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Reporting backend root URL.
    pub backend_url: String,

    /// Bearer token for the reporting backend.
    pub api_token: Option<String>,

    /// Reputation snapshot URL. Without one, offers are judged on budget.
    pub reputation_url: Option<String>,

    /// Number of tasks (providers to benchmark) per run.
    pub count: usize,

    /// Maximum concurrently rented activities. Defaults to `count`.
    pub max_replicas: Option<usize>,

    /// Price ceiling in GLM per CPU hour, used for the budget estimate.
    pub price_per_hour: f64,

    /// Explicit total budget; estimated from price and duration when unset.
    pub budget: Option<f64>,

    /// Workload image.
    pub image: Image,

    /// Resources demanded from providers.
    pub resources: Resources,

    /// Expected time a suite takes on one provider.
    pub expected_execution: Duration,

    /// Expected time to deploy an activity.
    pub expected_deployment: Duration,

    /// Time allowed for the marketplace to start negotiating.
    pub init_timeout: Duration,

    /// Time a task may wait for an activity.
    pub request_start_timeout: Duration,

    /// Time a task may run once it holds an activity.
    pub request_timeout: Duration,

    /// Time allowed to deploy and start an activity.
    pub provision_timeout: Duration,

    /// Time allowed for a single remote command.
    pub execute_timeout: Duration,

    /// Interval between idle activity evictions.
    pub downscale_interval: Duration,

    /// Retry policy for activity state queries.
    pub validation_retry: RetryPolicy,

    /// Interval between checks for new proposals while acquiring.
    pub agreement_poll_interval: Duration,

    /// Agreements used by earlier runs; activities on them are never handed out.
    pub computed_already: Vec<AgreementId>,

    /// Stage suite.
    pub suite: Suite,

    /// Run the optional network stage of the CPU suite.
    pub include_network: bool,

    /// Optional allow/deny list of providers.
    pub scope: Option<ProviderScope>,

    /// Only negotiate and report offers; rent nothing.
    pub dry_run: bool,

    /// How long a dry run negotiates.
    pub dry_run_duration: Duration,

    /// Last-run store file.
    pub store_path: PathBuf,

    /// Key under which the last run date is stored.
    pub store_key: String,

    /// Daily trigger time (UTC).
    pub cron_time: NaiveTime,

    /// Debug mode: verbose logs, no start jitter, ignore the last-run date.
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend_url: "http://api.localhost".to_string(),
            api_token: None,
            reputation_url: None,
            count: 30,
            max_replicas: None,
            price_per_hour: 3.0,
            budget: None,
            image: Image::Hash(DEFAULT_IMAGE_HASH.to_string()),
            resources: Resources::default(),
            expected_execution: Duration::from_secs(20 * 60),
            expected_deployment: Duration::from_secs(60),
            init_timeout: Duration::from_secs(90),
            request_start_timeout: Duration::from_secs(90),
            request_timeout: Duration::from_secs(20 * 60),
            provision_timeout: Duration::from_secs(60),
            execute_timeout: Duration::from_secs(5 * 60),
            downscale_interval: Duration::from_secs(90),
            validation_retry: RetryPolicy::default(),
            agreement_poll_interval: Duration::from_millis(500),
            computed_already: Vec::new(),
            suite: Suite::Cpu,
            include_network: true,
            scope: None,
            dry_run: false,
            dry_run_duration: Duration::from_secs(60),
            store_path: PathBuf::from("provbench-state.json"),
            store_key: "benchmark-last-run".to_string(),
            cron_time: NaiveTime::MIN,
            debug: false,
        }
    }
}

impl Config {
    /// Effective pool size.
    pub fn max_replicas(&self) -> usize {
        self.max_replicas.unwrap_or(self.count)
    }

    /// Planned rental duration in hours.
    pub fn rent_hours(&self) -> f64 {
        (self.expected_execution + self.expected_deployment).as_secs_f64() / 3600.0
    }

    /// Total budget estimate: rent hours × price × CPUs × replicas.
    ///
    /// CPUs come from the demanded maximum, else the minimum, else 32.
    pub fn budget_estimate(&self) -> f64 {
        let cpus = self
            .resources
            .max_cpu
            .or(Some(self.resources.min_cpu).filter(|c| *c > 0))
            .unwrap_or(32);
        self.rent_hours() * self.price_per_hour * f64::from(cpus) * self.max_replicas() as f64
    }

    /// Budget available to a single rented slot.
    pub fn budget_per_slot(&self) -> f64 {
        self.budget.unwrap_or_else(|| self.budget_estimate()) / self.max_replicas() as f64
    }

    /// Reject unusable settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.count == 0 {
            return Err(ConfigError::ZeroCount);
        }
        if self.max_replicas() == 0 {
            return Err(ConfigError::ZeroReplicas);
        }
        if self.price_per_hour.is_nan() || self.price_per_hour <= 0.0 {
            return Err(ConfigError::InvalidPrice(self.price_per_hour));
        }
        if let Some(budget) = self.budget {
            if budget.is_nan() || budget <= 0.0 {
                return Err(ConfigError::InvalidBudget(budget));
            }
        }
        Ok(())
    }
}

/// Parse a `HH:MM` trigger time.
pub fn parse_cron_time(value: &str) -> Result<NaiveTime, ConfigError> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M")
        .map_err(|_| ConfigError::InvalidCronTime(value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_replicas(), 30);
    }

    #[test]
    fn test_budget_estimate_uses_min_cpu() {
        let config = Config {
            count: 10,
            price_per_hour: 3.0,
            ..Config::default()
        };
        // 21 minutes at 3 GLM/h on 1 CPU, 10 replicas.
        let expected = 21.0 / 60.0 * 3.0 * 1.0 * 10.0;
        assert!((config.budget_estimate() - expected).abs() < 1e-9);
        assert!((config.budget_per_slot() - expected / 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_explicit_budget_is_split_across_replicas() {
        let config = Config {
            count: 10,
            max_replicas: Some(4),
            budget: Some(2.0),
            ..Config::default()
        };
        assert!((config.budget_per_slot() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let zero = Config {
            count: 0,
            ..Config::default()
        };
        assert!(matches!(zero.validate(), Err(ConfigError::ZeroCount)));

        let free = Config {
            price_per_hour: 0.0,
            ..Config::default()
        };
        assert!(matches!(free.validate(), Err(ConfigError::InvalidPrice(_))));

        let nan = Config {
            price_per_hour: f64::NAN,
            ..Config::default()
        };
        assert!(nan.validate().is_err());
    }

    #[test]
    fn test_parse_cron_time() {
        assert_eq!(
            parse_cron_time("02:30").unwrap(),
            NaiveTime::from_hms_opt(2, 30, 0).unwrap()
        );
        assert!(parse_cron_time("25:00").is_err());
    }
}
