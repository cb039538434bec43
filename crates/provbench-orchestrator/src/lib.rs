//! provbench Orchestrator Library
//!
//! Rents providers on a compute marketplace, runs benchmark suites on them
//! and reports the results, statuses and costs to the reputation backend.
//!
//! A run filters incoming offers ([`ProviderFilter`]), rents a bounded number
//! of activities at a time ([`ActivityPool`]), fans tasks out over them
//! ([`TaskDispatcher`]) and totals what was paid ([`CostLedger`]).
//! [`BenchmarkRun`] drives one run end to end and [`DailyScheduler`] repeats
//! it once a day.

pub mod config;
pub mod context;
pub mod dispatcher;
pub mod filter;
pub mod ledger;
pub mod pool;
pub mod retry;
pub mod runner;
pub mod scheduler;
pub mod stages;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{Config, ConfigError, Suite};
pub use context::RunContext;
pub use dispatcher::{DispatchReport, TaskBody, TaskDispatcher, TaskError, TaskResult};
pub use filter::{Decision, FilterGate, ProviderFilter, ProviderScope, ScopeMode};
pub use ledger::{CostLedger, RunLedger};
pub use pool::{ActivityPool, PoolConfig, PoolError, PoolStats, PooledActivity};
pub use retry::{Backoff, RetryPolicy};
pub use runner::{BenchmarkRun, RunError, RunSummary};
pub use scheduler::{DailyScheduler, SchedulerError};
pub use stages::{StageError, StageRunner, StageSuite};
pub use store::{FileStore, LastRunStore, StoreError};
