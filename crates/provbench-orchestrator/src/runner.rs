//! One complete benchmark run.
//!
//! A run is bracketed by the backend's start and end calls. Everything the
//! run produced (benchmark records, task statuses, costs) is reported in bulk
//! once every task has settled, even when the run failed part way.

use std::sync::Arc;

use provbench_backend::{BackendError, ReputationBackend};
use provbench_core::{ReputationIndex, RunId};
use provbench_market::{Demand, MarketError, Marketplace};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::{Config, ConfigError};
use crate::context::RunContext;
use crate::dispatcher::{DispatchReport, TaskDispatcher};
use crate::filter::{FilterGate, ProviderFilter};
use crate::ledger::CostLedger;
use crate::pool::{ActivityPool, PoolConfig, PoolStats};
use crate::stages::{StageRunner, StageSuite};

/// Errors that stop a run before or while dispatching.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to start the run: {0}")]
    Start(#[source] BackendError),

    #[error("Failed to fetch blacklists: {0}")]
    Blacklist(#[source] BackendError),

    #[error("Failed to fetch reputation data: {0}")]
    Reputation(#[source] BackendError),

    #[error("Failed to start negotiating: {0}")]
    Negotiation(#[source] MarketError),

    #[error("Payment feed unavailable: {0}")]
    Payments(#[source] MarketError),
}

/// What a finished run did.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub run_id: RunId,
    pub completed: usize,
    pub failed: usize,
    pub not_started: usize,
    pub total_cost: f64,
    pub pool: PoolStats,
}

/// Drives one run against a backend and a marketplace.
pub struct BenchmarkRun {
    config: Config,
    backend: Arc<dyn ReputationBackend>,
    market: Arc<dyn Marketplace>,
}

impl BenchmarkRun {
    /// Create a new run.
    pub fn new(
        config: Config,
        backend: Arc<dyn ReputationBackend>,
        market: Arc<dyn Marketplace>,
    ) -> Self {
        Self {
            config,
            backend,
            market,
        }
    }

    /// Run every task and report the results.
    pub async fn execute(&self) -> Result<RunSummary, RunError> {
        self.config.validate()?;

        let run_id = self.backend.start_run().await.map_err(RunError::Start)?;
        info!(
            run_id = %run_id,
            count = self.config.count,
            max_replicas = self.config.max_replicas(),
            suite = ?self.config.suite,
            "Run started"
        );

        let context = Arc::new(RunContext::new(
            run_id.clone(),
            self.config.suite.task_kind(),
        ));

        if self.config.dry_run {
            return self.dry_run(&context).await;
        }

        let pool = Arc::new(ActivityPool::new(
            Arc::clone(&self.market),
            Arc::clone(&context),
            PoolConfig::from_config(&self.config),
        ));

        let mut ledger = None;
        let outcome = self.dispatch(&context, &pool, &mut ledger).await;
        let total_cost = self.finish(&context, &pool, ledger).await;

        let report = outcome?;
        let summary = RunSummary {
            run_id,
            completed: report.completed(),
            failed: report.failed(),
            not_started: report.not_started(),
            total_cost,
            pool: pool.stats().await,
        };
        info!(
            run_id = %summary.run_id,
            completed = summary.completed,
            failed = summary.failed,
            not_started = summary.not_started,
            total_cost = summary.total_cost,
            peak_in_use = summary.pool.peak_in_use,
            "Run finished"
        );
        Ok(summary)
    }

    async fn filter(&self) -> Result<ProviderFilter, RunError> {
        let blacklist = self.backend.blacklist().await.map_err(RunError::Blacklist)?;
        info!(
            providers = blacklist.provider_count(),
            operators = blacklist.operator_count(),
            "Blacklists loaded"
        );

        let filter = ProviderFilter::new(
            blacklist,
            self.config.budget_per_slot(),
            self.config.rent_hours(),
        )
        .with_scope(self.config.scope.clone());

        match &self.config.reputation_url {
            Some(url) => {
                let records = self
                    .backend
                    .provider_records(url)
                    .await
                    .map_err(RunError::Reputation)?;
                let index = ReputationIndex::from_records(records);
                info!(providers = index.len(), "Reputation data loaded");
                Ok(filter.with_reputation(index))
            }
            None => Ok(filter),
        }
    }

    async fn negotiate(&self, context: &RunContext) -> Result<(), RunError> {
        let filter = self.filter().await?;
        info!(
            budget_per_slot = filter.budget_per_slot(),
            rent_hours = self.config.rent_hours(),
            "Negotiating"
        );

        let gate = Arc::new(FilterGate::new(
            Arc::new(filter),
            Arc::clone(&self.backend),
            context.run_id().clone(),
        ));
        let demand =
            Demand::new(self.config.image.clone()).with_resources(self.config.resources);

        let timeout = self.config.init_timeout;
        match tokio::time::timeout(timeout, self.market.negotiate(demand, gate)).await {
            Ok(result) => result.map_err(RunError::Negotiation),
            Err(_) => Err(RunError::Negotiation(MarketError::Timeout(format!(
                "marketplace not ready within {timeout:?}"
            )))),
        }
    }

    async fn dispatch(
        &self,
        context: &Arc<RunContext>,
        pool: &Arc<ActivityPool>,
        ledger: &mut Option<CostLedger>,
    ) -> Result<DispatchReport, RunError> {
        let feed = self
            .market
            .subscribe_payments()
            .await
            .map_err(RunError::Payments)?;
        *ledger = Some(CostLedger::spawn(feed));

        self.negotiate(context).await?;

        pool.start().await;
        let body = Arc::new(StageRunner::new(
            Arc::clone(&self.market),
            StageSuite::from_suite(self.config.suite, self.config.include_network),
        ));
        let dispatcher = TaskDispatcher::new(
            Arc::clone(pool),
            Arc::clone(context),
            self.config.request_timeout,
        );
        Ok(dispatcher.dispatch(self.config.count, body).await)
    }

    /// Release everything and report what the run produced. Returns the
    /// total cost.
    async fn finish(
        &self,
        context: &RunContext,
        pool: &ActivityPool,
        ledger: Option<CostLedger>,
    ) -> f64 {
        pool.drain().await;

        if let Err(e) = self.market.shutdown().await {
            warn!(error = %e, "Marketplace shutdown failed");
        }

        let ledger = match ledger {
            Some(ledger) => ledger.stop().await,
            None => Default::default(),
        };
        let run_id = context.run_id();

        let benchmarks = context.benchmarks().await;
        if !benchmarks.is_empty() {
            if let Err(e) = self.backend.submit_benchmarks(&benchmarks).await {
                error!(run_id = %run_id, records = benchmarks.len(), error = %e, "Failed to submit benchmarks");
            }
        }

        let completions = context.completions().await;
        if !completions.is_empty() {
            if let Err(e) = self.backend.submit_task_statuses(&completions).await {
                error!(run_id = %run_id, statuses = completions.len(), error = %e, "Failed to submit task statuses");
            }
        }

        let updates = ledger.bulk_updates(run_id);
        if !updates.is_empty() {
            if let Err(e) = self.backend.submit_cost_updates(&updates).await {
                error!(run_id = %run_id, updates = updates.len(), error = %e, "Failed to submit cost updates");
            }
        }

        self.end(run_id, ledger.total()).await;
        ledger.total()
    }

    async fn end(&self, run_id: &RunId, total_cost: f64) {
        if let Err(e) = self.backend.end_run(run_id, total_cost).await {
            error!(run_id = %run_id, error = %e, "Failed to end run");
        }
    }

    /// Evaluate and audit offers for a while without renting anything.
    async fn dry_run(&self, context: &RunContext) -> Result<RunSummary, RunError> {
        info!(
            duration_secs = self.config.dry_run_duration.as_secs(),
            "Dry run - offers are evaluated but nothing is rented"
        );

        let outcome = self.negotiate(context).await;
        if outcome.is_ok() {
            tokio::time::sleep(self.config.dry_run_duration).await;
        }
        if let Err(e) = self.market.shutdown().await {
            warn!(error = %e, "Marketplace shutdown failed");
        }
        self.end(context.run_id(), 0.0).await;
        outcome?;

        Ok(RunSummary {
            run_id: context.run_id().clone(),
            completed: 0,
            failed: 0,
            not_started: 0,
            total_cost: 0.0,
            pool: PoolStats::default(),
        })
    }
}
