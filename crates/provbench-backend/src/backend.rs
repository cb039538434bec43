//! The reporting collaborator, as seen by the orchestrator.

use async_trait::async_trait;
use provbench_core::{
    Blacklist, BenchmarkRecord, CostUpdate, ProviderId, ProviderRecord, RunId, TaskCompletion,
};

use crate::error::BackendError;
use crate::payload::OfferReport;

/// Stores runs, offer audits, task statuses, benchmarks and costs, and
/// publishes the persisted blacklists.
#[async_trait]
pub trait ReputationBackend: Send + Sync {
    /// Start a run and return its id.
    async fn start_run(&self) -> Result<RunId, BackendError>;

    /// Close a run with its total cost.
    async fn end_run(&self, run_id: &RunId, total_cost: f64) -> Result<(), BackendError>;

    /// Record one offer evaluation.
    async fn submit_offer(&self, report: &OfferReport) -> Result<(), BackendError>;

    /// Submit task completion statuses in bulk.
    async fn submit_task_statuses(&self, completions: &[TaskCompletion])
        -> Result<(), BackendError>;

    /// Submit benchmark records in bulk.
    async fn submit_benchmarks(&self, records: &[BenchmarkRecord]) -> Result<(), BackendError>;

    /// Submit per-provider costs in bulk.
    async fn submit_cost_updates(&self, updates: &[CostUpdate]) -> Result<(), BackendError>;

    /// Persisted provider blacklist.
    async fn blacklisted_providers(&self) -> Result<Vec<String>, BackendError>;

    /// Persisted operator wallet blacklist.
    async fn blacklisted_operators(&self) -> Result<Vec<String>, BackendError>;

    /// Reputation snapshot published at `url`.
    async fn provider_records(&self, url: &str) -> Result<Vec<ProviderRecord>, BackendError>;

    /// Fetch both blacklists.
    async fn blacklist(&self) -> Result<Blacklist, BackendError> {
        let providers = self.blacklisted_providers().await?;
        let operators = self.blacklisted_operators().await?;
        Ok(Blacklist::new(
            providers.into_iter().map(ProviderId::new),
            operators,
        ))
    }
}
