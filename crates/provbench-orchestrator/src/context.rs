//! Per-run shared state.

use std::collections::HashSet;

use provbench_core::{
    BenchmarkRecord, ProviderId, RunId, TaskCompletion, TaskKind, FULL_SUITE_TASK,
};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// State shared by every task of one run.
///
/// Holds the providers already rented, the providers blacklisted for the
/// rest of the run, and the completions and benchmark records buffered for
/// the final report. Every check-then-add happens under one lock.
#[derive(Debug)]
pub struct RunContext {
    run_id: RunId,
    kind: TaskKind,
    used_providers: Mutex<HashSet<ProviderId>>,
    run_blacklist: Mutex<HashSet<ProviderId>>,
    completions: Mutex<Vec<TaskCompletion>>,
    benchmarks: Mutex<Vec<BenchmarkRecord>>,
}

impl RunContext {
    /// Create a new context for a run.
    pub fn new(run_id: RunId, kind: TaskKind) -> Self {
        Self {
            run_id,
            kind,
            used_providers: Mutex::new(HashSet::new()),
            run_blacklist: Mutex::new(HashSet::new()),
            completions: Mutex::new(Vec::new()),
            benchmarks: Mutex::new(Vec::new()),
        }
    }

    /// Run id assigned by the backend.
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Hardware class benchmarked in this run.
    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    /// Mark a provider as used. Returns false if it was already used.
    pub async fn claim_provider(&self, provider_id: &ProviderId) -> bool {
        let claimed = self.used_providers.lock().await.insert(provider_id.clone());
        if claimed {
            debug!(provider_id = %provider_id, "Provider claimed");
        }
        claimed
    }

    /// Returns true if the provider has been used in this run.
    pub async fn is_used(&self, provider_id: &ProviderId) -> bool {
        self.used_providers.lock().await.contains(provider_id)
    }

    /// Number of providers used so far.
    pub async fn used_count(&self) -> usize {
        self.used_providers.lock().await.len()
    }

    /// Returns true if the provider failed earlier in this run.
    pub async fn is_blacklisted(&self, provider_id: &ProviderId) -> bool {
        self.run_blacklist.lock().await.contains(provider_id)
    }

    /// Record a successful suite. Ignored for providers blacklisted in this
    /// run. Returns true if a completion was recorded.
    pub async fn record_success(&self, provider_id: &ProviderId) -> bool {
        // Lock order: blacklist, then completions.
        let blacklist = self.run_blacklist.lock().await;
        if blacklist.contains(provider_id) {
            return false;
        }
        self.completions.lock().await.push(TaskCompletion::success(
            self.run_id.clone(),
            provider_id.clone(),
            FULL_SUITE_TASK,
            self.kind,
        ));
        true
    }

    /// Blacklist the provider for the rest of the run and record the
    /// failure. A provider already blacklisted gets no second completion.
    /// Returns true if a completion was recorded.
    pub async fn record_failure(
        &self,
        provider_id: &ProviderId,
        task_name: &str,
        error: &str,
    ) -> bool {
        let mut blacklist = self.run_blacklist.lock().await;
        if !blacklist.insert(provider_id.clone()) {
            info!(provider_id = %provider_id, "Provider already blacklisted for this run - not recording failure");
            return false;
        }
        self.completions.lock().await.push(TaskCompletion::failure(
            self.run_id.clone(),
            provider_id.clone(),
            task_name,
            error,
            self.kind,
        ));
        true
    }

    /// Buffer benchmark records for the final report.
    pub async fn add_benchmarks(&self, records: Vec<BenchmarkRecord>) {
        if !records.is_empty() {
            self.benchmarks.lock().await.extend(records);
        }
    }

    /// Completions recorded so far.
    pub async fn completions(&self) -> Vec<TaskCompletion> {
        self.completions.lock().await.clone()
    }

    /// Benchmark records buffered so far.
    pub async fn benchmarks(&self) -> Vec<BenchmarkRecord> {
        self.benchmarks.lock().await.clone()
    }
}
