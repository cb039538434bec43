//! Test doubles shared by the orchestrator's unit tests.

use std::sync::Arc;

use async_trait::async_trait;
use provbench_backend::{BackendError, OfferReport, ReputationBackend};
use provbench_core::{
    BenchmarkRecord, CostUpdate, Offer, Pricing, ProviderId, ProviderRecord, RunId,
    TaskCompletion,
};
use provbench_market::ProposalGate;
use tokio::sync::Mutex;

/// Gate admitting every offer.
pub fn admit_all() -> Arc<dyn ProposalGate> {
    struct AdmitAll;

    #[async_trait]
    impl ProposalGate for AdmitAll {
        async fn admit(&self, _offer: &Offer) -> bool {
            true
        }
    }

    Arc::new(AdmitAll)
}

/// A cheap four-thread offer with no start price.
pub fn offer(provider: &str) -> Offer {
    Offer::new(ProviderId::new(provider), Pricing::new(0.0, 0.01, 0.01), 4)
}

#[derive(Debug, Default)]
struct Recorded {
    offers: Vec<OfferReport>,
    statuses: Vec<TaskCompletion>,
    benchmarks: Vec<BenchmarkRecord>,
    costs: Vec<CostUpdate>,
    ended: Option<(RunId, f64)>,
}

/// In-memory backend recording every submission.
#[derive(Debug, Default)]
pub struct RecordingBackend {
    fail_start: bool,
    fail_blacklist: bool,
    fail_offers: bool,
    fail_reports: bool,
    blacklisted_providers: Vec<String>,
    blacklisted_operators: Vec<String>,
    reputation: Vec<ProviderRecord>,
    recorded: Mutex<Recorded>,
}

fn unavailable(what: &str) -> BackendError {
    BackendError::Connection(format!("{what} unavailable"))
}

impl RecordingBackend {
    pub fn failing_start(mut self) -> Self {
        self.fail_start = true;
        self
    }

    pub fn failing_blacklist(mut self) -> Self {
        self.fail_blacklist = true;
        self
    }

    pub fn failing_offers(mut self) -> Self {
        self.fail_offers = true;
        self
    }

    /// Every bulk submission fails after being recorded.
    pub fn failing_reports(mut self) -> Self {
        self.fail_reports = true;
        self
    }

    pub fn with_blacklisted_provider(mut self, provider: &str) -> Self {
        self.blacklisted_providers.push(provider.to_string());
        self
    }

    pub fn with_reputation(mut self, records: Vec<ProviderRecord>) -> Self {
        self.reputation = records;
        self
    }

    pub async fn offers(&self) -> Vec<OfferReport> {
        self.recorded.lock().await.offers.clone()
    }

    pub async fn statuses(&self) -> Vec<TaskCompletion> {
        self.recorded.lock().await.statuses.clone()
    }

    pub async fn benchmarks(&self) -> Vec<BenchmarkRecord> {
        self.recorded.lock().await.benchmarks.clone()
    }

    pub async fn costs(&self) -> Vec<CostUpdate> {
        self.recorded.lock().await.costs.clone()
    }

    pub async fn ended(&self) -> Option<(RunId, f64)> {
        self.recorded.lock().await.ended.clone()
    }

    fn report_result(&self) -> Result<(), BackendError> {
        if self.fail_reports {
            Err(unavailable("backend"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ReputationBackend for RecordingBackend {
    async fn start_run(&self) -> Result<RunId, BackendError> {
        if self.fail_start {
            return Err(unavailable("run start"));
        }
        Ok(RunId::new("42"))
    }

    async fn end_run(&self, run_id: &RunId, total_cost: f64) -> Result<(), BackendError> {
        self.recorded.lock().await.ended = Some((run_id.clone(), total_cost));
        self.report_result()
    }

    async fn submit_offer(&self, report: &OfferReport) -> Result<(), BackendError> {
        self.recorded.lock().await.offers.push(report.clone());
        if self.fail_offers {
            return Err(unavailable("offer audit"));
        }
        Ok(())
    }

    async fn submit_task_statuses(
        &self,
        completions: &[TaskCompletion],
    ) -> Result<(), BackendError> {
        self.recorded
            .lock()
            .await
            .statuses
            .extend_from_slice(completions);
        self.report_result()
    }

    async fn submit_benchmarks(&self, records: &[BenchmarkRecord]) -> Result<(), BackendError> {
        self.recorded
            .lock()
            .await
            .benchmarks
            .extend_from_slice(records);
        self.report_result()
    }

    async fn submit_cost_updates(&self, updates: &[CostUpdate]) -> Result<(), BackendError> {
        self.recorded.lock().await.costs.extend_from_slice(updates);
        self.report_result()
    }

    async fn blacklisted_providers(&self) -> Result<Vec<String>, BackendError> {
        if self.fail_blacklist {
            return Err(unavailable("blacklist"));
        }
        Ok(self.blacklisted_providers.clone())
    }

    async fn blacklisted_operators(&self) -> Result<Vec<String>, BackendError> {
        if self.fail_blacklist {
            return Err(unavailable("blacklist"));
        }
        Ok(self.blacklisted_operators.clone())
    }

    async fn provider_records(&self, _url: &str) -> Result<Vec<ProviderRecord>, BackendError> {
        Ok(self.reputation.clone())
    }
}
