//! Wire payloads exchanged with the reporting backend.

use provbench_core::{BenchmarkRecord, CostUpdate, ProviderId, RunId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Name the backend stores for every run.
pub const RUN_NAME: &str = "benchmark suite";

/// Body of `POST /v1/task/start`.
#[derive(Debug, Clone, Serialize)]
pub struct StartRunRequest<'a> {
    pub name: &'a str,
}

/// Response of `POST /v1/task/start`. The backend uses integer ids.
#[derive(Debug, Clone, Deserialize)]
pub struct StartRunResponse {
    pub id: Value,
}

impl StartRunResponse {
    /// The run id as a string, whether the backend sent a number or a string.
    pub fn run_id(&self) -> Option<RunId> {
        match &self.id {
            Value::Number(n) => Some(RunId::new(n.to_string())),
            Value::String(s) if !s.is_empty() => Some(RunId::new(s.clone())),
            _ => None,
        }
    }
}

/// Audit record of one offer evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfferReport {
    /// Provider that published the offer.
    #[serde(rename = "node_id")]
    pub provider_id: ProviderId,

    /// Raw offer properties.
    pub offer: Value,

    /// Run the offer was evaluated in.
    #[serde(rename = "task_id", with = "provbench_core::ids::numeric_run_id")]
    pub run_id: RunId,

    /// Filter decision.
    pub accepted: bool,

    /// Why the offer was accepted or rejected.
    pub reason: String,
}

/// Body of `POST /v1/benchmark/bulk`.
#[derive(Debug, Clone, Serialize)]
pub struct BenchmarkBatch<'a> {
    pub benchmarks: &'a [BenchmarkRecord],
}

/// Body of `POST /v1/tasks/update-costs`.
#[derive(Debug, Clone, Serialize)]
pub struct CostBatch<'a> {
    pub updates: &'a [CostUpdate],
}
