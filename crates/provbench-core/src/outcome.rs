//! Records a run produces: task completions, benchmark payloads and costs.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ProviderId, RunId};

/// Task name reported for a provider that passed (or timed out in) the suite.
pub const FULL_SUITE_TASK: &str = "Full benchmark suite";

/// Hardware class a run benchmarks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskKind {
    #[default]
    Cpu,
    Gpu,
}

/// Type tag of a benchmark record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BenchmarkKind {
    Memory,
    Cpu,
    Disk,
    Network,
    Gpu,
}

impl BenchmarkKind {
    /// Lowercase name used in logs and task names.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Cpu => "cpu",
            Self::Disk => "disk",
            Self::Network => "network",
            Self::Gpu => "gpu",
        }
    }
}

impl std::fmt::Display for BenchmarkKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed benchmark artifact, buffered until the end of the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkRecord {
    /// Which stage produced the record.
    #[serde(rename = "type")]
    pub kind: BenchmarkKind,

    /// Artifact payload as produced on the provider.
    pub data: Value,
}

impl BenchmarkRecord {
    /// Create a new record.
    pub fn new(kind: BenchmarkKind, data: Value) -> Self {
        Self { kind, data }
    }
}

/// Completion status of one task on one provider, as reported to the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskCompletion {
    /// Provider the task ran on.
    #[serde(rename = "node_id")]
    pub provider_id: ProviderId,

    /// Stage or suite name.
    pub task_name: String,

    /// Whether the task succeeded.
    #[serde(rename = "is_successful")]
    pub success: bool,

    /// Error message if the task failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    /// Run this completion belongs to.
    #[serde(rename = "task_id", with = "crate::ids::numeric_run_id")]
    pub run_id: RunId,

    /// Hardware class of the run.
    #[serde(rename = "type")]
    pub kind: TaskKind,
}

impl TaskCompletion {
    /// A successful completion.
    pub fn success(
        run_id: RunId,
        provider_id: ProviderId,
        task_name: impl Into<String>,
        kind: TaskKind,
    ) -> Self {
        Self {
            provider_id,
            task_name: task_name.into(),
            success: true,
            error_message: None,
            run_id,
            kind,
        }
    }

    /// A failed completion.
    pub fn failure(
        run_id: RunId,
        provider_id: ProviderId,
        task_name: impl Into<String>,
        error: impl Into<String>,
        kind: TaskKind,
    ) -> Self {
        Self {
            provider_id,
            task_name: task_name.into(),
            success: false,
            error_message: Some(error.into()),
            run_id,
            kind,
        }
    }
}

/// Final cost of one provider in one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostUpdate {
    /// Run the cost belongs to.
    #[serde(rename = "task_id", with = "crate::ids::numeric_run_id")]
    pub run_id: RunId,

    /// Provider that was paid.
    pub provider_id: ProviderId,

    /// Amount paid, in GLM.
    pub cost: f64,
}
