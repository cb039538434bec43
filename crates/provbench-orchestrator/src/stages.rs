//! Benchmark stage suites run on a rented activity.
//!
//! The CPU suite runs memory, CPU, disk and (optionally) network stages in
//! order. Each stage runs one script, then reads its artifacts back as JSON.
//! The first failing stage ends the suite. The GPU suite probes the card with
//! `nvidia-smi` and runs a burn test.

use std::sync::Arc;

use async_trait::async_trait;
use provbench_core::{BenchmarkKind, BenchmarkRecord, ProviderId};
use provbench_market::{Activity, ExecResult, MarketError, Marketplace};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{error, info};

use crate::config::Suite;
use crate::dispatcher::{TaskBody, TaskError, TaskFailure, TaskOutput};

/// Directory artifacts are written to on the provider.
pub const WORK_DIR: &str = "/golem/work";

/// GPU probe command.
pub const NVIDIA_SMI_QUERY: &str = "nvidia-smi --query-gpu=name,pcie.link.gen.max,memory.total,memory.free,compute_cap --format=csv,noheader,nounits";

/// GPU burn test command.
pub const GPU_BURN: &str = "cd /app && ./gpu_burn 20";

/// Stage errors.
#[derive(Debug, Error)]
pub enum StageError {
    /// The provider reported the error sentinel.
    #[error("{0}")]
    Command(String),

    /// An expected artifact was empty or absent.
    #[error("No performance data for {0}")]
    MissingArtifact(String),

    /// An artifact was not valid JSON.
    #[error("Unparsable performance data for {path}: {reason}")]
    MalformedArtifact { path: String, reason: String },

    /// The GPU probe output could not be parsed.
    #[error("Unparsable GPU info: {0}")]
    GpuInfo(String),

    /// The command did not finish within the execute timeout.
    #[error("Command timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The marketplace could not run the command.
    #[error(transparent)]
    Market(#[from] MarketError),
}

/// One script plus the artifacts it leaves behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    pub kind: BenchmarkKind,
    pub script: String,
    pub artifacts: Vec<String>,
}

impl Stage {
    /// Create a new stage.
    pub fn new(kind: BenchmarkKind, script: impl Into<String>, artifacts: &[&str]) -> Self {
        Self {
            kind,
            script: script.into(),
            artifacts: artifacts.iter().map(|a| a.to_string()).collect(),
        }
    }

    /// Command line for a provider.
    pub fn command(&self, provider_id: &ProviderId) -> String {
        format!("{} {}", self.script, provider_id)
    }
}

/// Command that reads an artifact back.
pub fn artifact_command(path: &str) -> String {
    format!("cat {WORK_DIR}/{path}.json")
}

/// Memory, CPU, disk and optionally network stages.
pub fn cpu_suite(include_network: bool) -> Vec<Stage> {
    let mut stages = vec![
        Stage::new(
            BenchmarkKind::Memory,
            "/benchmark-memory.sh",
            &[
                "sequential_write_single_thread",
                "sequential_read_single_thread",
                "random_write_multi_threaded",
                "random_read_multi_threaded",
                "latency_test_single_thread",
            ],
        ),
        Stage::new(
            BenchmarkKind::Cpu,
            "/benchmark-cpu.sh",
            &["cpu/cpu_single_thread", "cpu/cpu_multi_thread"],
        ),
        Stage::new(
            BenchmarkKind::Disk,
            "/benchmark-disk.sh",
            &[
                "sysbench/random_read",
                "sysbench/random_write",
                "sysbench/sequential_read",
                "sysbench/sequential_write",
                "sysbench/random_read_write",
            ],
        ),
    ];
    if include_network {
        stages.push(Stage::new(
            BenchmarkKind::Network,
            "/download.sh 10",
            &["networkspeedresult"],
        ));
    }
    stages
}

/// GPU as reported by `nvidia-smi`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuInfo {
    pub name: String,
    pub pcie: u32,
    pub memory_total: u64,
    pub memory_free: u64,
    pub cuda_cap: f64,
}

impl GpuInfo {
    /// Parse the first CSV line of the probe output.
    pub fn parse(output: &str) -> Result<Self, StageError> {
        let line = output
            .lines()
            .find(|l| !l.trim().is_empty())
            .ok_or_else(|| StageError::GpuInfo("empty output".to_string()))?;
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        let [name, pcie, total, free, cap] = fields.as_slice() else {
            return Err(StageError::GpuInfo(format!("expected 5 fields in '{line}'")));
        };

        let invalid = |field: &str| StageError::GpuInfo(format!("invalid {field} in '{line}'"));
        Ok(Self {
            name: name.to_string(),
            pcie: pcie.parse().map_err(|_| invalid("pcie"))?,
            memory_total: total.parse().map_err(|_| invalid("memory.total"))?,
            memory_free: free.parse().map_err(|_| invalid("memory.free"))?,
            cuda_cap: cap.parse().map_err(|_| invalid("compute_cap"))?,
        })
    }
}

/// Last `(<n> Gflop/s)` figure of a burn test run.
pub fn parse_gflops(output: &str) -> Option<u64> {
    let pattern = Regex::new(r"\(([0-9]+) Gflop/s\)").ok()?;
    pattern
        .captures_iter(output)
        .filter_map(|c| c.get(1)?.as_str().parse().ok())
        .last()
}

/// Stage suite selected for a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageSuite {
    Cpu(Vec<Stage>),
    Gpu,
}

impl StageSuite {
    /// Suite for the configured hardware class.
    pub fn from_suite(suite: Suite, include_network: bool) -> Self {
        match suite {
            Suite::Cpu => Self::Cpu(cpu_suite(include_network)),
            Suite::Gpu => Self::Gpu,
        }
    }
}

/// Records produced by a suite and the stage that stopped it, if any.
#[derive(Debug, Default)]
pub struct SuiteReport {
    pub records: Vec<BenchmarkRecord>,
    pub failure: Option<(BenchmarkKind, StageError)>,
}

/// Runs a [`StageSuite`] on activities.
pub struct StageRunner {
    market: Arc<dyn Marketplace>,
    suite: StageSuite,
}

impl StageRunner {
    /// Create a new runner.
    pub fn new(market: Arc<dyn Marketplace>, suite: StageSuite) -> Self {
        Self { market, suite }
    }

    async fn exec(&self, activity: &Activity, command: &str) -> Result<ExecResult, StageError> {
        let timeout = activity.execute_timeout;
        tokio::time::timeout(timeout, self.market.run(&activity.id, command))
            .await
            .map_err(|_| StageError::Timeout(timeout))?
            .map_err(StageError::from)
    }

    /// Run one stage. Records are returned only when every artifact parsed.
    pub async fn run_stage(
        &self,
        activity: &Activity,
        stage: &Stage,
    ) -> Result<Vec<BenchmarkRecord>, StageError> {
        let provider_id = activity.provider_id();
        info!(provider_id = %provider_id, stage = %stage.kind, "Running benchmark stage");

        let result = self.exec(activity, &stage.command(provider_id)).await?;
        if result.is_error() {
            let message = result
                .message()
                .map(str::to_owned)
                .unwrap_or_else(|| stage.kind.to_string());
            return Err(StageError::Command(message));
        }

        let mut records = Vec::with_capacity(stage.artifacts.len());
        for path in &stage.artifacts {
            let output = self.exec(activity, &artifact_command(path)).await?;
            let Some(stdout) = output.stdout().filter(|_| !output.is_error()) else {
                return Err(StageError::MissingArtifact(path.clone()));
            };
            let data: Value =
                serde_json::from_str(stdout).map_err(|e| StageError::MalformedArtifact {
                    path: path.clone(),
                    reason: e.to_string(),
                })?;
            records.push(BenchmarkRecord::new(stage.kind, data));
        }
        Ok(records)
    }

    /// Probe the GPU and run the burn test. A failing burn test yields zero
    /// Gflop/s.
    pub async fn run_gpu(&self, activity: &Activity) -> Result<BenchmarkRecord, StageError> {
        let provider_id = activity.provider_id();

        let probe = self.exec(activity, NVIDIA_SMI_QUERY).await?;
        if probe.is_error() {
            return Err(StageError::Command(
                probe.message().unwrap_or("nvidia-smi failed").to_string(),
            ));
        }
        let info = GpuInfo::parse(probe.stdout().unwrap_or_default())?;

        let gflops = match self.exec(activity, GPU_BURN).await {
            Ok(burn) if !burn.is_error() => burn.stdout().and_then(parse_gflops).unwrap_or(0),
            Ok(burn) => {
                error!(provider_id = %provider_id, output = ?burn.message(), "Burn test failed");
                0
            }
            Err(e) => {
                error!(provider_id = %provider_id, error = %e, "Burn test failed");
                0
            }
        };

        info!(
            provider_id = %provider_id,
            gpu = %info.name,
            gflops,
            "Burn test finished"
        );

        Ok(BenchmarkRecord::new(
            BenchmarkKind::Gpu,
            json!({
                "node_id": provider_id.as_str(),
                "name": info.name,
                "pcie": info.pcie,
                "memory_total": info.memory_total,
                "memory_free": info.memory_free,
                "cuda_cap": info.cuda_cap,
                "gpu_burn_gflops": gflops,
            }),
        ))
    }

    /// Run the whole suite, stopping at the first failing stage.
    pub async fn run_suite(&self, activity: &Activity) -> SuiteReport {
        let mut report = SuiteReport::default();
        match &self.suite {
            StageSuite::Cpu(stages) => {
                for stage in stages {
                    match self.run_stage(activity, stage).await {
                        Ok(records) => report.records.extend(records),
                        Err(e) => {
                            info!(
                                provider_id = %activity.provider_id(),
                                stage = %stage.kind,
                                error = %e,
                                "Benchmark stage failed - skipping remaining stages"
                            );
                            report.failure = Some((stage.kind, e));
                            break;
                        }
                    }
                }
            }
            StageSuite::Gpu => match self.run_gpu(activity).await {
                Ok(record) => report.records.push(record),
                Err(e) => report.failure = Some((BenchmarkKind::Gpu, e)),
            },
        }
        report
    }
}

#[async_trait]
impl TaskBody for StageRunner {
    async fn run(&self, activity: Activity) -> TaskOutput {
        let report = self.run_suite(&activity).await;
        match report.failure {
            None => Ok(report.records),
            Some((stage, source)) => Err(TaskFailure {
                error: TaskError::Stage { stage, source },
                records: report.records,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{admit_all, offer};
    use provbench_market::{
        ActivityOptions, Demand, Image, ProviderBehavior, SimGpu, SimulatedMarket,
    };

    async fn activity_on(market: &SimulatedMarket) -> Activity {
        market
            .negotiate(Demand::new(Image::Hash("h".into())), admit_all())
            .await
            .unwrap();
        let proposal = market.proposals().await.unwrap().remove(0);
        let agreement = market.create_agreement(&proposal).await.unwrap();
        market
            .create_activity(&agreement, &ActivityOptions::default())
            .await
            .unwrap()
    }

    fn runner(market: &SimulatedMarket, suite: StageSuite) -> StageRunner {
        StageRunner::new(Arc::new(market.clone()), suite)
    }

    #[tokio::test]
    async fn test_full_cpu_suite_collects_every_artifact() {
        let market = SimulatedMarket::new().with_provider(offer("p1"), ProviderBehavior::default());
        let activity = activity_on(&market).await;

        let report = runner(&market, StageSuite::Cpu(cpu_suite(true)))
            .run_suite(&activity)
            .await;

        assert!(report.failure.is_none());
        assert_eq!(report.records.len(), 5 + 2 + 5 + 1);
        assert_eq!(report.records[0].kind, BenchmarkKind::Memory);
        assert_eq!(report.records[12].kind, BenchmarkKind::Network);

        let commands = market.commands_for(&ProviderId::new("p1")).await;
        assert_eq!(commands[0], "/benchmark-memory.sh p1");
        assert!(commands.contains(&"cat /golem/work/cpu/cpu_single_thread.json".to_string()));
    }

    #[tokio::test]
    async fn test_cpu_failure_skips_disk_and_network() {
        let market = SimulatedMarket::new().with_provider(
            offer("p1"),
            ProviderBehavior::default().failing("/benchmark-cpu.sh"),
        );
        let activity = activity_on(&market).await;

        let report = runner(&market, StageSuite::Cpu(cpu_suite(true)))
            .run_suite(&activity)
            .await;

        let (stage, error) = report.failure.unwrap();
        assert_eq!(stage, BenchmarkKind::Cpu);
        assert!(matches!(error, StageError::Command(_)));
        // Memory records survive.
        assert_eq!(report.records.len(), 5);

        let commands = market.commands_for(&ProviderId::new("p1")).await;
        assert!(!commands.iter().any(|c| c.contains("benchmark-disk")));
        assert!(!commands.iter().any(|c| c.contains("download.sh")));
    }

    #[tokio::test]
    async fn test_missing_and_malformed_artifacts_fail_the_stage() {
        let stages = cpu_suite(false);

        let market = SimulatedMarket::new().with_provider(
            offer("p1"),
            ProviderBehavior::default().missing_artifact("random_read_multi"),
        );
        let activity = activity_on(&market).await;
        let err = runner(&market, StageSuite::Cpu(stages.clone()))
            .run_stage(&activity, &stages[0])
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "No performance data for random_read_multi_threaded"
        );

        let market = SimulatedMarket::new().with_provider(
            offer("p2"),
            ProviderBehavior::default().malformed_artifact("sysbench/random_write"),
        );
        let activity = activity_on(&market).await;
        let err = runner(&market, StageSuite::Cpu(stages.clone()))
            .run_stage(&activity, &stages[2])
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::MalformedArtifact { .. }));
    }

    #[tokio::test]
    async fn test_gpu_suite_reports_burn_result() {
        let gpu = SimGpu {
            name: "NVIDIA GeForce RTX 3090".to_string(),
            pcie: 4,
            memory_total: 24576,
            memory_free: 24000,
            cuda_cap: 8.6,
            gflops: 21000,
        };
        let market = SimulatedMarket::new()
            .with_provider(offer("gpu"), ProviderBehavior::default().with_gpu(gpu));
        let activity = activity_on(&market).await;

        let record = runner(&market, StageSuite::Gpu)
            .run_gpu(&activity)
            .await
            .unwrap();
        assert_eq!(record.kind, BenchmarkKind::Gpu);
        assert_eq!(record.data["gpu_burn_gflops"], 21000);
        assert_eq!(record.data["pcie"], 4);
    }

    #[tokio::test]
    async fn test_failed_burn_test_yields_zero() {
        let gpu = SimGpu {
            name: "A100".to_string(),
            pcie: 4,
            memory_total: 40960,
            memory_free: 40000,
            cuda_cap: 8.0,
            gflops: 1,
        };
        let market = SimulatedMarket::new().with_provider(
            offer("gpu"),
            ProviderBehavior::default().with_gpu(gpu).failing("gpu_burn"),
        );
        let activity = activity_on(&market).await;

        let record = runner(&market, StageSuite::Gpu)
            .run_gpu(&activity)
            .await
            .unwrap();
        assert_eq!(record.data["gpu_burn_gflops"], 0);
    }

    #[tokio::test]
    async fn test_missing_gpu_fails_the_suite() {
        let market = SimulatedMarket::new().with_provider(offer("cpu-only"), ProviderBehavior::default());
        let activity = activity_on(&market).await;

        let report = runner(&market, StageSuite::Gpu).run_suite(&activity).await;
        let (stage, _) = report.failure.unwrap();
        assert_eq!(stage, BenchmarkKind::Gpu);
        assert!(report.records.is_empty());
    }

    #[test]
    fn test_parse_gpu_info_and_gflops() {
        let info = GpuInfo::parse("NVIDIA GeForce RTX 4090, 4, 24564, 24210, 8.9\n").unwrap();
        assert_eq!(info.name, "NVIDIA GeForce RTX 4090");
        assert_eq!(info.pcie, 4);
        assert!(GpuInfo::parse("only, three, fields").is_err());

        let output = "10.0%  proc'd: 1 (100 Gflop/s)\n100.0%  proc'd: 9 (16500 Gflop/s)\n";
        assert_eq!(parse_gflops(output), Some(16500));
        assert_eq!(parse_gflops("no figures"), None);
    }
}
