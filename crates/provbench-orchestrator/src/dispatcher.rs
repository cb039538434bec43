//! Task fan-out over the activity pool.
//!
//! Every task acquires one activity, runs a [`TaskBody`] on it and always
//! destroys the activity afterwards. Tasks settle independently: a failure,
//! timeout or panic in one never stops the others.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use provbench_core::{BenchmarkKind, BenchmarkRecord, ProviderId, FULL_SUITE_TASK};
use provbench_market::Activity;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::context::RunContext;
use crate::pool::{ActivityPool, PoolError};
use crate::stages::StageError;

/// Completion message recorded for a provider whose deployment failed.
pub const DEPLOYMENT_FAILED: &str = "Provider failed to deploy the activity";

/// Errors ending a task that held an activity.
#[derive(Debug, Error)]
pub enum TaskError {
    /// A benchmark stage failed.
    #[error("{source}")]
    Stage {
        stage: BenchmarkKind,
        #[source]
        source: StageError,
    },

    /// The task ran past the request timeout.
    #[error("Provider hit the timeout limit")]
    Timeout,

    /// The task body panicked or was cancelled.
    #[error("Task aborted: {0}")]
    Aborted(String),
}

impl TaskError {
    /// Task name the failure is reported under.
    pub fn task_name(&self) -> String {
        match self {
            Self::Stage { stage, .. } => format!("Benchmark {stage}"),
            _ => FULL_SUITE_TASK.to_string(),
        }
    }
}

/// A failed task body with the records it produced before failing.
#[derive(Debug)]
pub struct TaskFailure {
    pub error: TaskError,
    pub records: Vec<BenchmarkRecord>,
}

/// Result of a task body.
pub type TaskOutput = Result<Vec<BenchmarkRecord>, TaskFailure>;

/// Work done on one rented activity.
#[async_trait]
pub trait TaskBody: Send + Sync + 'static {
    async fn run(&self, activity: Activity) -> TaskOutput;
}

/// Why a task never got an activity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireFailure {
    /// Not enough matching offers within the request-start timeout.
    Timeout,
    /// The selected provider failed to deploy the activity.
    Deployment(ProviderId),
    /// Anything else.
    Unclassified,
}

impl AcquireFailure {
    /// Classify a pool error.
    pub fn classify(error: &PoolError) -> Self {
        match error {
            PoolError::Timeout(_) => Self::Timeout,
            PoolError::Deployment { provider, .. } => Self::Deployment(provider.clone()),
            PoolError::Draining | PoolError::Interrupted | PoolError::Market(_) => {
                Self::Unclassified
            }
        }
    }
}

/// Outcome of one task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskResult {
    /// The body succeeded on the provider.
    Completed { provider_id: ProviderId },
    /// The body failed on the provider.
    Failed {
        provider_id: ProviderId,
        error: String,
    },
    /// No activity was acquired.
    NotStarted {
        failure: AcquireFailure,
        error: String,
    },
}

/// Outcomes of every dispatched task.
#[derive(Debug, Clone, Default)]
pub struct DispatchReport {
    pub results: Vec<TaskResult>,
}

impl DispatchReport {
    /// Tasks whose body succeeded.
    pub fn completed(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r, TaskResult::Completed { .. }))
            .count()
    }

    /// Tasks whose body failed.
    pub fn failed(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r, TaskResult::Failed { .. }))
            .count()
    }

    /// Tasks that never acquired an activity.
    pub fn not_started(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r, TaskResult::NotStarted { .. }))
            .count()
    }

    /// Providers of every task that acquired an activity.
    pub fn providers(&self) -> Vec<&ProviderId> {
        self.results
            .iter()
            .filter_map(|r| match r {
                TaskResult::Completed { provider_id } | TaskResult::Failed { provider_id, .. } => {
                    Some(provider_id)
                }
                TaskResult::NotStarted { .. } => None,
            })
            .collect()
    }
}

/// Runs tasks concurrently over a pool.
pub struct TaskDispatcher {
    pool: Arc<ActivityPool>,
    context: Arc<RunContext>,
    task_timeout: Duration,
}

impl TaskDispatcher {
    /// Create a new dispatcher.
    pub fn new(pool: Arc<ActivityPool>, context: Arc<RunContext>, task_timeout: Duration) -> Self {
        Self {
            pool,
            context,
            task_timeout,
        }
    }

    /// Run `num_tasks` tasks and wait until all of them settle.
    pub async fn dispatch(&self, num_tasks: usize, body: Arc<dyn TaskBody>) -> DispatchReport {
        let mut tasks = JoinSet::new();
        for index in 0..num_tasks {
            let pool = Arc::clone(&self.pool);
            let context = Arc::clone(&self.context);
            let body = Arc::clone(&body);
            let timeout = self.task_timeout;
            tasks.spawn(async move { run_task(index, pool, context, body, timeout).await });
        }

        let mut report = DispatchReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => report.results.push(result),
                Err(e) => {
                    error!(error = %e, "Task driver crashed");
                    report.results.push(TaskResult::NotStarted {
                        failure: AcquireFailure::Unclassified,
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            completed = report.completed(),
            failed = report.failed(),
            not_started = report.not_started(),
            "All tasks settled"
        );
        report
    }
}

async fn run_task(
    index: usize,
    pool: Arc<ActivityPool>,
    context: Arc<RunContext>,
    body: Arc<dyn TaskBody>,
    timeout: Duration,
) -> TaskResult {
    let lease = match pool.acquire().await {
        Ok(lease) => lease,
        Err(e) => return not_started(index, &context, e).await,
    };

    let provider_id = lease.provider_id().clone();
    let activity = lease.activity().clone();
    info!(task = index, provider_id = %provider_id, activity_id = %activity.id, "Task started");

    // The body runs in its own task so a panic is contained and a timeout
    // can abort it.
    let handle = tokio::spawn(async move { body.run(activity).await });
    let abort = handle.abort_handle();
    let output = match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => Err(TaskFailure {
            error: TaskError::Aborted(e.to_string()),
            records: Vec::new(),
        }),
        Err(_) => {
            abort.abort();
            Err(TaskFailure {
                error: TaskError::Timeout,
                records: Vec::new(),
            })
        }
    };

    pool.destroy(lease).await;

    match output {
        Ok(records) => {
            context.add_benchmarks(records).await;
            context.record_success(&provider_id).await;
            info!(task = index, provider_id = %provider_id, "Task completed");
            TaskResult::Completed { provider_id }
        }
        Err(failure) => {
            let message = failure.error.to_string();
            warn!(task = index, provider_id = %provider_id, error = %message, "Task failed");
            context.add_benchmarks(failure.records).await;
            context
                .record_failure(&provider_id, &failure.error.task_name(), &message)
                .await;
            TaskResult::Failed {
                provider_id,
                error: message,
            }
        }
    }
}

async fn not_started(index: usize, context: &RunContext, error: PoolError) -> TaskResult {
    let failure = AcquireFailure::classify(&error);
    match &failure {
        AcquireFailure::Timeout => warn!(
            task = index,
            error = %error,
            "Task did not start in time - not enough matching providers?"
        ),
        AcquireFailure::Deployment(provider_id) => {
            warn!(task = index, provider_id = %provider_id, error = %error, "Provider failed to deploy the activity");
            context
                .record_failure(provider_id, FULL_SUITE_TASK, DEPLOYMENT_FAILED)
                .await;
        }
        AcquireFailure::Unclassified => {
            error!(task = index, error = %error, "Task failed to acquire an activity")
        }
    }
    TaskResult::NotStarted {
        failure,
        error: error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolConfig;
    use crate::retry::RetryPolicy;
    use crate::stages::{cpu_suite, StageRunner, StageSuite};
    use crate::testing::{admit_all, offer};
    use provbench_core::{RunId, TaskKind};
    use provbench_market::{
        ActivityOptions, Demand, Image, Marketplace, ProviderBehavior, SimulatedMarket,
    };
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Scripted {
        running: AtomicUsize,
        peak: AtomicUsize,
        work: Duration,
        fail_on: Option<ProviderId>,
        panic_on: Option<ProviderId>,
    }

    impl Scripted {
        fn new(work: Duration) -> Self {
            Self {
                running: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                work,
                fail_on: None,
                panic_on: None,
            }
        }
    }

    #[async_trait]
    impl TaskBody for Scripted {
        async fn run(&self, activity: Activity) -> TaskOutput {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.work).await;
            self.running.fetch_sub(1, Ordering::SeqCst);

            if self.panic_on.as_ref() == Some(activity.provider_id()) {
                panic!("body exploded");
            }
            if self.fail_on.as_ref() == Some(activity.provider_id()) {
                return Err(TaskFailure {
                    error: TaskError::Stage {
                        stage: BenchmarkKind::Cpu,
                        source: StageError::Command("script failed".to_string()),
                    },
                    records: Vec::new(),
                });
            }
            Ok(vec![BenchmarkRecord::new(BenchmarkKind::Cpu, json!({"ok": true}))])
        }
    }

    fn providers(n: usize) -> SimulatedMarket {
        (0..n).fold(SimulatedMarket::new(), |market, i| {
            market.with_provider(offer(&format!("p{i}")), ProviderBehavior::default())
        })
    }

    fn pool_config(max_size: usize, acquire_timeout: Duration) -> PoolConfig {
        PoolConfig {
            max_size,
            acquire_timeout,
            downscale_interval: Duration::from_secs(90),
            agreement_poll_interval: Duration::from_millis(500),
            activity: ActivityOptions::default(),
            validation_retry: RetryPolicy::fixed(5, Duration::from_secs(1)),
            computed_already: HashSet::new(),
        }
    }

    async fn setup(
        market: &SimulatedMarket,
        config: PoolConfig,
        task_timeout: Duration,
    ) -> (TaskDispatcher, Arc<ActivityPool>, Arc<RunContext>) {
        market
            .negotiate(Demand::new(Image::Hash("h".into())), admit_all())
            .await
            .unwrap();
        let context = Arc::new(RunContext::new(RunId::new("1"), TaskKind::Cpu));
        let pool = Arc::new(ActivityPool::new(
            Arc::new(market.clone()),
            Arc::clone(&context),
            config,
        ));
        let dispatcher = TaskDispatcher::new(Arc::clone(&pool), Arc::clone(&context), task_timeout);
        (dispatcher, pool, context)
    }

    #[tokio::test(start_paused = true)]
    async fn test_ten_tasks_never_exceed_three_in_use() {
        let market = providers(10);
        let (dispatcher, pool, context) = setup(
            &market,
            pool_config(3, Duration::from_secs(600)),
            Duration::from_secs(1200),
        )
        .await;
        let body = Arc::new(Scripted::new(Duration::from_secs(30)));

        let report = dispatcher.dispatch(10, body.clone()).await;

        assert_eq!(report.completed(), 10);
        assert!(body.peak.load(Ordering::SeqCst) <= 3);
        let stats = pool.stats().await;
        assert!(stats.peak_in_use <= 3);
        assert_eq!(stats.acquired, stats.destroyed);
        assert!(market.stats().await.peak_live_activities <= 3);

        let providers: HashSet<_> = report.providers().into_iter().collect();
        assert_eq!(providers.len(), 10);
        assert_eq!(context.used_count().await, 10);
        assert_eq!(context.benchmarks().await.len(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_are_isolated_and_blacklisted_for_the_run() {
        let market = providers(3);
        let (dispatcher, pool, context) = setup(
            &market,
            pool_config(3, Duration::from_secs(90)),
            Duration::from_secs(1200),
        )
        .await;
        let mut body = Scripted::new(Duration::from_secs(1));
        body.fail_on = Some(ProviderId::new("p0"));
        body.panic_on = Some(ProviderId::new("p1"));

        let report = dispatcher.dispatch(3, Arc::new(body)).await;

        assert_eq!(report.completed(), 1);
        assert_eq!(report.failed(), 2);
        assert!(context.is_blacklisted(&ProviderId::new("p0")).await);
        assert!(context.is_blacklisted(&ProviderId::new("p1")).await);

        let completions = context.completions().await;
        let p0 = completions
            .iter()
            .find(|c| c.provider_id.as_str() == "p0")
            .unwrap();
        assert_eq!(p0.task_name, "Benchmark cpu");
        assert_eq!(p0.error_message.as_deref(), Some("script failed"));

        let stats = pool.stats().await;
        assert_eq!(stats.acquired, 3);
        assert_eq!(stats.destroyed, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_task_still_releases_its_activity() {
        let market = providers(1);
        let (dispatcher, pool, context) = setup(
            &market,
            pool_config(1, Duration::from_secs(90)),
            Duration::from_secs(60),
        )
        .await;

        let report = dispatcher
            .dispatch(1, Arc::new(Scripted::new(Duration::from_secs(3600))))
            .await;

        assert_eq!(
            report.results[0],
            TaskResult::Failed {
                provider_id: ProviderId::new("p0"),
                error: "Provider hit the timeout limit".to_string(),
            }
        );
        assert_eq!(pool.stats().await.destroyed, 1);
        assert_eq!(market.stats().await.live_activities, 0);
        assert_eq!(context.completions().await[0].task_name, FULL_SUITE_TASK);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquisition_failures_are_classified() {
        let market = SimulatedMarket::new().with_provider(
            offer("broken"),
            ProviderBehavior {
                provisioning_fails: true,
                ..ProviderBehavior::default()
            },
        );
        let (dispatcher, pool, context) = setup(
            &market,
            pool_config(2, Duration::from_secs(90)),
            Duration::from_secs(1200),
        )
        .await;

        let report = dispatcher
            .dispatch(2, Arc::new(Scripted::new(Duration::from_secs(1))))
            .await;

        assert_eq!(report.not_started(), 2);
        let failures: Vec<_> = report
            .results
            .iter()
            .filter_map(|r| match r {
                TaskResult::NotStarted { failure, .. } => Some(failure.clone()),
                _ => None,
            })
            .collect();
        assert!(failures.contains(&AcquireFailure::Deployment(ProviderId::new("broken"))));
        assert!(failures.contains(&AcquireFailure::Timeout));

        let completions = context.completions().await;
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].error_message.as_deref(), Some(DEPLOYMENT_FAILED));
        assert_eq!(pool.stats().await.acquired, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stage_failure_short_circuits_through_dispatcher() {
        let market = SimulatedMarket::new().with_provider(
            offer("p1"),
            ProviderBehavior::default().failing("/benchmark-cpu.sh"),
        );
        let (dispatcher, _pool, context) = setup(
            &market,
            pool_config(1, Duration::from_secs(90)),
            Duration::from_secs(1200),
        )
        .await;
        let runner: Arc<dyn Marketplace> = Arc::new(market.clone());
        let body = Arc::new(StageRunner::new(runner, StageSuite::Cpu(cpu_suite(true))));

        let report = dispatcher.dispatch(1, body).await;

        assert_eq!(report.failed(), 1);
        let commands = market.commands_for(&ProviderId::new("p1")).await;
        assert!(!commands.iter().any(|c| c.contains("benchmark-disk")));
        assert!(!commands.iter().any(|c| c.contains("download.sh")));
        assert_eq!(context.completions().await[0].task_name, "Benchmark cpu");
        // Memory records collected before the failure are kept.
        assert_eq!(context.benchmarks().await.len(), 5);
    }
}
