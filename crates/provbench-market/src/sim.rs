//! In-process marketplace used for dry runs and tests.
//!
//! Every provider is scripted with a [`ProviderBehavior`]: whether it signs
//! agreements, how long it takes to deploy, which commands fail, which
//! artifacts are missing and what it charges. Counters in [`SimStats`] let
//! callers check resource accounting after a run.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use provbench_core::{ActivityId, AgreementId, Offer, PaymentEvent, ProviderId};
use serde_json::json;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

use crate::error::MarketError;
use crate::protocol::{Marketplace, ProposalGate};
use crate::types::{
    Activity, ActivityOptions, Agreement, Demand, ExecResult, Proposal, RemoteState,
};

const PAYMENT_FEED_CAPACITY: usize = 256;

/// GPU a simulated provider reports through `nvidia-smi`.
#[derive(Debug, Clone, PartialEq)]
pub struct SimGpu {
    pub name: String,
    pub pcie: u32,
    pub memory_total: u64,
    pub memory_free: u64,
    pub cuda_cap: f64,
    pub gflops: u64,
}

/// Scripted behaviour of one simulated provider.
#[derive(Debug, Clone, Default)]
pub struct ProviderBehavior {
    /// Refuse to sign agreements.
    pub agreement_fails: bool,
    /// Fail to deploy activities.
    pub provisioning_fails: bool,
    /// Time taken to deploy an activity.
    pub provision_delay: Duration,
    /// Time taken by every command.
    pub command_delay: Duration,
    /// Commands containing any of these substrings report the error sentinel.
    pub failing_commands: Vec<String>,
    /// Artifact paths containing any of these substrings read back empty.
    pub missing_artifacts: Vec<String>,
    /// Artifact paths containing any of these substrings are not valid JSON.
    pub malformed_artifacts: Vec<String>,
    /// Number of state queries that fail before the provider answers.
    pub state_failures: u32,
    /// Activity reports `Terminated` as soon as it is created.
    pub terminated_after_start: bool,
    /// Provider is unreachable when its activity or agreement is closed.
    pub terminate_fails: bool,
    /// Amounts accepted for this provider once its activity is terminated.
    pub payments: Vec<String>,
    /// GPU reported by `nvidia-smi`; without one the command fails.
    pub gpu: Option<SimGpu>,
}

impl ProviderBehavior {
    /// Builder method: commands containing `pattern` fail.
    pub fn failing(mut self, pattern: impl Into<String>) -> Self {
        self.failing_commands.push(pattern.into());
        self
    }

    /// Builder method: artifacts containing `pattern` are missing.
    pub fn missing_artifact(mut self, pattern: impl Into<String>) -> Self {
        self.missing_artifacts.push(pattern.into());
        self
    }

    /// Builder method: artifacts containing `pattern` are malformed.
    pub fn malformed_artifact(mut self, pattern: impl Into<String>) -> Self {
        self.malformed_artifacts.push(pattern.into());
        self
    }

    /// Builder method: add an accepted payment.
    pub fn paying(mut self, amount: impl Into<String>) -> Self {
        self.payments.push(amount.into());
        self
    }

    /// Builder method: set command latency.
    pub fn with_command_delay(mut self, delay: Duration) -> Self {
        self.command_delay = delay;
        self
    }

    /// Builder method: set deployment latency.
    pub fn with_provision_delay(mut self, delay: Duration) -> Self {
        self.provision_delay = delay;
        self
    }

    /// Builder method: attach a GPU.
    pub fn with_gpu(mut self, gpu: SimGpu) -> Self {
        self.gpu = Some(gpu);
        self
    }
}

/// Accounting counters of the simulated market.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimStats {
    pub offers_seen: usize,
    pub offers_admitted: usize,
    pub agreements_created: usize,
    pub agreements_released: usize,
    pub activities_created: usize,
    pub activities_terminated: usize,
    pub provision_failures: usize,
    pub live_activities: usize,
    pub peak_live_activities: usize,
}

struct SimActivity {
    provider_id: ProviderId,
    agreement_id: AgreementId,
    state_failures_left: u32,
    terminated: bool,
    closed: bool,
}

#[derive(Default)]
struct Inner {
    negotiating: bool,
    pending: Vec<Proposal>,
    agreements: HashMap<AgreementId, ProviderId>,
    activities: HashMap<ActivityId, SimActivity>,
    commands: Vec<(ProviderId, String)>,
    stats: SimStats,
    payments_tx: Option<mpsc::Sender<PaymentEvent>>,
    payments_rx: Option<mpsc::Receiver<PaymentEvent>>,
}

/// Marketplace that lives entirely in memory.
#[derive(Clone)]
pub struct SimulatedMarket {
    script: Arc<Vec<(Offer, ProviderBehavior)>>,
    inner: Arc<Mutex<Inner>>,
}

impl Default for SimulatedMarket {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedMarket {
    /// Create an empty market.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(PAYMENT_FEED_CAPACITY);
        let inner = Inner {
            payments_tx: Some(tx),
            payments_rx: Some(rx),
            ..Inner::default()
        };
        Self {
            script: Arc::new(Vec::new()),
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    /// Builder method to add a provider offer with its behaviour.
    pub fn with_provider(mut self, offer: Offer, behavior: ProviderBehavior) -> Self {
        Arc::make_mut(&mut self.script).push((offer, behavior));
        self
    }

    fn behavior(&self, provider_id: &ProviderId) -> ProviderBehavior {
        self.script
            .iter()
            .find(|(offer, _)| &offer.provider_id == provider_id)
            .map(|(_, behavior)| behavior.clone())
            .unwrap_or_default()
    }

    /// Current accounting counters.
    pub async fn stats(&self) -> SimStats {
        self.inner.lock().await.stats
    }

    /// Commands run on a provider, in order.
    pub async fn commands_for(&self, provider_id: &ProviderId) -> Vec<String> {
        self.inner
            .lock()
            .await
            .commands
            .iter()
            .filter(|(p, _)| p == provider_id)
            .map(|(_, c)| c.clone())
            .collect()
    }

    fn artifact_output(provider_id: &ProviderId, path: &str, behavior: &ProviderBehavior) -> String {
        if behavior.missing_artifacts.iter().any(|p| path.contains(p)) {
            return String::new();
        }
        if behavior.malformed_artifacts.iter().any(|p| path.contains(p)) {
            return "{not json".to_string();
        }
        json!({
            "node_id": provider_id.as_str(),
            "artifact": path,
            "value": 1.0,
        })
        .to_string()
    }

    fn command_output(provider_id: &ProviderId, command: &str, behavior: &ProviderBehavior) -> ExecResult {
        if behavior.failing_commands.iter().any(|p| command.contains(p)) {
            return ExecResult::error(format!("simulated failure: {command}"));
        }

        if let Some(path) = command
            .strip_prefix("cat /golem/work/")
            .and_then(|rest| rest.strip_suffix(".json"))
        {
            return ExecResult::ok(Self::artifact_output(provider_id, path, behavior));
        }

        if command.starts_with("nvidia-smi") {
            return match &behavior.gpu {
                Some(gpu) => ExecResult::ok(format!(
                    "{}, {}, {}, {}, {}\n",
                    gpu.name, gpu.pcie, gpu.memory_total, gpu.memory_free, gpu.cuda_cap
                )),
                None => ExecResult::error("nvidia-smi: command not found"),
            };
        }

        if command.contains("gpu_burn") {
            return match &behavior.gpu {
                Some(gpu) => ExecResult::ok(format!(
                    "50.0%  proc'd: 10 ({} Gflop/s)\n100.0%  proc'd: 20 ({} Gflop/s)\nTested 1 GPUs:\n\tGPU 0: OK\n",
                    gpu.gflops / 2,
                    gpu.gflops
                )),
                None => ExecResult::error("gpu_burn: no CUDA device"),
            };
        }

        ExecResult::ok("")
    }
}

#[async_trait]
impl Marketplace for SimulatedMarket {
    async fn negotiate(
        &self,
        _demand: Demand,
        gate: Arc<dyn ProposalGate>,
    ) -> Result<(), MarketError> {
        self.inner.lock().await.negotiating = true;
        let offers: Vec<Offer> = self.script.iter().map(|(offer, _)| offer.clone()).collect();

        info!(offers = offers.len(), "Simulated market negotiating");

        for offer in offers {
            let admitted = gate.admit(&offer).await;

            let mut inner = self.inner.lock().await;
            inner.stats.offers_seen += 1;
            if admitted {
                inner.stats.offers_admitted += 1;
                let id = format!("proposal-{}", inner.stats.offers_seen);
                inner.pending.push(Proposal { id, offer });
            }
        }

        Ok(())
    }

    async fn proposals(&self) -> Result<Vec<Proposal>, MarketError> {
        let inner = self.inner.lock().await;
        if !inner.negotiating {
            return Err(MarketError::NotNegotiating);
        }
        Ok(inner.pending.clone())
    }

    async fn create_agreement(&self, proposal: &Proposal) -> Result<Agreement, MarketError> {
        let mut inner = self.inner.lock().await;
        let provider = proposal.provider_id().clone();

        let Some(index) = inner.pending.iter().position(|p| p.id == proposal.id) else {
            return Err(MarketError::Agreement {
                provider,
                reason: "proposal no longer available".to_string(),
            });
        };
        let proposal = inner.pending.remove(index);

        if self.behavior(&provider).agreement_fails {
            return Err(MarketError::Agreement {
                provider,
                reason: "provider rejected the agreement".to_string(),
            });
        }

        let agreement = Agreement {
            id: AgreementId::generate(),
            offer: proposal.offer,
        };
        inner.agreements.insert(agreement.id.clone(), provider);
        inner.stats.agreements_created += 1;

        debug!(agreement_id = %agreement.id, provider_id = %agreement.provider_id(), "Agreement signed");
        Ok(agreement)
    }

    async fn release_agreement(
        &self,
        agreement_id: &AgreementId,
        allow_reuse: bool,
    ) -> Result<(), MarketError> {
        let mut inner = self.inner.lock().await;
        let provider = inner
            .agreements
            .get(agreement_id)
            .cloned()
            .ok_or_else(|| MarketError::Negotiation(format!("unknown agreement {agreement_id}")))?;
        if self.behavior(&provider).terminate_fails {
            return Err(MarketError::Communication(format!(
                "releasing agreement {agreement_id} timed out"
            )));
        }
        inner.agreements.remove(agreement_id);
        inner.stats.agreements_released += 1;
        debug!(agreement_id = %agreement_id, allow_reuse, "Agreement released");
        Ok(())
    }

    async fn accept_payments(&self, agreement: &Agreement) -> Result<(), MarketError> {
        debug!(agreement_id = %agreement.id, "Accepting payments");
        Ok(())
    }

    async fn create_activity(
        &self,
        agreement: &Agreement,
        options: &ActivityOptions,
    ) -> Result<Activity, MarketError> {
        let provider = agreement.provider_id().clone();
        let behavior = self.behavior(&provider);

        let deploy = tokio::time::sleep(behavior.provision_delay);
        if tokio::time::timeout(options.provision_timeout, deploy)
            .await
            .is_err()
        {
            self.inner.lock().await.stats.provision_failures += 1;
            return Err(MarketError::Timeout(format!(
                "deploying activity on {provider}"
            )));
        }

        let mut inner = self.inner.lock().await;
        if behavior.provisioning_fails {
            inner.stats.provision_failures += 1;
            return Err(MarketError::Provisioning {
                provider,
                reason: "image deployment failed".to_string(),
            });
        }

        let activity = Activity {
            id: ActivityId::generate(),
            agreement: agreement.clone(),
            execute_timeout: options.execute_timeout,
        };
        inner.activities.insert(
            activity.id.clone(),
            SimActivity {
                provider_id: provider,
                agreement_id: agreement.id.clone(),
                state_failures_left: behavior.state_failures,
                terminated: behavior.terminated_after_start,
                closed: false,
            },
        );
        inner.stats.activities_created += 1;
        inner.stats.live_activities += 1;
        inner.stats.peak_live_activities = inner
            .stats
            .peak_live_activities
            .max(inner.stats.live_activities);

        Ok(activity)
    }

    async fn run(&self, activity_id: &ActivityId, command: &str) -> Result<ExecResult, MarketError> {
        let (provider_id, behavior) = {
            let mut inner = self.inner.lock().await;
            let activity = inner
                .activities
                .get(activity_id)
                .ok_or_else(|| MarketError::ActivityNotFound(activity_id.clone()))?;
            if activity.terminated {
                return Err(MarketError::Exec {
                    activity: activity_id.clone(),
                    reason: "activity terminated".to_string(),
                });
            }
            let provider_id = activity.provider_id.clone();
            let behavior = self.behavior(&provider_id);
            inner.commands.push((provider_id.clone(), command.to_string()));
            (provider_id, behavior)
        };

        tokio::time::sleep(behavior.command_delay).await;

        Ok(Self::command_output(&provider_id, command, &behavior))
    }

    async fn activity_state(&self, activity_id: &ActivityId) -> Result<RemoteState, MarketError> {
        let mut inner = self.inner.lock().await;
        let activity = inner
            .activities
            .get_mut(activity_id)
            .ok_or_else(|| MarketError::ActivityNotFound(activity_id.clone()))?;

        if activity.state_failures_left > 0 {
            activity.state_failures_left -= 1;
            return Err(MarketError::Communication(
                "state query timed out".to_string(),
            ));
        }

        Ok(if activity.terminated {
            RemoteState::Terminated
        } else {
            RemoteState::Ready
        })
    }

    async fn terminate_activity(&self, activity_id: &ActivityId) -> Result<(), MarketError> {
        let (sender, events) = {
            let mut inner = self.inner.lock().await;
            let activity = inner
                .activities
                .get_mut(activity_id)
                .ok_or_else(|| MarketError::ActivityNotFound(activity_id.clone()))?;

            // A provider-side termination still leaves our side to close.
            if activity.closed {
                return Ok(());
            }
            if self.behavior(&activity.provider_id).terminate_fails {
                return Err(MarketError::Communication(format!(
                    "terminating activity {activity_id} timed out"
                )));
            }
            activity.terminated = true;
            activity.closed = true;

            let provider_id = activity.provider_id.clone();
            debug!(activity_id = %activity_id, agreement_id = %activity.agreement_id, "Activity terminated");

            inner.stats.activities_terminated += 1;
            inner.stats.live_activities = inner.stats.live_activities.saturating_sub(1);

            let events: Vec<PaymentEvent> = self
                .behavior(&provider_id)
                .payments
                .into_iter()
                .map(|amount| PaymentEvent::new(provider_id.clone(), amount))
                .collect();
            (inner.payments_tx.clone(), events)
        };

        if let Some(tx) = sender {
            for event in events {
                if tx.send(event).await.is_err() {
                    debug!("Payment feed closed - dropping payment event");
                }
            }
        }

        Ok(())
    }

    async fn subscribe_payments(&self) -> Result<mpsc::Receiver<PaymentEvent>, MarketError> {
        self.inner
            .lock()
            .await
            .payments_rx
            .take()
            .ok_or(MarketError::AlreadySubscribed)
    }

    async fn shutdown(&self) -> Result<(), MarketError> {
        let mut inner = self.inner.lock().await;
        inner.negotiating = false;
        inner.pending.clear();
        inner.payments_tx = None;
        info!(stats = ?inner.stats, "Simulated market shut down");
        Ok(())
    }
}
