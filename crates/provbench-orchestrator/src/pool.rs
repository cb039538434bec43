//! Bounded pool of rented activities.
//!
//! The pool turns admitted proposals into agreements and agreements into
//! live activities, never holding more than `max_size` of them at once. Each
//! slot is a semaphore permit owned by the activity occupying it, so a slot
//! is freed exactly when its activity is destroyed.
//!
//! Every activity is validated right before it is lent out. Invalid ones are
//! destroyed and replaced transparently until the acquire timeout expires.
//!
//! Acquisition runs in its own task. A caller that times out only stops
//! waiting: an agreement or activity the task already holds is destroyed
//! once provisioning settles, never left behind.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use provbench_core::{ActivityState, AgreementId, ProviderId};
use provbench_market::{Activity, ActivityOptions, MarketError, Marketplace, Proposal};
use thiserror::Error;
use tokio::sync::{oneshot, Mutex, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::context::RunContext;
use crate::retry::RetryPolicy;

/// Pool errors.
#[derive(Debug, Error)]
pub enum PoolError {
    /// No valid activity could be produced in time.
    #[error("Could not acquire an activity within {0:?}")]
    Timeout(Duration),

    /// A provider was selected but failed to deploy the activity.
    #[error("Provider {provider} failed to deploy the activity: {reason}")]
    Deployment { provider: ProviderId, reason: String },

    /// The pool is shutting down.
    #[error("Pool is draining")]
    Draining,

    /// The acquisition task ended without an answer.
    #[error("Acquisition interrupted")]
    Interrupted,

    /// The marketplace could not list proposals.
    #[error("No agreement available: {0}")]
    Market(#[from] MarketError),
}

impl PoolError {
    /// Provider the failure is attributable to, if any.
    pub fn provider(&self) -> Option<&ProviderId> {
        match self {
            Self::Deployment { provider, .. } => Some(provider),
            _ => None,
        }
    }
}

/// Pool settings.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum concurrently allocated activities.
    pub max_size: usize,
    /// Time `acquire` may block.
    pub acquire_timeout: Duration,
    /// Idle activities older than this are evicted, checked at the same interval.
    pub downscale_interval: Duration,
    /// Interval between proposal checks while waiting for a new provider.
    pub agreement_poll_interval: Duration,
    /// Provisioning and execution timeouts for new activities.
    pub activity: ActivityOptions,
    /// Retry policy for state queries during validation.
    pub validation_retry: RetryPolicy,
    /// Agreements used by earlier runs.
    pub computed_already: HashSet<AgreementId>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl PoolConfig {
    /// Pool settings from the orchestrator configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_size: config.max_replicas(),
            acquire_timeout: config.request_start_timeout,
            downscale_interval: config.downscale_interval,
            agreement_poll_interval: config.agreement_poll_interval,
            activity: ActivityOptions {
                provision_timeout: config.provision_timeout,
                execute_timeout: config.execute_timeout,
            },
            validation_retry: config.validation_retry,
            computed_already: config.computed_already.iter().cloned().collect(),
        }
    }
}

/// Pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Activities lent out.
    pub acquired: usize,
    /// Lent activities destroyed.
    pub destroyed: usize,
    /// Activities provisioned.
    pub created: usize,
    /// Agreements or activities that failed to provision.
    pub provision_failures: usize,
    /// Activities discarded by validation.
    pub validation_failures: usize,
    /// Idle activities evicted or discarded on drain.
    pub evicted: usize,
    /// Activities currently lent out.
    pub in_use: usize,
    /// Highest `in_use` seen.
    pub peak_in_use: usize,
}

struct IdleActivity {
    activity: Activity,
    since: Instant,
    permit: OwnedSemaphorePermit,
}

struct PoolShared {
    market: Arc<dyn Marketplace>,
    context: Arc<RunContext>,
    config: PoolConfig,
    slots: Arc<Semaphore>,
    idle: Mutex<VecDeque<IdleActivity>>,
    returned: Notify,
    stats: Mutex<PoolStats>,
    draining: AtomicBool,
}

impl PoolShared {
    /// Terminate the activity and release its agreement for good. Failures
    /// are logged; the caller frees the slot regardless.
    async fn terminate(&self, activity: &Activity) {
        if let Err(e) = self.market.terminate_activity(&activity.id).await {
            warn!(activity_id = %activity.id, error = %e, "Failed to terminate activity");
        }
        if let Err(e) = self
            .market
            .release_agreement(&activity.agreement.id, false)
            .await
        {
            warn!(agreement_id = %activity.agreement.id, error = %e, "Failed to release agreement");
        }
    }

    async fn validate(&self, activity: &Activity) -> bool {
        if self
            .config
            .computed_already
            .contains(&activity.agreement.id)
        {
            warn!(
                activity_id = %activity.id,
                agreement_id = %activity.agreement.id,
                "Agreement was computed by an earlier run - discarding activity"
            );
            return false;
        }

        let market: &dyn Marketplace = self.market.as_ref();
        let activity_id = &activity.id;
        match self
            .config
            .validation_retry
            .run(move || market.activity_state(activity_id))
            .await
        {
            Ok(state) if state.is_terminated() => {
                debug!(activity_id = %activity.id, "Activity terminated on the provider");
                false
            }
            Ok(_) => true,
            Err(e) => {
                warn!(activity_id = %activity.id, error = %e, "Activity state unavailable - discarding activity");
                false
            }
        }
    }

    async fn discard(&self, activity: &Activity, permit: OwnedSemaphorePermit) {
        self.terminate(activity).await;
        self.stats.lock().await.validation_failures += 1;
        drop(permit);
    }

    fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// First admitted proposal whose provider has neither been used nor
    /// blacklisted in this run.
    async fn next_proposal(&self) -> Result<Proposal, PoolError> {
        loop {
            if self.is_draining() {
                return Err(PoolError::Draining);
            }
            for proposal in self.market.proposals().await? {
                let provider_id = proposal.provider_id();
                if self.context.is_blacklisted(provider_id).await {
                    continue;
                }
                if self.context.claim_provider(provider_id).await {
                    return Ok(proposal);
                }
            }
            tokio::time::sleep(self.config.agreement_poll_interval).await;
        }
    }

    /// Sign an agreement on `proposal` and deploy an activity on it. On
    /// failure the agreement is already released.
    async fn provision(&self, proposal: Proposal) -> Result<Activity, PoolError> {
        let provider = proposal.provider_id().clone();

        let deployment_failed = |reason: String| PoolError::Deployment {
            provider: provider.clone(),
            reason,
        };

        let agreement = match self.market.create_agreement(&proposal).await {
            Ok(agreement) => agreement,
            Err(e) => {
                self.stats.lock().await.provision_failures += 1;
                return Err(deployment_failed(e.to_string()));
            }
        };

        info!(
            provider_id = %provider,
            provider_name = %agreement.provider_name(),
            agreement_id = %agreement.id,
            "Agreement signed"
        );

        let activity = match self.market.accept_payments(&agreement).await {
            Ok(()) => {
                let options = self.config.activity;
                match tokio::time::timeout(
                    options.provision_timeout,
                    self.market.create_activity(&agreement, &options),
                )
                .await
                {
                    Ok(result) => result.map_err(|e| e.to_string()),
                    Err(_) => Err(format!(
                        "activity not ready within {:?}",
                        options.provision_timeout
                    )),
                }
            }
            Err(e) => Err(e.to_string()),
        };

        match activity {
            Ok(activity) => {
                self.stats.lock().await.created += 1;
                Ok(activity)
            }
            Err(reason) => {
                warn!(provider_id = %provider, reason = %reason, "Provider failed to deploy the activity");
                if let Err(e) = self.market.release_agreement(&agreement.id, false).await {
                    warn!(agreement_id = %agreement.id, error = %e, "Failed to release agreement");
                }
                self.stats.lock().await.provision_failures += 1;
                Err(deployment_failed(reason))
            }
        }
    }

    /// Produce a lease and hand it to `reply`. Waits stop as soon as the
    /// caller is gone; a lease nobody takes any more is destroyed.
    async fn acquire_into(
        self: Arc<Self>,
        mut reply: oneshot::Sender<Result<PooledActivity, PoolError>>,
    ) {
        let result = loop {
            let reused = self.idle.lock().await.pop_front();
            if let Some(entry) = reused {
                if self.validate(&entry.activity).await {
                    break Ok(self.lend(entry.activity, entry.permit, ActivityState::Ready).await);
                }
                self.discard(&entry.activity, entry.permit).await;
                continue;
            }

            let permit = tokio::select! {
                permit = Arc::clone(&self.slots).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break Err(PoolError::Draining),
                },
                _ = self.returned.notified() => continue,
                _ = reply.closed() => return,
            };

            if self.is_draining() {
                break Err(PoolError::Draining);
            }

            let proposal = tokio::select! {
                proposal = self.next_proposal() => match proposal {
                    Ok(proposal) => proposal,
                    Err(e) => break Err(e),
                },
                _ = reply.closed() => return,
            };

            // Not cancelled from here on: whatever gets rented is either
            // lent or terminated. The permit is dropped on failure, so a
            // failed deployment never occupies a slot.
            let activity = match self.provision(proposal).await {
                Ok(activity) => activity,
                Err(e) => break Err(e),
            };

            if self.validate(&activity).await {
                break Ok(self.lend(activity, permit, ActivityState::Creating).await);
            }
            self.discard(&activity, permit).await;
        };

        if let Err(Ok(lease)) = reply.send(result) {
            info!(activity_id = %lease.activity.id, "Acquire abandoned by its caller - destroying activity");
            self.destroy(lease).await;
        }
    }

    async fn lend(
        self: &Arc<Self>,
        activity: Activity,
        permit: OwnedSemaphorePermit,
        from: ActivityState,
    ) -> PooledActivity {
        let mut lease = PooledActivity {
            activity,
            state: from,
            permit: Some(permit),
            pool: Arc::clone(self),
        };
        if from == ActivityState::Creating {
            lease.advance(ActivityState::Ready);
        }
        lease.advance(ActivityState::InUse);

        let mut stats = self.stats.lock().await;
        stats.acquired += 1;
        stats.in_use += 1;
        stats.peak_in_use = stats.peak_in_use.max(stats.in_use);
        drop(stats);

        debug!(
            activity_id = %lease.activity.id,
            provider_id = %lease.provider_id(),
            "Activity acquired"
        );
        lease
    }

    async fn destroy(&self, mut lease: PooledActivity) {
        let Some(permit) = lease.permit.take() else {
            return;
        };
        lease.advance(ActivityState::Terminated);
        self.terminate(&lease.activity).await;

        let mut stats = self.stats.lock().await;
        stats.destroyed += 1;
        stats.in_use = stats.in_use.saturating_sub(1);
        drop(stats);
        drop(permit);

        debug!(activity_id = %lease.activity.id, "Activity destroyed");
    }

    async fn evict_idle(&self) {
        let stale: Vec<IdleActivity> = {
            let mut idle = self.idle.lock().await;
            let interval = self.config.downscale_interval;
            let (stale, fresh): (VecDeque<_>, VecDeque<_>) =
                idle.drain(..).partition(|entry| entry.since.elapsed() >= interval);
            *idle = fresh;
            stale.into()
        };

        for entry in stale {
            debug!(activity_id = %entry.activity.id, "Evicting idle activity");
            self.terminate(&entry.activity).await;
            self.stats.lock().await.evicted += 1;
        }
    }
}

/// An activity lent out by the pool.
///
/// Hand it back with [`ActivityPool::destroy`] or [`ActivityPool::release`].
/// A lease dropped without either is destroyed in the background.
pub struct PooledActivity {
    activity: Activity,
    state: ActivityState,
    permit: Option<OwnedSemaphorePermit>,
    pool: Arc<PoolShared>,
}

impl PooledActivity {
    /// The rented activity.
    pub fn activity(&self) -> &Activity {
        &self.activity
    }

    /// Provider hosting the activity.
    pub fn provider_id(&self) -> &ProviderId {
        self.activity.provider_id()
    }

    /// Lifecycle state of the lease.
    pub fn state(&self) -> ActivityState {
        self.state
    }

    fn advance(&mut self, next: ActivityState) {
        match self.state.transition(next) {
            Ok(state) => self.state = state,
            Err(e) => warn!(activity_id = %self.activity.id, error = %e, "Unexpected activity transition"),
        }
    }
}

impl std::fmt::Debug for PooledActivity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledActivity")
            .field("activity", &self.activity)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Drop for PooledActivity {
    fn drop(&mut self) {
        let Some(permit) = self.permit.take() else {
            return;
        };
        let pool = Arc::clone(&self.pool);
        let activity = self.activity.clone();
        warn!(activity_id = %activity.id, "Activity lease dropped - destroying in background");

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                pool.terminate(&activity).await;
                let mut stats = pool.stats.lock().await;
                stats.destroyed += 1;
                stats.in_use = stats.in_use.saturating_sub(1);
                drop(permit);
            });
        }
    }
}

/// Bounded, validated pool of activities for one run.
pub struct ActivityPool {
    shared: Arc<PoolShared>,
    eviction: Mutex<Option<JoinHandle<()>>>,
}

impl ActivityPool {
    /// Create a new pool drawing providers from `market`.
    pub fn new(market: Arc<dyn Marketplace>, context: Arc<RunContext>, config: PoolConfig) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_size));
        Self {
            shared: Arc::new(PoolShared {
                market,
                context,
                config,
                slots,
                idle: Mutex::new(VecDeque::new()),
                returned: Notify::new(),
                stats: Mutex::new(PoolStats::default()),
                draining: AtomicBool::new(false),
            }),
            eviction: Mutex::new(None),
        }
    }

    /// Start evicting idle activities every downscale interval.
    pub async fn start(&self) {
        let shared = Arc::clone(&self.shared);
        let period = shared.config.downscale_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                shared.evict_idle().await;
            }
        });

        if let Some(previous) = self.eviction.lock().await.replace(handle) {
            previous.abort();
        }
        info!(
            max_size = self.shared.config.max_size,
            downscale_interval_secs = period.as_secs(),
            "Activity pool started"
        );
    }

    /// Acquire a validated activity, blocking up to the acquire timeout.
    pub async fn acquire(&self) -> Result<PooledActivity, PoolError> {
        if self.is_draining() {
            return Err(PoolError::Draining);
        }

        let timeout = self.shared.config.acquire_timeout;
        let (reply, answer) = oneshot::channel();
        tokio::spawn(Arc::clone(&self.shared).acquire_into(reply));

        match tokio::time::timeout(timeout, answer).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(PoolError::Interrupted),
            Err(_) => Err(PoolError::Timeout(timeout)),
        }
    }

    /// Terminate the activity, release its agreement for good and free the
    /// slot. Failures are logged; the slot is freed regardless.
    pub async fn destroy(&self, lease: PooledActivity) {
        self.shared.destroy(lease).await;
    }

    /// Return the activity to the pool for reuse by a later acquire.
    pub async fn release(&self, mut lease: PooledActivity) {
        if self.is_draining() {
            self.destroy(lease).await;
            return;
        }
        let Some(permit) = lease.permit.take() else {
            return;
        };
        lease.advance(ActivityState::Ready);

        self.shared.idle.lock().await.push_back(IdleActivity {
            activity: lease.activity.clone(),
            since: Instant::now(),
            permit,
        });
        {
            let mut stats = self.shared.stats.lock().await;
            stats.in_use = stats.in_use.saturating_sub(1);
        }
        self.shared.returned.notify_one();
    }

    /// Validate an activity against the provider and the computed-already set.
    pub async fn validate(&self, activity: &Activity) -> bool {
        self.shared.validate(activity).await
    }

    /// Stop handing out activities, destroy idle ones and wait until every
    /// lent activity has been destroyed.
    pub async fn drain(&self) {
        self.shared.draining.store(true, Ordering::SeqCst);

        if let Some(handle) = self.eviction.lock().await.take() {
            handle.abort();
        }

        let idle: Vec<IdleActivity> = self.shared.idle.lock().await.drain(..).collect();
        for entry in idle {
            self.shared.terminate(&entry.activity).await;
            self.shared.stats.lock().await.evicted += 1;
        }

        let all = u32::try_from(self.shared.config.max_size).unwrap_or(u32::MAX);
        match self.shared.slots.acquire_many(all).await {
            Ok(permits) => drop(permits),
            Err(_) => debug!("Pool slots already closed"),
        }
        self.shared.slots.close();

        let stats = self.stats().await;
        info!(
            acquired = stats.acquired,
            destroyed = stats.destroyed,
            created = stats.created,
            provision_failures = stats.provision_failures,
            validation_failures = stats.validation_failures,
            peak_in_use = stats.peak_in_use,
            "Activity pool drained"
        );
    }

    /// Returns true once `drain` has been called.
    pub fn is_draining(&self) -> bool {
        self.shared.is_draining()
    }

    /// Current counters.
    pub async fn stats(&self) -> PoolStats {
        *self.shared.stats.lock().await
    }
}
