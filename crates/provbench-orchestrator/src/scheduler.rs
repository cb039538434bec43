//! Daily run scheduling.
//!
//! A run happens at most once per UTC day. The date of the last successful
//! run is kept in a [`LastRunStore`] so restarts do not run twice.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Days, NaiveDate, NaiveTime, Utc};
use rand::Rng;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::store::{LastRunStore, StoreError};

/// Runs never start later than this before the end of their day.
pub const END_OF_DAY_MARGIN: Duration = Duration::from_secs(30 * 60);

/// Format of the stored last-run date.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Scheduler errors.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Last-run store failed: {0}")]
    Store(#[from] StoreError),
}

/// Next time of day `at` strictly after `now`.
pub fn next_trigger(now: DateTime<Utc>, at: NaiveTime) -> DateTime<Utc> {
    let today = now.date_naive().and_time(at).and_utc();
    if today > now {
        return today;
    }
    now.date_naive()
        .checked_add_days(Days::new(1))
        .map(|day| day.and_time(at).and_utc())
        .unwrap_or(today)
}

/// Largest start delay after `trigger` that still leaves the end-of-day
/// margin. Zero if the trigger is already inside the margin.
pub fn max_delay(trigger: DateTime<Utc>) -> Duration {
    let Some(end_of_day) = trigger
        .date_naive()
        .checked_add_days(Days::new(1))
        .map(|day| day.and_time(NaiveTime::MIN).and_utc())
    else {
        return Duration::ZERO;
    };
    (end_of_day - trigger)
        .to_std()
        .map(|left| left.saturating_sub(END_OF_DAY_MARGIN))
        .unwrap_or(Duration::ZERO)
}

/// Runs a job once per day.
pub struct DailyScheduler {
    store: Arc<dyn LastRunStore>,
    key: String,
    at: NaiveTime,
    debug: bool,
}

impl DailyScheduler {
    /// Create a new scheduler.
    pub fn new(store: Arc<dyn LastRunStore>, key: impl Into<String>, at: NaiveTime) -> Self {
        Self {
            store,
            key: key.into(),
            at,
            debug: false,
        }
    }

    /// Scheduler for the configured key and time.
    pub fn from_config(store: Arc<dyn LastRunStore>, config: &Config) -> Self {
        Self::new(store, config.store_key.clone(), config.cron_time).with_debug(config.debug)
    }

    /// In debug mode the last-run date is ignored and no delay is added.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Returns true if a successful run was recorded for `today`.
    pub async fn ran_on(&self, today: NaiveDate) -> Result<bool, SchedulerError> {
        let last = self.store.get(&self.key).await?;
        Ok(last.as_deref() == Some(today.format(DATE_FORMAT).to_string().as_str()))
    }

    /// Random delay after `trigger`, bounded by [`max_delay`].
    pub fn start_delay(&self, trigger: DateTime<Utc>) -> Duration {
        if self.debug {
            return Duration::ZERO;
        }
        let bound = max_delay(trigger).as_secs();
        Duration::from_secs(rand::thread_rng().gen_range(0..=bound))
    }

    /// Run the job and record today's date if it succeeds. Returns true on
    /// success.
    pub async fn run_once<F, Fut, T, E>(&self, job: F) -> bool
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let started = Utc::now().date_naive();
        match job().await {
            Ok(_) => {
                let date = started.format(DATE_FORMAT).to_string();
                if let Err(e) = self.store.set(&self.key, &date).await {
                    error!(key = %self.key, error = %e, "Failed to store last run date");
                }
                info!(date = %date, "Scheduled run finished");
                true
            }
            Err(e) => {
                error!(error = %e, "Scheduled run failed");
                false
            }
        }
    }

    /// Run now unless today's run already happened, then once per day
    /// forever.
    pub async fn run<F, Fut, T, E>(&self, mut job: F) -> Result<(), SchedulerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let today = Utc::now().date_naive();
        if !self.debug && self.ran_on(today).await? {
            info!(key = %self.key, "Already ran today - waiting for the next trigger");
        } else {
            self.run_once(&mut job).await;
        }

        loop {
            let now = Utc::now();
            let trigger = next_trigger(now, self.at);
            let delay = self.start_delay(trigger);
            let wait = (trigger - now).to_std().unwrap_or(Duration::ZERO) + delay;
            info!(
                trigger = %trigger,
                delay_secs = delay.as_secs(),
                "Next run scheduled"
            );
            tokio::time::sleep(wait).await;

            if !self.debug && self.ran_on(Utc::now().date_naive()).await? {
                warn!(key = %self.key, "Run already recorded for today - skipping");
                continue;
            }
            self.run_once(&mut job).await;
        }
    }
}
