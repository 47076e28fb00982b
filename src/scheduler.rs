//! Per-subscriber poll scheduler.
//!
//! Every subscriber gets one named repeating timer. Replacing or cancelling a
//! timer stops its future ticks; a cycle already started by the old timer
//! runs to completion.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, TimeDelta, Utc};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::poll::{CycleReport, Poller};
use crate::state::validate_interval;
use crate::{RelayError, Result};

/// A scheduled subscriber timer.
struct Timer {
    interval_minutes: u64,
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Timer {
    fn stop(self) {
        self.cancel.cancel();
        drop(self.handle);
    }

    // interval_minutes is bounded by validate_interval
    fn next_tick(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let period = self.interval_minutes as i64 * 60;
        let elapsed = (now - self.started_at).num_seconds().max(0);
        let ticks = elapsed / period + 1;
        self.started_at + TimeDelta::seconds(period * ticks)
    }
}

/// Public view of a timer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerInfo {
    /// Subscriber the timer polls.
    pub subscriber: String,
    /// Interval in minutes.
    pub interval_minutes: u64,
    /// When the timer fires next.
    pub next_tick: DateTime<Utc>,
}

/// Result of a manual trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerReport {
    /// What the cycle did.
    pub cycle: CycleReport,
    /// Next regular tick.
    pub next_tick: DateTime<Utc>,
    /// Current interval in minutes.
    pub interval_minutes: u64,
}

/// Owns the subscriber timers.
pub struct Scheduler {
    poller: Arc<Poller>,
    default_interval: u64,
    timers: Mutex<HashMap<String, Timer>>,
}

impl Scheduler {
    /// Create a scheduler. `default_interval` applies to subscribers
    /// without their own setting.
    pub fn new(poller: Arc<Poller>, default_interval: u64) -> Self {
        Self {
            poller,
            default_interval,
            timers: Mutex::new(HashMap::new()),
        }
    }

    /// Poller driven by this scheduler.
    pub fn poller(&self) -> &Arc<Poller> {
        &self.poller
    }

    /// Interval applied to subscribers without a setting.
    pub fn default_interval(&self) -> u64 {
        self.default_interval
    }

    fn timers(&self) -> MutexGuard<'_, HashMap<String, Timer>> {
        self.timers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start (or restart) the timer of `subscriber`.
    ///
    /// Any existing timer under the same name is cancelled first. Intervals
    /// outside 1 minute to 1 week are rejected.
    /// Must be called from within a tokio runtime.
    pub fn schedule(&self, subscriber: &str, interval_minutes: u64) -> Result<()> {
        validate_interval(interval_minutes)?;

        let cancel = CancellationToken::new();
        let period = Duration::from_secs(interval_minutes * 60);
        let handle = tokio::spawn(run_timer(
            Arc::clone(&self.poller),
            subscriber.to_string(),
            period,
            cancel.clone(),
        ));

        let timer = Timer {
            interval_minutes,
            started_at: Utc::now(),
            cancel,
            handle,
        };

        if let Some(old) = self.timers().insert(subscriber.to_string(), timer) {
            debug!("Replaced timer for {} ({} min)", subscriber, old.interval_minutes);
            old.stop();
        }

        info!(
            "Scheduled {} every {} minute(s)",
            subscriber, interval_minutes
        );
        Ok(())
    }

    /// Schedule every known subscriber with its configured interval.
    pub async fn schedule_all(&self) -> Result<usize> {
        let plan: Vec<(String, u64)> = {
            let state = self.poller.shared().lock().await;
            state
                .subscriber_ids()
                .into_iter()
                .map(|id| {
                    let minutes = state.interval_for(&id, self.default_interval);
                    (id, minutes)
                })
                .collect()
        };

        for (subscriber, minutes) in &plan {
            self.schedule(subscriber, *minutes)?;
        }
        Ok(plan.len())
    }

    /// Validate and store a new interval, then replace the timer.
    pub async fn reschedule(&self, subscriber: &str, interval_minutes: u64) -> Result<()> {
        validate_interval(interval_minutes)?;

        self.poller
            .shared()
            .update(|state| state.set_interval(subscriber, interval_minutes))
            .await?;

        self.schedule(subscriber, interval_minutes)
    }

    /// Run one cycle for `subscriber` now.
    ///
    /// The regular timer keeps its schedule; a subscriber without a timer
    /// gets one with its configured interval.
    pub async fn trigger_now(&self, subscriber: &str) -> Result<TriggerReport> {
        info!("Manual poll requested for {}", subscriber);
        let cycle = self.poller.run_for(subscriber).await;

        if !self.is_scheduled(subscriber) {
            let minutes = self
                .poller
                .shared()
                .lock()
                .await
                .interval_for(subscriber, self.default_interval);
            self.schedule(subscriber, minutes)?;
        }

        let info = self
            .timer_info(subscriber)
            .ok_or_else(|| RelayError::NotFound(format!("timer for {subscriber}")))?;

        Ok(TriggerReport {
            cycle,
            next_tick: info.next_tick,
            interval_minutes: info.interval_minutes,
        })
    }

    /// Cancel the timer of `subscriber`. Returns `false` if none existed.
    pub fn unschedule(&self, subscriber: &str) -> bool {
        match self.timers().remove(subscriber) {
            Some(timer) => {
                timer.stop();
                info!("Unscheduled {}", subscriber);
                true
            }
            None => false,
        }
    }

    /// Whether `subscriber` has a timer.
    pub fn is_scheduled(&self, subscriber: &str) -> bool {
        self.timers().contains_key(subscriber)
    }

    /// Interval and next tick of `subscriber`'s timer.
    pub fn timer_info(&self, subscriber: &str) -> Option<TimerInfo> {
        let now = Utc::now();
        self.timers().get(subscriber).map(|timer| TimerInfo {
            subscriber: subscriber.to_string(),
            interval_minutes: timer.interval_minutes,
            next_tick: timer.next_tick(now),
        })
    }

    /// All timers, sorted by subscriber.
    pub fn timers_info(&self) -> Vec<TimerInfo> {
        let now = Utc::now();
        let mut infos: Vec<TimerInfo> = self
            .timers()
            .iter()
            .map(|(subscriber, timer)| TimerInfo {
                subscriber: subscriber.clone(),
                interval_minutes: timer.interval_minutes,
                next_tick: timer.next_tick(now),
            })
            .collect();
        infos.sort_by(|a, b| a.subscriber.cmp(&b.subscriber));
        infos
    }

    /// Cancel every timer.
    pub fn shutdown(&self) {
        let timers: Vec<(String, Timer)> = self.timers().drain().collect();
        for (subscriber, timer) in timers {
            debug!("Stopping timer for {}", subscriber);
            timer.stop();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run_timer(
    poller: Arc<Poller>,
    subscriber: String,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                debug!("Timer tick for {}", subscriber);
                poller.run_for(&subscriber).await;
            }
        }
    }

    debug!("Timer for {} stopped", subscriber);
}
