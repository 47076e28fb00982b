//! Relay command surface.
//!
//! High-level subscriber operations: each one validates its input, mutates
//! the shared state (saving it) and keeps the subscriber's timer in line
//! with the result.

use std::sync::Arc;

use tracing::{info, warn};

use crate::feed::validate_url;
use crate::scheduler::{Scheduler, TriggerReport};
use crate::store::SharedState;
use crate::{RelayError, Result};

/// Service for subscriber operations.
pub struct RelayService {
    shared: Arc<SharedState>,
    scheduler: Arc<Scheduler>,
    allow_private_hosts: bool,
}

impl RelayService {
    /// Create a new RelayService.
    pub fn new(scheduler: Arc<Scheduler>, allow_private_hosts: bool) -> Self {
        Self {
            shared: Arc::clone(scheduler.poller().shared()),
            scheduler,
            allow_private_hosts,
        }
    }

    /// Scheduler driving the subscribers.
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Register a subscriber with an empty source list and start its timer.
    ///
    /// Returns `true` if the subscriber was not known before.
    pub async fn register_subscriber(&self, subscriber: &str) -> Result<bool> {
        let created = self
            .shared
            .update(|state| Ok(state.register_subscriber(subscriber)))
            .await?;

        if created {
            info!("Registered subscriber {}", subscriber);
        }
        self.ensure_scheduled(subscriber).await?;
        Ok(created)
    }

    /// Designate `channel` as the channel subscriber.
    ///
    /// Returns the previously bound channel, if any.
    pub async fn bind_channel(&self, channel: &str) -> Result<Option<String>> {
        let previous = self
            .shared
            .update(|state| Ok(state.bind_channel(channel)))
            .await?;

        match previous.as_deref() {
            Some(old) if old != channel => {
                warn!("Channel binding moved from {} to {}", old, channel)
            }
            Some(_) => {}
            None => info!("Bound channel {}", channel),
        }

        self.ensure_scheduled(channel).await?;
        Ok(previous)
    }

    /// Subscribe `subscriber` to `url`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - the URL is not an http(s) URL with a public host
    /// - the subscriber already has this source
    pub async fn add_source(&self, subscriber: &str, url: &str) -> Result<()> {
        let url = url.trim();
        validate_url(url, self.allow_private_hosts)?;

        self.shared
            .update(|state| state.add_source(subscriber, url))
            .await?;
        info!("Added {} for {}", url, subscriber);

        self.ensure_scheduled(subscriber).await
    }

    /// Unsubscribe `subscriber` from `url`.
    ///
    /// Removing the last source also stops the subscriber's timer.
    pub async fn remove_source(&self, subscriber: &str, url: &str) -> Result<()> {
        let url = url.trim();
        let remaining = self
            .shared
            .update(|state| {
                state.remove_source(subscriber, url)?;
                Ok(state.subscribers.contains_key(subscriber))
            })
            .await?;
        info!("Removed {} for {}", url, subscriber);

        if !remaining {
            self.scheduler.unschedule(subscriber);
        }
        Ok(())
    }

    /// Sources of `subscriber`, in subscription order.
    pub async fn list_sources(&self, subscriber: &str) -> Vec<String> {
        self.shared.lock().await.sources(subscriber).to_vec()
    }

    /// Poll `subscriber` now.
    pub async fn trigger_now(&self, subscriber: &str) -> Result<TriggerReport> {
        self.require_known(subscriber).await?;
        self.scheduler.trigger_now(subscriber).await
    }

    /// Change the poll interval of `subscriber`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - the subscriber is not registered
    /// - `minutes` is outside 1 minute to 1 week
    pub async fn set_interval(&self, subscriber: &str, minutes: u64) -> Result<()> {
        self.require_known(subscriber).await?;
        self.scheduler.reschedule(subscriber, minutes).await?;
        info!("Interval of {} set to {} minute(s)", subscriber, minutes);
        Ok(())
    }

    async fn require_known(&self, subscriber: &str) -> Result<()> {
        if self.shared.lock().await.subscribers.contains_key(subscriber) {
            Ok(())
        } else {
            Err(RelayError::NotFound(format!("subscriber {subscriber}")))
        }
    }

    async fn ensure_scheduled(&self, subscriber: &str) -> Result<()> {
        if self.scheduler.is_scheduled(subscriber) {
            return Ok(());
        }
        let minutes = self
            .shared
            .lock()
            .await
            .interval_for(subscriber, self.scheduler.default_interval());
        self.scheduler.schedule(subscriber, minutes)
    }
}
