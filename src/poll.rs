//! Poll cycle.
//!
//! One cycle fetches every source of a batch of subscribers concurrently,
//! then delivers entries missing from each subscriber's ledger bucket (and
//! the channel's bucket when mirroring), records successful deliveries and
//! saves the state once.
//!
//! Cycles for the same subscriber never overlap: [`Poller::run_for`] and
//! [`Poller::run_all`] hold a per-subscriber guard for the whole cycle.
//! Deliveries to one destination are serialized by a per-destination lane,
//! so a mirrored entry reaches the channel once even when several cycles
//! run at the same time. The state lock is only taken around ledger reads
//! and writes, never across a network call.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use crate::error::FetchError;
use crate::feed::{Entry, SourceFetcher};
use crate::sink::DeliverySink;
use crate::store::SharedState;

/// Outcome of one poll cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Subscribers in the batch.
    pub subscribers: usize,
    /// Distinct source URLs fetched successfully.
    pub sources_fetched: usize,
    /// Distinct source URLs that failed.
    pub sources_failed: usize,
    /// Notifications delivered (and recorded).
    pub delivered: usize,
    /// Notifications that failed and stay pending.
    pub delivery_failures: usize,
    /// Whether the state was saved at the end of the cycle.
    pub persisted: bool,
}

type FetchResults = HashMap<String, Result<Vec<Entry>, FetchError>>;

/// Async mutexes created on demand per key.
///
/// Entries nobody holds or waits for are dropped by [`KeyedLocks::prune`].
#[derive(Default)]
struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyedLocks {
    fn map(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<tokio::sync::Mutex<()>>>> {
        self.locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = Arc::clone(self.map().entry(key.to_string()).or_default());
        lock.lock_owned().await
    }

    fn prune(&self) {
        // Holders and waiters keep a clone, so a count of 1 means idle
        self.map().retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.map().len()
    }
}

/// Runs poll cycles against the shared state.
pub struct Poller {
    shared: Arc<SharedState>,
    fetcher: Arc<dyn SourceFetcher>,
    sink: Arc<dyn DeliverySink>,
    mirror_to_channel: bool,
    guards: KeyedLocks,
    lanes: KeyedLocks,
}

impl Poller {
    /// Create a poller.
    pub fn new(
        shared: Arc<SharedState>,
        fetcher: Arc<dyn SourceFetcher>,
        sink: Arc<dyn DeliverySink>,
        mirror_to_channel: bool,
    ) -> Self {
        Self {
            shared,
            fetcher,
            sink,
            mirror_to_channel,
            guards: KeyedLocks::default(),
            lanes: KeyedLocks::default(),
        }
    }

    /// Shared state this poller works on.
    pub fn shared(&self) -> &Arc<SharedState> {
        &self.shared
    }

    /// Run one cycle for a single subscriber.
    ///
    /// Waits for any cycle already running for this subscriber to finish.
    pub async fn run_for(&self, subscriber: &str) -> CycleReport {
        let report = {
            let _guard = self.guards.lock(subscriber).await;
            self.run_batch(&[subscriber.to_string()]).await
        };
        self.prune();
        report
    }

    /// Run one cycle over every known subscriber.
    pub async fn run_all(&self) -> CycleReport {
        let subscribers = self.shared.lock().await.subscriber_ids();

        let report = {
            // subscriber_ids() is sorted, so guards are always taken in the same order
            let mut guards = Vec::with_capacity(subscribers.len());
            for subscriber in &subscribers {
                guards.push(self.guards.lock(subscriber).await);
            }
            self.run_batch(&subscribers).await
        };
        self.prune();
        report
    }

    fn prune(&self) {
        self.guards.prune();
        self.lanes.prune();
    }

    /// Run one cycle for `subscribers` without taking their guards.
    async fn run_batch(&self, subscribers: &[String]) -> CycleReport {
        let mut report = CycleReport {
            subscribers: subscribers.len(),
            ..CycleReport::default()
        };

        let urls: BTreeSet<String> = {
            let state = self.shared.lock().await;
            subscribers
                .iter()
                .flat_map(|s| state.sources(s).iter().cloned())
                .collect()
        };

        debug!(
            "Polling {} source(s) for {} subscriber(s)",
            urls.len(),
            subscribers.len()
        );
        let results = self.fetch_all(urls).await;

        for (url, result) in &results {
            match result {
                Ok(_) => report.sources_fetched += 1,
                Err(e) => {
                    warn!("{}", e);
                    debug!("Skipping {} until the next cycle", url);
                    report.sources_failed += 1;
                }
            }
        }

        for subscriber in subscribers {
            // Sources removed while we were fetching are not delivered
            let (sources, channel) = {
                let state = self.shared.lock().await;
                let channel = if self.mirror_to_channel && !state.is_channel(subscriber) {
                    state.channel_id.clone()
                } else {
                    None
                };
                (state.sources(subscriber).to_vec(), channel)
            };

            for url in &sources {
                let Some(Ok(entries)) = results.get(url) else {
                    continue;
                };

                self.deliver_new(subscriber, entries, &mut report).await;
                if let Some(channel) = &channel {
                    self.deliver_new(channel, entries, &mut report).await;
                }
            }
        }

        report.persisted = {
            let state = self.shared.lock().await;
            self.shared.persist(&state)
        };

        if report.delivered > 0 || report.delivery_failures > 0 || report.sources_failed > 0 {
            info!(
                "Poll cycle done: {} delivered, {} delivery failure(s), {}/{} source(s) failed",
                report.delivered,
                report.delivery_failures,
                report.sources_failed,
                report.sources_fetched + report.sources_failed
            );
        } else {
            debug!("Poll cycle done: nothing new");
        }

        report
    }

    /// Fetch each URL once, concurrently.
    async fn fetch_all(&self, urls: BTreeSet<String>) -> FetchResults {
        let fetches = urls.into_iter().map(|url| {
            let fetcher = Arc::clone(&self.fetcher);
            async move {
                let result = fetcher.fetch(&url).await;
                (url, result)
            }
        });

        join_all(fetches).await.into_iter().collect()
    }

    /// Deliver entries not yet recorded for `destination`, in feed order.
    async fn deliver_new(&self, destination: &str, entries: &[Entry], report: &mut CycleReport) {
        let _lane = self.lanes.lock(destination).await;

        for entry in entries {
            if self.shared.lock().await.ledger.has(destination, &entry.id) {
                continue;
            }

            match self.sink.deliver(destination, entry).await {
                Ok(()) => {
                    self.shared
                        .lock()
                        .await
                        .ledger
                        .record(destination, &entry.id, Utc::now());
                    report.delivered += 1;
                }
                Err(e) => {
                    warn!("{}; {} will be retried next cycle", e, entry.id);
                    report.delivery_failures += 1;
                }
            }
        }
    }
}
