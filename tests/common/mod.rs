//! Common test utilities for integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use feedrelay::{
    DeliveryError, DeliverySink, Entry, FetchError, FetchErrorKind, MemoryStore, Poller,
    RelayState, Scheduler, SharedState, SourceFetcher,
};

/// Fetcher serving in-memory feeds. Unknown URLs fail with HTTP 404.
#[derive(Default)]
pub struct FakeFetcher {
    feeds: Mutex<HashMap<String, Vec<Entry>>>,
    failing: Mutex<HashSet<String>>,
    delay: Mutex<Option<Duration>>,
    calls: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the entries served for `url`.
    pub fn set_feed(&self, url: &str, entries: Vec<Entry>) {
        self.feeds
            .lock()
            .unwrap()
            .insert(url.to_string(), entries);
    }

    /// Make `url` fail (or recover).
    pub fn set_failing(&self, url: &str, failing: bool) {
        let mut set = self.failing.lock().unwrap();
        if failing {
            set.insert(url.to_string());
        } else {
            set.remove(url);
        }
    }

    /// Delay every fetch by `delay`.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    /// URLs fetched so far, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Highest number of fetches that were running at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceFetcher for FakeFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<Entry>, FetchError> {
        self.calls.lock().unwrap().push(url.to_string());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.failing.lock().unwrap().contains(url) {
            return Err(FetchError::new(url, FetchErrorKind::Timeout));
        }
        self.feeds
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| FetchError::new(url, FetchErrorKind::Status(404)))
    }
}

/// Sink recording every delivery. Destinations can be made to fail.
#[derive(Default)]
pub struct FakeSink {
    delivered: Mutex<Vec<(String, String)>>,
    failing: Mutex<HashSet<String>>,
    slow: Mutex<HashMap<String, Duration>>,
}

impl FakeSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, destination: &str, failing: bool) {
        let mut set = self.failing.lock().unwrap();
        if failing {
            set.insert(destination.to_string());
        } else {
            set.remove(destination);
        }
    }

    /// Delay every delivery to `destination` by `delay`.
    pub fn set_slow(&self, destination: &str, delay: Duration) {
        self.slow
            .lock()
            .unwrap()
            .insert(destination.to_string(), delay);
    }

    /// All `(destination, text)` pairs delivered so far.
    pub fn delivered(&self) -> Vec<(String, String)> {
        self.delivered.lock().unwrap().clone()
    }

    /// Texts delivered to `destination`.
    pub fn delivered_to(&self, destination: &str) -> Vec<String> {
        self.delivered()
            .into_iter()
            .filter(|(d, _)| d == destination)
            .map(|(_, text)| text)
            .collect()
    }
}

#[async_trait]
impl DeliverySink for FakeSink {
    async fn deliver(&self, destination: &str, entry: &Entry) -> Result<(), DeliveryError> {
        let delay = self.slow.lock().unwrap().get(destination).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.lock().unwrap().contains(destination) {
            return Err(DeliveryError::new(destination, "chat not found"));
        }
        self.delivered
            .lock()
            .unwrap()
            .push((destination.to_string(), entry.render()));
        Ok(())
    }
}

/// A relay wired to fakes.
pub struct TestRelay {
    pub store: Arc<MemoryStore>,
    pub fetcher: Arc<FakeFetcher>,
    pub sink: Arc<FakeSink>,
    pub shared: Arc<SharedState>,
    pub poller: Arc<Poller>,
    pub scheduler: Arc<Scheduler>,
}

impl TestRelay {
    pub fn new(state: RelayState) -> Self {
        let store = Arc::new(MemoryStore::with_state(state));
        let shared = Arc::new(SharedState::load(store.clone()).unwrap());
        let fetcher = Arc::new(FakeFetcher::new());
        let sink = Arc::new(FakeSink::new());
        let poller = Arc::new(Poller::new(
            Arc::clone(&shared),
            fetcher.clone(),
            sink.clone(),
            true,
        ));
        let scheduler = Arc::new(Scheduler::new(Arc::clone(&poller), 30));

        Self {
            store,
            fetcher,
            sink,
            shared,
            poller,
            scheduler,
        }
    }
}

/// State built from `(subscriber, url)` subscriptions.
pub fn state_with(subscriptions: &[(&str, &str)]) -> RelayState {
    let mut state = RelayState::new();
    for (subscriber, url) in subscriptions {
        state.add_source(subscriber, url).unwrap();
    }
    state
}

pub fn entry(id: &str, title: &str, link: &str) -> Entry {
    Entry::new(id, title, link)
}
