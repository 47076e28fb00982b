//! Relay state.
//!
//! The single authoritative snapshot of subscribers, their sources, the
//! delivery ledger, the channel binding and per-subscriber settings. It is
//! loaded once at startup, mutated under one lock and saved as a unit.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::ledger::DeliveryLedger;
use crate::{RelayError, Result};

/// Smallest accepted poll interval in minutes.
pub const MIN_INTERVAL_MINUTES: u64 = 1;

/// Largest accepted poll interval in minutes (one week).
pub const MAX_INTERVAL_MINUTES: u64 = 7 * 24 * 60;

/// Check that `minutes` is a usable poll interval.
pub fn validate_interval(minutes: u64) -> Result<()> {
    if (MIN_INTERVAL_MINUTES..=MAX_INTERVAL_MINUTES).contains(&minutes) {
        Ok(())
    } else {
        Err(RelayError::InvalidInterval(minutes))
    }
}

/// Per-subscriber settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriberSettings {
    /// Poll interval in minutes.
    pub update_interval: u64,
}

/// Everything the relay persists.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayState {
    /// Subscriber ID -> source URLs (no duplicates).
    pub subscribers: BTreeMap<String, Vec<String>>,
    /// Delivered entry IDs per subscriber.
    pub ledger: DeliveryLedger,
    /// Subscriber that mirrors every delivery.
    pub channel_id: Option<String>,
    /// Subscriber ID -> settings.
    pub settings: BTreeMap<String, SubscriberSettings>,
}

impl RelayState {
    /// Create an empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber with an empty source list.
    ///
    /// Returns `true` if the subscriber was not known before.
    pub fn register_subscriber(&mut self, id: &str) -> bool {
        if self.subscribers.contains_key(id) {
            return false;
        }
        self.subscribers.insert(id.to_string(), Vec::new());
        true
    }

    /// Add a source to a subscriber, registering the subscriber if needed.
    pub fn add_source(&mut self, id: &str, url: &str) -> Result<()> {
        let sources = self.subscribers.entry(id.to_string()).or_default();
        if sources.iter().any(|s| s == url) {
            return Err(RelayError::Validation(format!(
                "feed already added: {url}"
            )));
        }
        sources.push(url.to_string());
        Ok(())
    }

    /// Remove a source from a subscriber.
    ///
    /// A subscriber whose last source is removed is dropped from the
    /// subscriber list. Its ledger bucket and settings are kept.
    pub fn remove_source(&mut self, id: &str, url: &str) -> Result<()> {
        let sources = self
            .subscribers
            .get_mut(id)
            .ok_or_else(|| RelayError::NotFound(format!("feed {url} for {id}")))?;

        let before = sources.len();
        sources.retain(|s| s != url);
        if sources.len() == before {
            return Err(RelayError::NotFound(format!("feed {url} for {id}")));
        }

        if sources.is_empty() {
            self.subscribers.remove(id);
        }
        Ok(())
    }

    /// Sources of a subscriber (empty for unknown subscribers).
    pub fn sources(&self, id: &str) -> &[String] {
        self.subscribers.get(id).map_or(&[], Vec::as_slice)
    }

    /// IDs of all known subscribers.
    pub fn subscriber_ids(&self) -> Vec<String> {
        self.subscribers.keys().cloned().collect()
    }

    /// Set the poll interval of a subscriber.
    pub fn set_interval(&mut self, id: &str, minutes: u64) -> Result<()> {
        validate_interval(minutes)?;
        self.settings.insert(
            id.to_string(),
            SubscriberSettings {
                update_interval: minutes,
            },
        );
        Ok(())
    }

    /// Poll interval of a subscriber, or `default` without a usable setting.
    pub fn interval_for(&self, id: &str, default: u64) -> u64 {
        match self.settings.get(id) {
            Some(s) if validate_interval(s.update_interval).is_ok() => s.update_interval,
            Some(s) => {
                warn!(
                    "Ignoring stored interval {} for {}, using {}",
                    s.update_interval, id, default
                );
                default
            }
            None => default,
        }
    }

    /// Bind the channel subscriber, registering it if needed.
    ///
    /// Returns the previously bound channel, if any.
    pub fn bind_channel(&mut self, id: &str) -> Option<String> {
        self.register_subscriber(id);
        self.channel_id.replace(id.to_string())
    }

    /// Whether `id` is the bound channel.
    pub fn is_channel(&self, id: &str) -> bool {
        self.channel_id.as_deref() == Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_subscriber() {
        let mut state = RelayState::new();
        assert!(state.register_subscriber("100"));
        assert!(!state.register_subscriber("100"));
        assert!(state.sources("100").is_empty());
        assert_eq!(state.subscriber_ids(), vec!["100".to_string()]);
    }

    #[test]
    fn test_add_source_registers_subscriber() {
        let mut state = RelayState::new();
        state.add_source("100", "https://example.com/feed.xml").unwrap();
        assert_eq!(state.sources("100"), ["https://example.com/feed.xml"]);
    }

    #[test]
    fn test_add_source_rejects_duplicates() {
        let mut state = RelayState::new();
        state.add_source("100", "https://example.com/feed.xml").unwrap();
        let err = state
            .add_source("100", "https://example.com/feed.xml")
            .unwrap_err();
        assert!(matches!(err, RelayError::Validation(_)));
        assert_eq!(state.sources("100").len(), 1);

        // Same URL for another subscriber is stored independently
        state.add_source("200", "https://example.com/feed.xml").unwrap();
        assert_eq!(state.sources("200").len(), 1);
    }

    #[test]
    fn test_remove_last_source_drops_subscriber() {
        let mut state = RelayState::new();
        state.add_source("100", "https://example.com/a.xml").unwrap();
        state.add_source("100", "https://example.com/b.xml").unwrap();
        state.set_interval("100", 10).unwrap();

        state.remove_source("100", "https://example.com/a.xml").unwrap();
        assert_eq!(state.sources("100"), ["https://example.com/b.xml"]);

        state.remove_source("100", "https://example.com/b.xml").unwrap();
        assert!(!state.subscribers.contains_key("100"));
        assert_eq!(state.interval_for("100", 30), 10);
    }

    #[test]
    fn test_remove_unknown_source() {
        let mut state = RelayState::new();
        assert!(matches!(
            state.remove_source("100", "https://example.com/a.xml"),
            Err(RelayError::NotFound(_))
        ));

        state.add_source("100", "https://example.com/a.xml").unwrap();
        assert!(matches!(
            state.remove_source("100", "https://example.com/b.xml"),
            Err(RelayError::NotFound(_))
        ));
    }

    #[test]
    fn test_set_interval() {
        let mut state = RelayState::new();
        assert_eq!(state.interval_for("100", 30), 30);

        state.set_interval("100", 5).unwrap();
        assert_eq!(state.interval_for("100", 30), 5);
    }

    #[test]
    fn test_set_interval_rejects_zero() {
        let mut state = RelayState::new();
        state.set_interval("100", 30).unwrap();

        let err = state.set_interval("100", 0).unwrap_err();
        assert!(matches!(err, RelayError::InvalidInterval(0)));
        assert_eq!(state.interval_for("100", 60), 30);
    }

    #[test]
    fn test_set_interval_bounds() {
        let mut state = RelayState::new();
        state.set_interval("100", MIN_INTERVAL_MINUTES).unwrap();
        state.set_interval("100", MAX_INTERVAL_MINUTES).unwrap();

        for minutes in [MAX_INTERVAL_MINUTES + 1, 1 << 40, u64::MAX] {
            let err = state.set_interval("100", minutes).unwrap_err();
            assert!(matches!(err, RelayError::InvalidInterval(m) if m == minutes));
        }
        assert_eq!(state.interval_for("100", 30), MAX_INTERVAL_MINUTES);
    }

    #[test]
    fn test_stored_interval_out_of_range_uses_default() {
        let mut state = RelayState::new();
        state
            .settings
            .insert("100".to_string(), SubscriberSettings { update_interval: u64::MAX });
        state
            .settings
            .insert("200".to_string(), SubscriberSettings { update_interval: 0 });

        assert_eq!(state.interval_for("100", 30), 30);
        assert_eq!(state.interval_for("200", 30), 30);
    }

    #[test]
    fn test_bind_channel() {
        let mut state = RelayState::new();
        assert_eq!(state.bind_channel("200"), None);
        assert!(state.is_channel("200"));
        assert!(state.subscribers.contains_key("200"));

        assert_eq!(state.bind_channel("300"), Some("200".to_string()));
        assert!(!state.is_channel("200"));
    }
}
