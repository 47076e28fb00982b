//! Dedup ledger.
//!
//! Records, per subscriber, which entry IDs were already delivered and when.
//! Buckets are append-only: an ID is never removed and its first timestamp
//! is never overwritten.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

type RawLedger = BTreeMap<String, BTreeMap<String, String>>;

/// Delivery record: subscriber -> (entry ID -> first delivery time).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawLedger", into = "RawLedger")]
pub struct DeliveryLedger {
    buckets: BTreeMap<String, BTreeMap<String, DateTime<Utc>>>,
}

impl DeliveryLedger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check whether `entry_id` was already delivered to `subscriber`.
    pub fn has(&self, subscriber: &str, entry_id: &str) -> bool {
        self.buckets
            .get(subscriber)
            .is_some_and(|bucket| bucket.contains_key(entry_id))
    }

    /// Record a delivery.
    ///
    /// Returns `true` if the ID was new for this subscriber. An existing
    /// record keeps its original timestamp.
    pub fn record(&mut self, subscriber: &str, entry_id: &str, at: DateTime<Utc>) -> bool {
        let bucket = self.buckets.entry(subscriber.to_string()).or_default();
        if bucket.contains_key(entry_id) {
            return false;
        }
        bucket.insert(entry_id.to_string(), at);
        true
    }

    /// Time `entry_id` was first delivered to `subscriber`.
    pub fn delivered_at(&self, subscriber: &str, entry_id: &str) -> Option<DateTime<Utc>> {
        self.buckets.get(subscriber)?.get(entry_id).copied()
    }

    /// Number of entries recorded for `subscriber`.
    pub fn bucket_len(&self, subscriber: &str) -> usize {
        self.buckets.get(subscriber).map_or(0, BTreeMap::len)
    }

    /// Total number of records across all buckets.
    pub fn len(&self) -> usize {
        self.buckets.values().map(BTreeMap::len).sum()
    }

    /// Whether no delivery was ever recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<RawLedger> for DeliveryLedger {
    fn from(raw: RawLedger) -> Self {
        let buckets = raw
            .into_iter()
            .map(|(subscriber, bucket)| {
                let bucket = bucket
                    .into_iter()
                    .map(|(id, ts)| {
                        let at = parse_timestamp(&ts).unwrap_or_else(|| {
                            warn!("Unreadable timestamp {:?} for {} in {}", ts, id, subscriber);
                            DateTime::<Utc>::UNIX_EPOCH
                        });
                        (id, at)
                    })
                    .collect();
                (subscriber, bucket)
            })
            .collect();

        Self { buckets }
    }
}

impl From<DeliveryLedger> for RawLedger {
    fn from(ledger: DeliveryLedger) -> Self {
        ledger
            .buckets
            .into_iter()
            .map(|(subscriber, bucket)| {
                let bucket = bucket
                    .into_iter()
                    .map(|(id, at)| (id, at.to_rfc3339_opts(SecondsFormat::Micros, true)))
                    .collect();
                (subscriber, bucket)
            })
            .collect()
    }
}

/// Parse an RFC 3339 timestamp, or a naive ISO-8601 one taken as UTC.
fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}
