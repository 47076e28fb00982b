//! feedrelay - Feed notification relay
//!
//! Polls subscribed RSS/Atom feeds on a per-subscriber schedule and delivers
//! every new entry exactly once to each subscriber (and the bound channel).

pub mod config;
pub mod error;
pub mod feed;
pub mod ledger;
pub mod logging;
pub mod poll;
pub mod scheduler;
pub mod service;
pub mod sink;
pub mod state;
pub mod store;

pub use config::Config;
pub use error::{DeliveryError, FetchError, FetchErrorKind, RelayError, Result};
pub use feed::{Entry, HttpFetcher, SourceFetcher};
pub use ledger::DeliveryLedger;
pub use poll::{CycleReport, Poller};
pub use scheduler::{Scheduler, TimerInfo, TriggerReport};
pub use service::RelayService;
pub use sink::{DeliverySink, TelegramSink};
pub use state::{
    validate_interval, RelayState, SubscriberSettings, MAX_INTERVAL_MINUTES, MIN_INTERVAL_MINUTES,
};
pub use store::{JsonFileStore, MemoryStore, SharedState, StateStore};
