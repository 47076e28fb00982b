//! Feed sources: entry type and fetching.

pub mod fetcher;
pub mod types;

pub use fetcher::{parse_entries, validate_url, HttpFetcher, SourceFetcher};
pub use types::{Entry, NOTIFICATION_PREFIX};
