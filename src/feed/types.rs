//! Feed entry type.

/// Notification prefix shown before every entry title.
pub const NOTIFICATION_PREFIX: &str = "⚡️";

/// One item read from a source at fetch time.
///
/// Entries are never persisted; only their `id` ends up in the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Feed-provided ID, or the link when the feed has none.
    pub id: String,
    /// Entry title.
    pub title: String,
    /// Entry link.
    pub link: String,
}

impl Entry {
    /// Create a new entry.
    pub fn new(id: impl Into<String>, title: impl Into<String>, link: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            link: link.into(),
        }
    }

    /// Build an entry from optional feed fields.
    ///
    /// A blank ID falls back to the link. Returns `None` when the entry has
    /// neither, since it could never be deduplicated.
    pub fn from_parts(id: Option<&str>, title: Option<String>, link: Option<String>) -> Option<Self> {
        let link = link.map(|l| l.trim().to_string()).unwrap_or_default();
        let id = match id.map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ if !link.is_empty() => link.clone(),
            _ => return None,
        };
        let title = title
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| "Untitled".to_string());

        Some(Self { id, title, link })
    }

    /// Render the notification text for this entry.
    pub fn render(&self) -> String {
        format!("{} [{}]({})", NOTIFICATION_PREFIX, self.title, self.link)
    }
}
