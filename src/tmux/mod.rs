mod capture;
mod client;
#[cfg(test)]
pub(crate) mod memory;

pub use capture::{content_digest, normalize_capture, ContentDigest};
pub use client::TmuxClient;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::TmuxError;

/// Session-scoped tags, stored as tmux user options on each session.
pub mod tags {
    /// Marks a session as created by agent-deck (value "1")
    pub const APP: &str = "@agent_deck";
    pub const WORKSPACE: &str = "@agent_deck_workspace";
    pub const TAB: &str = "@agent_deck_tab";
    /// "agent" or "terminal"
    pub const TYPE: &str = "@agent_deck_type";
    pub const ASSISTANT: &str = "@agent_deck_assistant";
    /// Unix milliseconds
    pub const CREATED_AT: &str = "@agent_deck_created_at";
    /// Unix milliseconds, written by the output pump
    pub const LAST_OUTPUT_AT: &str = "@agent_deck_last_output_at";
    /// Unix milliseconds, written when the user types into the pane
    pub const LAST_INPUT_AT: &str = "@agent_deck_last_input_at";
    /// Instance id of the application that created the session
    pub const INSTANCE: &str = "@agent_deck_instance";

    pub const APP_MARKER: &str = "1";
    pub const TYPE_AGENT: &str = "agent";
    pub const TYPE_TERMINAL: &str = "terminal";
}

/// Server-scoped options shared by every running instance.
pub mod options {
    pub const SCAN_OWNER: &str = "@agent_deck_scan_owner";
    pub const SCAN_HEARTBEAT_MS: &str = "@agent_deck_scan_heartbeat_ms";
    pub const SCAN_EPOCH: &str = "@agent_deck_scan_epoch";
    pub const ACTIVE_SNAPSHOT: &str = "@agent_deck_active_snapshot";
}

/// Tag-equality filter: every `(key, value)` pair must match
pub type TagFilter<'a> = &'a [(&'a str, &'a str)];

/// One tmux session as returned by [`TagQuery::list_sessions`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionRow {
    pub name: String,
    /// Requested tag values; unset tags are absent
    pub tags: HashMap<String, String>,
    /// tmux's own creation timestamp
    pub created_at_ms: Option<i64>,
    pub attached_clients: usize,
    /// Last output seen on the session's current window
    pub window_activity_ms: Option<i64>,
    /// False once the active pane's process has exited
    pub has_live_pane: bool,
}

impl SessionRow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            has_live_pane: true,
            ..Self::default()
        }
    }

    /// Tag value, treating an empty string as unset
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    /// Tag value parsed as unix milliseconds
    pub fn tag_ms(&self, key: &str) -> Option<i64> {
        self.tag(key).and_then(|v| v.parse().ok())
    }

    pub fn matches(&self, filter: TagFilter<'_>) -> bool {
        filter
            .iter()
            .all(|(key, value)| self.tag(key) == Some(*value))
    }

    pub fn is_app_session(&self) -> bool {
        self.tag(tags::APP) == Some(tags::APP_MARKER)
    }
}

/// Everything the activity and lifecycle code needs from the multiplexer.
///
/// Implementations must be cheap to share across background tasks; the
/// runtime holds one behind an `Arc`.
#[async_trait]
pub trait TagQuery: Send + Sync {
    /// Sessions matching `filter`, with the values of `keys` (plus the filter keys) filled in
    async fn list_sessions(
        &self,
        filter: TagFilter<'_>,
        keys: &[&str],
    ) -> Result<Vec<SessionRow>, TmuxError>;

    /// Server-scoped option; `None` when unset or empty
    async fn get_global_option(&self, key: &str) -> Result<Option<String>, TmuxError>;

    async fn set_global_option(&self, key: &str, value: &str) -> Result<(), TmuxError>;

    /// Unset a server-scoped option
    async fn unset_global_option(&self, key: &str) -> Result<(), TmuxError>;

    /// Last `lines` lines of the session's active pane, `None` on failure
    async fn capture_tail(&self, session: &str, lines: usize) -> Option<String>;

    async fn session_has_clients(&self, session: &str) -> Result<bool, TmuxError>;

    async fn session_created_at(&self, session: &str) -> Result<Option<i64>, TmuxError>;

    async fn kill_session(&self, session: &str) -> Result<(), TmuxError>;

    /// Kill every session matching `filter` and, when given, whose name starts with `name_prefix`
    async fn kill_sessions_matching(
        &self,
        filter: TagFilter<'_>,
        name_prefix: Option<&str>,
    ) -> Result<usize, TmuxError>;
}
