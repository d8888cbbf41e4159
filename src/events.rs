use std::collections::BTreeSet;
use std::fmt;

use tokio::sync::mpsc;
use tracing::debug;

use crate::coordinator::ScanRole;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimReason {
    Orphan,
    Stale,
    /// Explicit request to drop a workspace's sessions
    Workspace,
}

impl fmt::Display for ReclaimReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReclaimReason::Orphan => write!(f, "orphaned"),
            ReclaimReason::Stale => write!(f, "stale"),
            ReclaimReason::Workspace => write!(f, "workspace"),
        }
    }
}

/// Notifications for the UI and persistence layers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeckEvent {
    /// A tab's session is gone; its record should be marked stopped
    TabStopped {
        workspace_id: String,
        session_name: String,
    },
    SessionsReclaimed {
        count: usize,
        reason: ReclaimReason,
    },
    ActiveWorkspacesChanged(BTreeSet<String>),
    RoleChanged {
        role: ScanRole,
        epoch: u64,
    },
}

/// Receives [`DeckEvent`]s on the owner task
pub trait EventSink: Send {
    fn emit(&self, event: DeckEvent);
}

impl EventSink for mpsc::UnboundedSender<DeckEvent> {
    fn emit(&self, event: DeckEvent) {
        if self.send(event).is_err() {
            debug!("Event receiver dropped");
        }
    }
}
