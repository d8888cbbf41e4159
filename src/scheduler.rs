//! Periodic activity scans.
//!
//! [`ScanScheduler`] lives on the owner task and is the only thing that
//! mutates hysteresis state and the active workspace set. Each scan gets a
//! token; [`run_scan`] works on an owned [`ScanRequest`] in the background
//! and its [`ScanResult`] is dropped on return if a newer scan was started.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::activity::{ClassifierInput, SessionActivityState, TagClassifier, TaggedSession};
use crate::coordinator::{RoleResolution, ScanCoordinator, ScanRole};
use crate::facts::{self, RunningTab, SessionFacts, Workspace};
use crate::tmux::{tags, SessionRow, TagQuery};

/// Tags read for every session on each scan
const SCAN_KEYS: &[&str] = &[
    tags::APP,
    tags::WORKSPACE,
    tags::TAB,
    tags::TYPE,
    tags::LAST_OUTPUT_AT,
    tags::LAST_INPUT_AT,
];

/// Everything a background scan needs, copied off the owner task
#[derive(Debug, Clone)]
pub struct ScanRequest {
    pub token: u64,
    pub facts: SessionFacts,
    pub states: HashMap<String, SessionActivityState>,
    pub running_tabs: Vec<RunningTab>,
}

#[derive(Debug, Clone, Default)]
pub struct ScanResult {
    pub token: u64,
    /// `None` when tmux could not be reached
    pub role: Option<RoleResolution>,
    /// `None` leaves the current active set untouched
    pub active_workspaces: Option<BTreeSet<String>>,
    /// Replacement hysteresis states; `None` keeps the current ones
    pub states: Option<HashMap<String, SessionActivityState>>,
    /// Tabs recorded as running whose session no longer exists
    pub stopped_tabs: Vec<RunningTab>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Superseded by a newer scan and dropped
    Stale,
    Applied {
        active_changed: bool,
        stopped_tabs: Vec<RunningTab>,
        /// A rescan was requested while this one ran; start it now
        rescan_due: bool,
    },
}

#[derive(Debug, Default)]
pub struct ScanScheduler {
    token: u64,
    in_flight: bool,
    rescan_pending: bool,
    states: HashMap<String, SessionActivityState>,
    active_workspaces: BTreeSet<String>,
    last_role: Option<ScanRole>,
    last_epoch: u64,
    completed_scans: u64,
}

impl ScanScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Timer tick: start a scan, or remember to rescan once the current one lands
    pub fn on_tick(&mut self, workspaces: &[Workspace]) -> Option<ScanRequest> {
        if self.in_flight {
            self.rescan_pending = true;
            debug!(token = self.token, "Scan still in flight; deferring");
            return None;
        }
        Some(self.start_scan(workspaces))
    }

    /// Start a scan unconditionally with a fresh token
    pub fn start_scan(&mut self, workspaces: &[Workspace]) -> ScanRequest {
        self.token += 1;
        self.in_flight = true;
        self.rescan_pending = false;
        ScanRequest {
            token: self.token,
            facts: facts::resolve_session_facts(workspaces),
            states: self.states.clone(),
            running_tabs: facts::running_tabs(workspaces),
        }
    }

    pub fn apply_result(&mut self, result: ScanResult) -> ApplyOutcome {
        if result.token != self.token {
            debug!(
                token = result.token,
                current = self.token,
                "Dropping superseded scan result"
            );
            return ApplyOutcome::Stale;
        }

        self.in_flight = false;
        self.completed_scans += 1;

        if let Some(role) = &result.role {
            self.last_role = Some(role.role);
            self.last_epoch = role.epoch;
        }
        if let Some(states) = result.states {
            self.states = states;
        }

        let mut active_changed = false;
        if let Some(active) = result.active_workspaces {
            active_changed = active != self.active_workspaces;
            self.active_workspaces = active;
        }

        let rescan_due = std::mem::take(&mut self.rescan_pending);
        ApplyOutcome::Applied {
            active_changed,
            stopped_tabs: result.stopped_tabs,
            rescan_due,
        }
    }

    pub fn active_workspaces(&self) -> &BTreeSet<String> {
        &self.active_workspaces
    }

    pub fn states(&self) -> &HashMap<String, SessionActivityState> {
        &self.states
    }

    pub fn last_role(&self) -> Option<ScanRole> {
        self.last_role
    }

    pub fn last_epoch(&self) -> u64 {
        self.last_epoch
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn rescan_pending(&self) -> bool {
        self.rescan_pending
    }

    /// At least one scan has listed the server's sessions
    pub fn discovery_complete(&self) -> bool {
        self.completed_scans > 0
    }
}

/// Shared, read-only collaborators of the background scan
#[derive(Clone)]
pub struct ScanContext {
    pub query: Arc<dyn TagQuery>,
    pub coordinator: ScanCoordinator,
    pub classifier: TagClassifier,
    pub window_recent_ms: i64,
}

/// One scan: list sessions, reconcile tabs, then classify (owner) or read the
/// owner's snapshot (follower).
pub async fn run_scan(ctx: &ScanContext, request: ScanRequest, now_ms: i64) -> ScanResult {
    let query = ctx.query.as_ref();
    let mut result = ScanResult {
        token: request.token,
        ..ScanResult::default()
    };

    let rows = match query.list_sessions(&[], SCAN_KEYS).await {
        Ok(rows) => rows,
        Err(e) => {
            warn!(error = %e, token = request.token, "Skipping activity scan");
            return result;
        }
    };

    let live: HashSet<&str> = rows.iter().map(|row| row.name.as_str()).collect();
    result.stopped_tabs = request
        .running_tabs
        .iter()
        .filter(|tab| !live.contains(tab.session_name.as_str()))
        .cloned()
        .collect();

    let role = ctx.coordinator.resolve_role(query, now_ms).await;
    match role.role {
        ScanRole::Owner => {
            let sessions: Vec<TaggedSession> = rows
                .iter()
                .filter(|row| row.is_app_session() || request.facts.contains_key(&row.name))
                .map(TaggedSession::from_row)
                .collect();
            let window_recent = window_recent(&rows, now_ms, ctx.window_recent_ms);

            let classification = ctx
                .classifier
                .classify(
                    query,
                    ClassifierInput {
                        sessions: &sessions,
                        facts: &request.facts,
                        window_recent: &window_recent,
                        now_ms,
                    },
                    request.states,
                )
                .await;

            if let Err(e) = ctx
                .coordinator
                .publish_snapshot(query, &classification.active_workspaces, role.epoch, now_ms)
                .await
            {
                warn!(error = %e, epoch = role.epoch, "Failed to publish activity snapshot");
            }

            result.active_workspaces = Some(classification.active_workspaces);
            result.states = Some(classification.states);
        }
        ScanRole::Follower => {
            if role.apply_shared {
                result.active_workspaces = role.snapshot.as_ref().map(|s| s.workspaces.clone());
            }
            // Nothing is observed locally while following
            result.states = Some(HashMap::new());
        }
    }

    result.role = Some(role);
    result
}

fn window_recent(rows: &[SessionRow], now_ms: i64, window_ms: i64) -> HashMap<String, bool> {
    rows.iter()
        .filter_map(|row| {
            let activity = row.window_activity_ms?;
            Some((row.name.clone(), now_ms - activity <= window_ms))
        })
        .collect()
}
