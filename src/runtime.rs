//! The owner task: timers in, background work out, results merged back.
//!
//! [`Deck`] is not `Sync` and never shared. Every piece of tmux I/O runs in a
//! spawned task over owned copies of what it needs and reports back through
//! a [`DeckMessage`]; only [`Deck::handle`] mutates state.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::activity::TagClassifier;
use crate::clock;
use crate::config::Config;
use crate::coordinator::{ScanCoordinator, ScanRole};
use crate::events::{DeckEvent, EventSink, ReclaimReason};
use crate::facts::{self, Workspace};
use crate::gc::{self, KnownSessions, OrphanCollector, OrphanReport, StaleCollector, StaleReport};
use crate::registry;
use crate::scheduler::{run_scan, ApplyOutcome, ScanContext, ScanRequest, ScanResult, ScanScheduler};
use crate::tmux::TagQuery;

/// Results of background work, delivered to the owner task
#[derive(Debug)]
pub enum DeckMessage {
    ScanCompleted(ScanResult),
    OrphanPassCompleted(Result<OrphanReport, String>),
    StalePassCompleted(Result<StaleReport, String>),
    WorkspacesLoaded(Result<Vec<Workspace>, String>),
    WorkspaceReclaimed {
        workspace_id: String,
        result: Result<usize, String>,
    },
}

pub struct Deck {
    query: Arc<dyn TagQuery>,
    scan_ctx: ScanContext,
    orphan: Arc<OrphanCollector>,
    stale: Arc<StaleCollector>,
    scheduler: ScanScheduler,
    workspaces: Vec<Workspace>,
    registry_path: Option<PathBuf>,
    registry_loaded: bool,
    orphan_in_flight: bool,
    stale_in_flight: bool,
    registry_in_flight: bool,
    tx: mpsc::UnboundedSender<DeckMessage>,
    sink: Box<dyn EventSink>,
}

impl Deck {
    pub fn new(
        config: &Config,
        query: Arc<dyn TagQuery>,
        tx: mpsc::UnboundedSender<DeckMessage>,
        sink: Box<dyn EventSink>,
    ) -> Self {
        let instance_id = config.resolved_instance_id();
        info!(instance = %instance_id, "Starting deck runtime");

        let registry_path = config.resolved_registry_path();
        Self {
            scan_ctx: ScanContext {
                query: query.clone(),
                coordinator: ScanCoordinator::new(instance_id.clone(), &config.lease),
                classifier: TagClassifier::new(&config.activity),
                window_recent_ms: config.activity.window_recent_ms,
            },
            orphan: Arc::new(OrphanCollector::new(
                instance_id,
                config.session_prefix.clone(),
                &config.gc,
            )),
            stale: Arc::new(StaleCollector::new(&config.gc)),
            query,
            scheduler: ScanScheduler::new(),
            workspaces: Vec::new(),
            // Without a registry there is nothing to wait for
            registry_loaded: registry_path.is_none(),
            registry_path,
            orphan_in_flight: false,
            stale_in_flight: false,
            registry_in_flight: false,
            tx,
            sink,
        }
    }

    pub fn workspaces(&self) -> &[Workspace] {
        &self.workspaces
    }

    /// Replace the known workspaces directly, bypassing the registry file
    pub fn set_workspaces(&mut self, workspaces: Vec<Workspace>) {
        self.workspaces = workspaces;
        self.registry_loaded = true;
    }

    pub fn active_workspaces(&self) -> &BTreeSet<String> {
        self.scheduler.active_workspaces()
    }

    pub fn role(&self) -> Option<ScanRole> {
        self.scheduler.last_role()
    }

    pub fn epoch(&self) -> u64 {
        self.scheduler.last_epoch()
    }

    pub fn instance_id(&self) -> &str {
        self.scan_ctx.coordinator.instance_id()
    }

    pub fn query(&self) -> Arc<dyn TagQuery> {
        self.query.clone()
    }

    /// Scan timer fired, or the user asked for a rescan
    pub fn on_scan_tick(&mut self) {
        if let Some(request) = self.scheduler.on_tick(&self.workspaces) {
            self.dispatch_scan(request);
        }
    }

    pub fn on_orphan_tick(&mut self) {
        if self.orphan_in_flight {
            return;
        }
        let discovery_complete = self.registry_loaded && self.scheduler.discovery_complete();
        let known = KnownSessions::from_workspaces(&self.workspaces);
        let collector = self.orphan.clone();
        let query = self.query.clone();
        let tx = self.tx.clone();

        self.orphan_in_flight = true;
        tokio::spawn(async move {
            let result = collector
                .collect(query.as_ref(), &known, discovery_complete, clock::now_ms())
                .await
                .map_err(|e| e.to_string());
            let _ = tx.send(DeckMessage::OrphanPassCompleted(result));
        });
    }

    pub fn on_stale_tick(&mut self) {
        if self.stale_in_flight {
            return;
        }
        let role = self.scheduler.last_role();
        let collector = self.stale.clone();
        let query = self.query.clone();
        let tx = self.tx.clone();

        self.stale_in_flight = true;
        tokio::spawn(async move {
            let result = collector
                .collect(query.as_ref(), role, clock::now_ms())
                .await
                .map_err(|e| e.to_string());
            let _ = tx.send(DeckMessage::StalePassCompleted(result));
        });
    }

    pub fn on_registry_tick(&mut self) {
        let Some(path) = self.registry_path.clone() else {
            return;
        };
        if self.registry_in_flight {
            return;
        }
        let tx = self.tx.clone();

        self.registry_in_flight = true;
        tokio::spawn(async move {
            let result = registry::load_workspaces(&path)
                .await
                .map_err(|e| format!("{e:#}"));
            let _ = tx.send(DeckMessage::WorkspacesLoaded(result));
        });
    }

    pub fn reclaim_workspace(&mut self, workspace_id: &str) {
        let query = self.query.clone();
        let tx = self.tx.clone();
        let workspace_id = workspace_id.to_string();

        tokio::spawn(async move {
            let result = gc::reclaim_workspace_sessions(query.as_ref(), &workspace_id)
                .await
                .map_err(|e| e.to_string());
            let _ = tx.send(DeckMessage::WorkspaceReclaimed {
                workspace_id,
                result,
            });
        });
    }

    pub fn handle(&mut self, message: DeckMessage) {
        match message {
            DeckMessage::ScanCompleted(result) => self.apply_scan(result),
            DeckMessage::OrphanPassCompleted(result) => {
                self.orphan_in_flight = false;
                match result {
                    Ok(report) if report.killed > 0 => {
                        self.sink.emit(DeckEvent::SessionsReclaimed {
                            count: report.killed,
                            reason: ReclaimReason::Orphan,
                        })
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "Orphan pass skipped"),
                }
            }
            DeckMessage::StalePassCompleted(result) => {
                self.stale_in_flight = false;
                match result {
                    Ok(report) if report.killed > 0 => {
                        self.sink.emit(DeckEvent::SessionsReclaimed {
                            count: report.killed,
                            reason: ReclaimReason::Stale,
                        })
                    }
                    Ok(report) => debug!(?report, "Stale pass finished"),
                    Err(e) => warn!(error = %e, "Stale pass skipped"),
                }
            }
            DeckMessage::WorkspacesLoaded(result) => {
                self.registry_in_flight = false;
                match result {
                    Ok(mut workspaces) => {
                        facts::carry_over_stopped(&self.workspaces, &mut workspaces);
                        self.workspaces = workspaces;
                        self.registry_loaded = true;
                    }
                    // Keep the last good list rather than orphaning everything
                    Err(e) => warn!(error = %e, "Failed to load workspace registry"),
                }
            }
            DeckMessage::WorkspaceReclaimed {
                workspace_id,
                result,
            } => match result {
                Ok(count) => self.sink.emit(DeckEvent::SessionsReclaimed {
                    count,
                    reason: ReclaimReason::Workspace,
                }),
                Err(e) => {
                    warn!(workspace = %workspace_id, error = %e, "Failed to reclaim workspace")
                }
            },
        }
    }

    /// Release the scan lease if this instance holds it
    pub async fn shutdown(&self) {
        if let Err(e) = self.scan_ctx.coordinator.release(self.query.as_ref()).await {
            warn!(error = %e, "Failed to release scan lease");
        }
    }

    fn dispatch_scan(&self, request: ScanRequest) {
        let ctx = self.scan_ctx.clone();
        let tx = self.tx.clone();
        debug!(token = request.token, "Dispatching activity scan");
        tokio::spawn(async move {
            let result = run_scan(&ctx, request, clock::now_ms()).await;
            let _ = tx.send(DeckMessage::ScanCompleted(result));
        });
    }

    fn apply_scan(&mut self, result: ScanResult) {
        let previous = (self.scheduler.last_role(), self.scheduler.last_epoch());

        let outcome = self.scheduler.apply_result(result);
        let (active_changed, stopped_tabs, rescan_due) = match outcome {
            ApplyOutcome::Stale => return,
            ApplyOutcome::Applied {
                active_changed,
                stopped_tabs,
                rescan_due,
            } => (active_changed, stopped_tabs, rescan_due),
        };

        let current = (self.scheduler.last_role(), self.scheduler.last_epoch());
        if let (Some(role), true) = (current.0, current != previous) {
            info!(role = %role, epoch = current.1, "Scan role changed");
            self.sink.emit(DeckEvent::RoleChanged {
                role,
                epoch: current.1,
            });
        }

        for tab in stopped_tabs {
            let changed =
                facts::mark_tab_stopped(&mut self.workspaces, &tab.workspace_id, &tab.session_name);
            if changed {
                info!(
                    workspace = %tab.workspace_id,
                    session = %tab.session_name,
                    "Tab session stopped"
                );
                self.sink.emit(DeckEvent::TabStopped {
                    workspace_id: tab.workspace_id,
                    session_name: tab.session_name,
                });
            }
        }

        if active_changed {
            self.sink.emit(DeckEvent::ActiveWorkspacesChanged(
                self.scheduler.active_workspaces().clone(),
            ));
        }

        if rescan_due {
            let request = self.scheduler.start_scan(&self.workspaces);
            self.dispatch_scan(request);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facts::fixtures::{chat_tab, workspace};
    use crate::facts::TabStatus;
    use crate::tmux::memory::MemoryTmux;
    use crate::tmux::tags;

    type Harness = (
        Deck,
        mpsc::UnboundedReceiver<DeckMessage>,
        mpsc::UnboundedReceiver<DeckEvent>,
    );

    fn deck(tmux: Arc<MemoryTmux>, id: &str) -> Harness {
        let config = Config {
            instance_id: Some(id.to_string()),
            registry_path: Some(PathBuf::from("/nonexistent/agent-deck/workspaces.json")),
            ..Config::default()
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let deck = Deck::new(&config, tmux, tx, Box::new(event_tx));
        (deck, rx, event_rx)
    }

    fn drain(events: &mut mpsc::UnboundedReceiver<DeckEvent>) -> Vec<DeckEvent> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn test_scan_cycle_emits_role_activity_and_stopped_tabs() {
        let tmux = Arc::new(MemoryTmux::new());
        tmux.add_session("s-a", &[(tags::APP, "1"), (tags::WORKSPACE, "ws-a")]);
        tmux.set_content("s-a", "compiling...");

        let (mut deck, mut rx, mut events) = deck(tmux.clone(), "solo");
        deck.set_workspaces(vec![workspace(
            "ws-a",
            vec![chat_tab("t1", "s-a"), chat_tab("t2", "s-closed")],
        )]);

        deck.on_scan_tick();
        let message = rx.recv().await.unwrap();
        deck.handle(message);

        assert_eq!(deck.role(), Some(ScanRole::Owner));
        assert_eq!(deck.epoch(), 1);
        assert!(deck.active_workspaces().contains("ws-a"));
        assert_eq!(deck.workspaces()[0].tabs[1].status, TabStatus::Stopped);

        let events = drain(&mut events);
        assert_eq!(
            events,
            vec![
                DeckEvent::RoleChanged {
                    role: ScanRole::Owner,
                    epoch: 1
                },
                DeckEvent::TabStopped {
                    workspace_id: "ws-a".into(),
                    session_name: "s-closed".into(),
                },
                DeckEvent::ActiveWorkspacesChanged(["ws-a".to_string()].into_iter().collect()),
            ]
        );
    }

    #[tokio::test]
    async fn test_registry_reload_does_not_repeat_tab_stopped() {
        let tmux = Arc::new(MemoryTmux::new());
        tmux.add_session("s-a", &[(tags::APP, "1"), (tags::WORKSPACE, "ws-a")]);
        let registry = vec![workspace(
            "ws-a",
            vec![chat_tab("t1", "s-a"), chat_tab("t2", "s-closed")],
        )];
        let (mut deck, mut rx, mut events) = deck(tmux, "solo");

        let mut stopped = 0;
        for _ in 0..3 {
            deck.handle(DeckMessage::WorkspacesLoaded(Ok(registry.clone())));
            deck.on_scan_tick();
            deck.handle(rx.recv().await.unwrap());
            stopped += drain(&mut events)
                .iter()
                .filter(|event| matches!(event, DeckEvent::TabStopped { .. }))
                .count();
        }

        assert_eq!(stopped, 1);
        assert_eq!(deck.workspaces()[0].tabs[1].status, TabStatus::Stopped);
        assert_eq!(deck.workspaces()[0].tabs[0].status, TabStatus::Running);
    }

    #[tokio::test]
    async fn test_tick_during_scan_runs_one_follow_up() {
        let tmux = Arc::new(MemoryTmux::new());
        let (mut deck, mut rx, _events) = deck(tmux, "solo");
        deck.set_workspaces(Vec::new());

        deck.on_scan_tick();
        deck.on_scan_tick();
        deck.on_scan_tick();

        let first = rx.recv().await.unwrap();
        assert!(matches!(&first, DeckMessage::ScanCompleted(r) if r.token == 1));
        deck.handle(first);

        let follow_up = rx.recv().await.unwrap();
        assert!(matches!(&follow_up, DeckMessage::ScanCompleted(r) if r.token == 2));
        deck.handle(follow_up);

        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_orphan_pass_waits_for_discovery_then_reclaims() {
        let tmux = Arc::new(MemoryTmux::new());
        tmux.add_session(
            "agent-deck-old",
            &[
                (tags::APP, "1"),
                (tags::WORKSPACE, "ws-deleted"),
                (tags::CREATED_AT, "1"),
            ],
        );
        let (mut deck, mut rx, mut events) = deck(tmux.clone(), "solo");

        // Registry not loaded, no scan yet
        deck.on_orphan_tick();
        deck.handle(rx.recv().await.unwrap());
        assert!(tmux.has_session("agent-deck-old"));

        deck.set_workspaces(Vec::new());
        deck.on_scan_tick();
        deck.handle(rx.recv().await.unwrap());
        drain(&mut events);

        deck.on_orphan_tick();
        deck.handle(rx.recv().await.unwrap());
        assert!(!tmux.has_session("agent-deck-old"));
        assert_eq!(
            drain(&mut events),
            vec![DeckEvent::SessionsReclaimed {
                count: 1,
                reason: ReclaimReason::Orphan
            }]
        );
    }

    #[tokio::test]
    async fn test_follower_skips_stale_pass() {
        let tmux = Arc::new(MemoryTmux::new());
        let now = clock::now_ms();
        tmux.set_global(crate::tmux::options::SCAN_OWNER, "other");
        tmux.set_global(crate::tmux::options::SCAN_EPOCH, "4");
        tmux.set_global(crate::tmux::options::SCAN_HEARTBEAT_MS, &now.to_string());
        tmux.add_session(
            "agent-deck-dead",
            &[(tags::APP, "1"), (tags::TYPE, "agent"), (tags::CREATED_AT, "1")],
        );
        tmux.update("agent-deck-dead", |s| s.has_live_pane = false);

        let (mut deck, mut rx, _events) = deck(tmux.clone(), "me");
        deck.set_workspaces(Vec::new());
        deck.on_scan_tick();
        deck.handle(rx.recv().await.unwrap());
        assert_eq!(deck.role(), Some(ScanRole::Follower));

        deck.on_stale_tick();
        deck.handle(rx.recv().await.unwrap());
        assert!(tmux.has_session("agent-deck-dead"));
    }

    #[tokio::test]
    async fn test_shutdown_releases_lease() {
        let tmux = Arc::new(MemoryTmux::new());
        let (mut deck, mut rx, _events) = deck(tmux.clone(), "solo");
        deck.set_workspaces(Vec::new());
        deck.on_scan_tick();
        deck.handle(rx.recv().await.unwrap());
        assert_eq!(
            tmux.global(crate::tmux::options::SCAN_OWNER).as_deref(),
            Some("solo")
        );

        deck.shutdown().await;
        assert_eq!(tmux.global(crate::tmux::options::SCAN_OWNER), None);
    }

    #[tokio::test]
    async fn test_reclaim_workspace_reports_count() {
        let tmux = Arc::new(MemoryTmux::new());
        tmux.add_session("a", &[(tags::APP, "1"), (tags::WORKSPACE, "ws-a")]);
        let (mut deck, mut rx, mut events) = deck(tmux.clone(), "solo");

        deck.reclaim_workspace("ws-a");
        deck.handle(rx.recv().await.unwrap());
        assert!(!tmux.has_session("a"));
        assert_eq!(
            drain(&mut events),
            vec![DeckEvent::SessionsReclaimed {
                count: 1,
                reason: ReclaimReason::Workspace
            }]
        );
    }
}
