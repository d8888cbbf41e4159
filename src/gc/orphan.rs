use std::collections::HashSet;

use tracing::{debug, info, warn};

use crate::config::GcConfig;
use crate::error::TmuxError;
use crate::facts::{self, Workspace};
use crate::tmux::{tags, SessionRow, TagQuery};

const ORPHAN_KEYS: &[&str] = &[tags::WORKSPACE, tags::CREATED_AT, tags::INSTANCE];

/// Workspaces and session names this instance knows about
#[derive(Debug, Clone, Default)]
pub struct KnownSessions {
    /// Includes workspaces that are still being created
    pub workspace_ids: HashSet<String>,
    pub session_names: HashSet<String>,
}

impl KnownSessions {
    pub fn from_workspaces(workspaces: &[Workspace]) -> Self {
        Self {
            workspace_ids: facts::known_workspace_ids(workspaces),
            session_names: facts::known_session_names(workspaces),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrphanReport {
    pub candidates: usize,
    pub killed: usize,
    pub skipped_attached: usize,
    pub skipped_grace: usize,
    pub errors: usize,
    /// The candidate count triggered a sweep across every instance's sessions
    pub global_sweep: bool,
}

/// Kills sessions tagged to workspaces that no longer exist
#[derive(Debug, Clone)]
pub struct OrphanCollector {
    instance_id: String,
    session_prefix: String,
    grace_period_ms: i64,
    global_sweep_threshold: usize,
    scope_to_instance: bool,
}

impl OrphanCollector {
    pub fn new(
        instance_id: impl Into<String>,
        session_prefix: impl Into<String>,
        config: &GcConfig,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            session_prefix: session_prefix.into(),
            grace_period_ms: config.grace_period_ms,
            global_sweep_threshold: config.global_sweep_threshold,
            scope_to_instance: config.scope_to_instance,
        }
    }

    /// One pass. Does nothing until session discovery has completed once,
    /// since before that every session would look orphaned.
    pub async fn collect(
        &self,
        query: &dyn TagQuery,
        known: &KnownSessions,
        discovery_complete: bool,
        now_ms: i64,
    ) -> Result<OrphanReport, TmuxError> {
        let mut report = OrphanReport::default();
        if !discovery_complete {
            debug!("Session discovery pending; skipping orphan pass");
            return Ok(report);
        }

        let mut filter = vec![(tags::APP, tags::APP_MARKER)];
        if self.scope_to_instance {
            filter.push((tags::INSTANCE, self.instance_id.as_str()));
        }
        let rows = query.list_sessions(&filter, ORPHAN_KEYS).await?;

        let candidates: Vec<&SessionRow> = rows
            .iter()
            .filter(|row| {
                row.tag(tags::WORKSPACE)
                    .is_some_and(|ws| !known.workspace_ids.contains(ws))
            })
            .collect();
        report.candidates = candidates.len();

        for row in &candidates {
            self.reap(query, row, now_ms, &mut report).await;
        }

        if candidates.len() > self.global_sweep_threshold {
            report.global_sweep = true;
            let handled: HashSet<&str> = candidates.iter().map(|row| row.name.as_str()).collect();
            match query.list_sessions(&[], &[tags::APP, tags::WORKSPACE, tags::CREATED_AT]).await {
                Ok(all) => {
                    for row in all.iter().filter(|row| !handled.contains(row.name.as_str())) {
                        if self.is_global_orphan(row, known) {
                            report.candidates += 1;
                            self.reap(query, row, now_ms, &mut report).await;
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Global orphan sweep failed");
                    report.errors += 1;
                }
            }
        }

        if report.killed > 0 || report.errors > 0 {
            info!(
                candidates = report.candidates,
                killed = report.killed,
                skipped_attached = report.skipped_attached,
                skipped_grace = report.skipped_grace,
                errors = report.errors,
                global_sweep = report.global_sweep,
                "Orphan session pass finished"
            );
        }
        Ok(report)
    }

    /// Orphans left by any instance, including ones whose tags never landed
    fn is_global_orphan(&self, row: &SessionRow, known: &KnownSessions) -> bool {
        let ours = row.is_app_session() || row.name.starts_with(&self.session_prefix);
        if !ours {
            return false;
        }
        match row.tag(tags::WORKSPACE) {
            Some(ws) => !known.workspace_ids.contains(ws),
            None => {
                row.name.starts_with(&self.session_prefix)
                    && !known.session_names.contains(&row.name)
            }
        }
    }

    async fn reap(
        &self,
        query: &dyn TagQuery,
        row: &SessionRow,
        now_ms: i64,
        report: &mut OrphanReport,
    ) {
        if row.attached_clients > 0 {
            report.skipped_attached += 1;
            return;
        }

        let created_at = match row.tag_ms(tags::CREATED_AT).or(row.created_at_ms) {
            Some(ms) => Some(ms),
            None => match query.session_created_at(&row.name).await {
                Ok(ms) => ms,
                Err(TmuxError::NoSession(_)) => return,
                Err(e) => {
                    warn!(session = %row.name, error = %e, "Failed to read session creation time");
                    report.errors += 1;
                    return;
                }
            },
        };
        // Unknown age counts as young
        let old_enough = created_at.is_some_and(|ms| now_ms - ms >= self.grace_period_ms);
        if !old_enough {
            report.skipped_grace += 1;
            return;
        }

        // Someone may have attached since the listing
        match query.session_has_clients(&row.name).await {
            Ok(true) => {
                report.skipped_attached += 1;
                return;
            }
            Ok(false) => {}
            Err(TmuxError::NoSession(_)) => return,
            Err(e) => {
                warn!(session = %row.name, error = %e, "Failed to check session clients");
                report.errors += 1;
                return;
            }
        }

        match query.kill_session(&row.name).await {
            Ok(()) => {
                info!(
                    session = %row.name,
                    workspace = row.tag(tags::WORKSPACE).unwrap_or("-"),
                    "Killed orphan session"
                );
                report.killed += 1;
            }
            Err(TmuxError::NoSession(_)) => {}
            Err(e) => {
                warn!(session = %row.name, error = %e, "Failed to kill orphan session");
                report.errors += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facts::fixtures::{chat_tab, workspace};
    use crate::tmux::memory::MemoryTmux;

    const NOW: i64 = 1_700_000_000_000;
    const OLD: i64 = NOW - 60_000;

    fn collector(config: &GcConfig) -> OrphanCollector {
        OrphanCollector::new("me", "agent-deck-", config)
    }

    fn known() -> KnownSessions {
        KnownSessions::from_workspaces(&[workspace(
            "ws-live",
            vec![chat_tab("t", "agent-deck-live")],
        )])
    }

    fn add_tagged(tmux: &MemoryTmux, name: &str, ws: &str, created_at: i64) {
        tmux.add_session(
            name,
            &[
                (tags::APP, "1"),
                (tags::WORKSPACE, ws),
                (tags::CREATED_AT, &created_at.to_string()),
            ],
        );
    }

    #[tokio::test]
    async fn test_kills_old_clientless_orphans_only() {
        let tmux = MemoryTmux::new();
        add_tagged(&tmux, "agent-deck-live", "ws-live", OLD);
        add_tagged(&tmux, "agent-deck-orphan", "ws-deleted", OLD);
        add_tagged(&tmux, "agent-deck-young", "ws-deleted", NOW - 5_000);
        add_tagged(&tmux, "agent-deck-watched", "ws-deleted", OLD);
        tmux.update("agent-deck-watched", |s| s.attached_clients = 1);

        let report = collector(&GcConfig::default())
            .collect(&tmux, &known(), true, NOW)
            .await
            .unwrap();

        assert_eq!(tmux.killed(), vec!["agent-deck-orphan"]);
        assert_eq!(
            report,
            OrphanReport {
                candidates: 3,
                killed: 1,
                skipped_attached: 1,
                skipped_grace: 1,
                errors: 0,
                global_sweep: false,
            }
        );
    }

    #[tokio::test]
    async fn test_nothing_happens_before_discovery() {
        let tmux = MemoryTmux::new();
        add_tagged(&tmux, "agent-deck-orphan", "ws-deleted", OLD);

        let report = collector(&GcConfig::default())
            .collect(&tmux, &KnownSessions::default(), false, NOW)
            .await
            .unwrap();
        assert_eq!(report, OrphanReport::default());
        assert!(tmux.has_session("agent-deck-orphan"));
    }

    #[tokio::test]
    async fn test_creating_workspace_is_protected() {
        let tmux = MemoryTmux::new();
        add_tagged(&tmux, "agent-deck-new", "ws-new", OLD);
        let mut creating = workspace("ws-new", vec![]);
        creating.creating = true;

        let report = collector(&GcConfig::default())
            .collect(&tmux, &KnownSessions::from_workspaces(&[creating]), true, NOW)
            .await
            .unwrap();
        assert_eq!(report.candidates, 0);
        assert!(tmux.killed().is_empty());
    }

    #[tokio::test]
    async fn test_falls_back_to_tmux_creation_time() {
        let tmux = MemoryTmux::new();
        tmux.add_session("agent-deck-a", &[(tags::APP, "1"), (tags::WORKSPACE, "ws-x")]);
        tmux.update("agent-deck-a", |s| s.created_at_ms = Some(NOW - 1_000));
        tmux.add_session("agent-deck-b", &[(tags::APP, "1"), (tags::WORKSPACE, "ws-x")]);
        tmux.update("agent-deck-b", |s| s.created_at_ms = Some(OLD));
        tmux.add_session("agent-deck-c", &[(tags::APP, "1"), (tags::WORKSPACE, "ws-x")]);

        let report = collector(&GcConfig::default())
            .collect(&tmux, &known(), true, NOW)
            .await
            .unwrap();
        assert_eq!(tmux.killed(), vec!["agent-deck-b"]);
        assert_eq!(report.skipped_grace, 2);
    }

    #[tokio::test]
    async fn test_instance_scope_ignores_other_instances() {
        let tmux = MemoryTmux::new();
        add_tagged(&tmux, "agent-deck-mine", "ws-gone", OLD);
        tmux.set_tag("agent-deck-mine", tags::INSTANCE, "me");
        add_tagged(&tmux, "agent-deck-theirs", "ws-gone", OLD);
        tmux.set_tag("agent-deck-theirs", tags::INSTANCE, "other");

        let config = GcConfig {
            scope_to_instance: true,
            ..GcConfig::default()
        };
        collector(&config)
            .collect(&tmux, &known(), true, NOW)
            .await
            .unwrap();
        assert_eq!(tmux.killed(), vec!["agent-deck-mine"]);
    }

    #[tokio::test]
    async fn test_large_candidate_set_triggers_global_sweep() {
        let tmux = MemoryTmux::new();
        for i in 0..3 {
            let name = format!("agent-deck-mine-{i}");
            add_tagged(&tmux, &name, "ws-gone", OLD);
            tmux.set_tag(&name, tags::INSTANCE, "me");
        }
        // Another instance's leftover, and one whose tags never landed
        add_tagged(&tmux, "agent-deck-crashed", "ws-gone", OLD);
        tmux.set_tag("agent-deck-crashed", tags::INSTANCE, "dead");
        tmux.add_session("agent-deck-untagged", &[]);
        tmux.update("agent-deck-untagged", |s| s.created_at_ms = Some(OLD));
        // Not ours at all, and a known tab without tags
        tmux.add_session("scratch", &[]);
        tmux.add_session("agent-deck-live", &[]);
        tmux.update("agent-deck-live", |s| s.created_at_ms = Some(OLD));

        let config = GcConfig {
            scope_to_instance: true,
            global_sweep_threshold: 2,
            ..GcConfig::default()
        };
        let report = collector(&config)
            .collect(&tmux, &known(), true, NOW)
            .await
            .unwrap();

        assert!(report.global_sweep);
        assert_eq!(report.killed, 5);
        assert!(tmux.has_session("scratch"));
        assert!(tmux.has_session("agent-deck-live"));
        assert!(!tmux.has_session("agent-deck-crashed"));
        assert!(!tmux.has_session("agent-deck-untagged"));
    }

    #[tokio::test]
    async fn test_unreachable_tmux_is_an_error() {
        let tmux = MemoryTmux::new();
        tmux.set_unavailable(true);
        let err = collector(&GcConfig::default())
            .collect(&tmux, &known(), true, NOW)
            .await
            .unwrap_err();
        assert!(err.is_unavailable());
    }
}
