use tracing::{info, warn};

use crate::config::GcConfig;
use crate::coordinator::ScanRole;
use crate::error::TmuxError;
use crate::tmux::{tags, SessionRow, TagQuery};

const STALE_KEYS: &[&str] = &[tags::LAST_OUTPUT_AT, tags::LAST_INPUT_AT, tags::CREATED_AT];

/// Why each examined session was or was not killed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaleReport {
    pub examined: usize,
    pub killed: usize,
    /// This instance follows the scan owner, so the pass did not run
    pub skipped_follower: bool,
    pub skipped_recent: usize,
    pub skipped_live_pane: usize,
    pub skipped_attached: usize,
    pub skipped_unknown_age: usize,
    pub errors: usize,
}

/// Kills agent sessions that have been detached and silent for a long time,
/// even when their workspace still exists.
#[derive(Debug, Clone)]
pub struct StaleCollector {
    stale_after_ms: i64,
    live_pane_grace_ms: i64,
}

impl StaleCollector {
    pub fn new(config: &GcConfig) -> Self {
        Self {
            stale_after_ms: config.stale_after_ms,
            live_pane_grace_ms: config.live_pane_grace_ms,
        }
    }

    pub async fn collect(
        &self,
        query: &dyn TagQuery,
        role: Option<ScanRole>,
        now_ms: i64,
    ) -> Result<StaleReport, TmuxError> {
        let mut report = StaleReport::default();
        if role == Some(ScanRole::Follower) {
            report.skipped_follower = true;
            return Ok(report);
        }

        let filter = [(tags::APP, tags::APP_MARKER), (tags::TYPE, tags::TYPE_AGENT)];
        let rows = query.list_sessions(&filter, STALE_KEYS).await?;

        for row in &rows {
            report.examined += 1;

            let Some(last_activity) = last_activity_ms(row) else {
                report.skipped_unknown_age += 1;
                continue;
            };
            let idle_for = now_ms - last_activity;

            if idle_for < self.stale_after_ms {
                report.skipped_recent += 1;
                continue;
            }
            if row.has_live_pane && idle_for < self.stale_after_ms + self.live_pane_grace_ms {
                report.skipped_live_pane += 1;
                continue;
            }
            if row.attached_clients > 0 {
                report.skipped_attached += 1;
                continue;
            }

            match query.kill_session(&row.name).await {
                Ok(()) => {
                    info!(
                        session = %row.name,
                        idle_secs = idle_for / 1000,
                        live_pane = row.has_live_pane,
                        "Killed stale agent session"
                    );
                    report.killed += 1;
                }
                Err(TmuxError::NoSession(_)) => {}
                Err(e) => {
                    warn!(session = %row.name, error = %e, "Failed to kill stale agent session");
                    report.errors += 1;
                }
            }
        }

        Ok(report)
    }
}

/// Newest of the output/input tags, else the creation time
fn last_activity_ms(row: &SessionRow) -> Option<i64> {
    let output = row.tag_ms(tags::LAST_OUTPUT_AT);
    let input = row.tag_ms(tags::LAST_INPUT_AT);
    output
        .max(input)
        .or_else(|| row.tag_ms(tags::CREATED_AT))
        .or(row.created_at_ms)
}
