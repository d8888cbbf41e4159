//! Reclaiming tmux sessions that nothing uses anymore.

mod orphan;
mod stale;

pub use orphan::{KnownSessions, OrphanCollector, OrphanReport};
pub use stale::{StaleCollector, StaleReport};

use tracing::info;

use crate::error::TmuxError;
use crate::tmux::{tags, TagQuery};

/// Kill every session tagged with `workspace_id`, e.g. after the workspace is deleted
pub async fn reclaim_workspace_sessions(
    query: &dyn TagQuery,
    workspace_id: &str,
) -> Result<usize, TmuxError> {
    let filter = [(tags::APP, tags::APP_MARKER), (tags::WORKSPACE, workspace_id)];
    let killed = query.kill_sessions_matching(&filter, None).await?;
    info!(workspace = %workspace_id, killed, "Reclaimed workspace sessions");
    Ok(killed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmux::memory::MemoryTmux;

    #[tokio::test]
    async fn test_reclaim_only_touches_that_workspace() {
        let tmux = MemoryTmux::new();
        tmux.add_session("a1", &[(tags::APP, "1"), (tags::WORKSPACE, "ws-a")]);
        tmux.add_session("a2", &[(tags::APP, "1"), (tags::WORKSPACE, "ws-a")]);
        tmux.add_session("b1", &[(tags::APP, "1"), (tags::WORKSPACE, "ws-b")]);
        tmux.add_session("foreign", &[(tags::WORKSPACE, "ws-a")]);

        let killed = reclaim_workspace_sessions(&tmux, "ws-a").await.unwrap();
        assert_eq!(killed, 2);
        assert!(tmux.has_session("b1"));
        assert!(tmux.has_session("foreign"));
    }
}
