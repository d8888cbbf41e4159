//! Workspace/tab model and the session fact snapshot built from it.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TabStatus {
    #[default]
    Running,
    Stopped,
}

/// One tab of a workspace: the application's record of a tmux session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tab {
    pub id: String,
    pub session_name: String,
    /// Set for chat/agent tabs ("claude", "codex", ...); absent for plain terminals
    #[serde(default)]
    pub assistant: Option<String>,
    #[serde(default)]
    pub status: TabStatus,
}

impl Tab {
    pub fn is_chat(&self) -> bool {
        self.assistant
            .as_deref()
            .is_some_and(|assistant| !assistant.trim().is_empty())
    }
}

/// A logical unit of work backed by one git worktree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workspace {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub tabs: Vec<Tab>,
    /// Still being set up; its sessions may exist before it is fully registered
    #[serde(default)]
    pub creating: bool,
}

impl Workspace {
    /// The name, falling back to the id for unnamed workspaces
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

/// What the application knows about one live session name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionFact {
    pub workspace_id: String,
    pub tab_id: String,
    pub assistant: Option<String>,
    pub is_chat: bool,
    pub status: TabStatus,
}

pub type SessionFacts = HashMap<String, SessionFact>;

/// Map every tab's session name to its workspace/tab metadata
pub fn resolve_session_facts(workspaces: &[Workspace]) -> SessionFacts {
    workspaces
        .iter()
        .flat_map(|ws| {
            ws.tabs.iter().map(move |tab| {
                (
                    tab.session_name.clone(),
                    SessionFact {
                        workspace_id: ws.id.clone(),
                        tab_id: tab.id.clone(),
                        assistant: tab.assistant.clone(),
                        is_chat: tab.is_chat(),
                        status: tab.status,
                    },
                )
            })
        })
        .filter(|(name, _)| !name.is_empty())
        .collect()
}

/// Ids that must not be treated as orphaned, including workspaces still being created
pub fn known_workspace_ids(workspaces: &[Workspace]) -> HashSet<String> {
    workspaces.iter().map(|ws| ws.id.clone()).collect()
}

pub fn known_session_names(workspaces: &[Workspace]) -> HashSet<String> {
    workspaces
        .iter()
        .flat_map(|ws| ws.tabs.iter().map(|tab| tab.session_name.clone()))
        .collect()
}

/// A tab that is recorded as running, used to reconcile against live sessions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningTab {
    pub workspace_id: String,
    pub session_name: String,
}

pub fn running_tabs(workspaces: &[Workspace]) -> Vec<RunningTab> {
    workspaces
        .iter()
        .flat_map(|ws| {
            ws.tabs
                .iter()
                .filter(|tab| tab.status == TabStatus::Running && !tab.session_name.is_empty())
                .map(move |tab| RunningTab {
                    workspace_id: ws.id.clone(),
                    session_name: tab.session_name.clone(),
                })
        })
        .collect()
}

/// Mark the tab backing `session_name` stopped; returns whether anything changed
pub fn mark_tab_stopped(
    workspaces: &mut [Workspace],
    workspace_id: &str,
    session_name: &str,
) -> bool {
    let mut changed = false;
    for tab in workspaces
        .iter_mut()
        .filter(|ws| ws.id == workspace_id)
        .flat_map(|ws| ws.tabs.iter_mut())
    {
        if tab.session_name == session_name && tab.status != TabStatus::Stopped {
            tab.status = TabStatus::Stopped;
            changed = true;
        }
    }
    changed
}

/// Keep tabs already seen stopped in `previous` stopped in a reloaded list.
///
/// The registry is written by another process and may still say running for
/// a session whose exit has already been reported here.
pub fn carry_over_stopped(previous: &[Workspace], reloaded: &mut [Workspace]) {
    let stopped: HashSet<(&str, &str)> = previous
        .iter()
        .flat_map(|ws| {
            ws.tabs
                .iter()
                .filter(|tab| tab.status == TabStatus::Stopped)
                .map(move |tab| (ws.id.as_str(), tab.session_name.as_str()))
        })
        .collect();
    if stopped.is_empty() {
        return;
    }

    for ws in reloaded.iter_mut() {
        for tab in &mut ws.tabs {
            if stopped.contains(&(ws.id.as_str(), tab.session_name.as_str())) {
                tab.status = TabStatus::Stopped;
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn chat_tab(id: &str, session: &str) -> Tab {
        Tab {
            id: id.to_string(),
            session_name: session.to_string(),
            assistant: Some("claude".to_string()),
            status: TabStatus::Running,
        }
    }

    pub fn terminal_tab(id: &str, session: &str) -> Tab {
        Tab {
            id: id.to_string(),
            session_name: session.to_string(),
            assistant: None,
            status: TabStatus::Running,
        }
    }

    pub fn workspace(id: &str, tabs: Vec<Tab>) -> Workspace {
        Workspace {
            id: id.to_string(),
            name: id.to_string(),
            tabs,
            creating: false,
        }
    }
}
