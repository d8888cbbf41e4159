//! In-memory [`TagQuery`] used by the tests.
//!
//! Every operation yields to the scheduler before touching state, so two
//! futures driven by `tokio::join!` interleave one operation at a time.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{SessionRow, TagFilter, TagQuery};
use crate::error::TmuxError;

#[derive(Debug, Clone)]
pub(crate) struct FakeSession {
    pub tags: HashMap<String, String>,
    pub created_at_ms: Option<i64>,
    pub attached_clients: usize,
    pub window_activity_ms: Option<i64>,
    pub has_live_pane: bool,
    pub content: String,
    pub capture_fails: bool,
}

impl Default for FakeSession {
    fn default() -> Self {
        Self {
            tags: HashMap::new(),
            created_at_ms: None,
            attached_clients: 0,
            window_activity_ms: None,
            has_live_pane: true,
            content: String::new(),
            capture_fails: false,
        }
    }
}

#[derive(Debug, Default)]
struct State {
    sessions: BTreeMap<String, FakeSession>,
    globals: HashMap<String, String>,
    killed: Vec<String>,
    captures: Vec<String>,
    unavailable: bool,
}

#[derive(Debug, Default)]
pub(crate) struct MemoryTmux {
    state: Mutex<State>,
}

impl MemoryTmux {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_session(&self, name: &str, tags: &[(&str, &str)]) {
        let session = FakeSession {
            tags: tags
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..FakeSession::default()
        };
        self.state
            .lock()
            .unwrap()
            .sessions
            .insert(name.to_string(), session);
    }

    pub fn update(&self, name: &str, f: impl FnOnce(&mut FakeSession)) {
        let mut state = self.state.lock().unwrap();
        f(state.sessions.get_mut(name).expect("session exists"));
    }

    pub fn set_content(&self, name: &str, content: &str) {
        self.update(name, |s| s.content = content.to_string());
    }

    pub fn set_tag(&self, name: &str, key: &str, value: &str) {
        self.update(name, |s| {
            s.tags.insert(key.to_string(), value.to_string());
        });
    }

    pub fn remove_session(&self, name: &str) {
        self.state.lock().unwrap().sessions.remove(name);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unwrap().unavailable = unavailable;
    }

    pub fn has_session(&self, name: &str) -> bool {
        self.state.lock().unwrap().sessions.contains_key(name)
    }

    pub fn killed(&self) -> Vec<String> {
        self.state.lock().unwrap().killed.clone()
    }

    /// Sessions whose pane was captured, in call order
    pub fn captures(&self) -> Vec<String> {
        self.state.lock().unwrap().captures.clone()
    }

    pub fn global(&self, key: &str) -> Option<String> {
        self.state.lock().unwrap().globals.get(key).cloned()
    }

    pub fn set_global(&self, key: &str, value: &str) {
        self.state
            .lock()
            .unwrap()
            .globals
            .insert(key.to_string(), value.to_string());
    }

    fn check(&self) -> Result<(), TmuxError> {
        if self.state.lock().unwrap().unavailable {
            return Err(TmuxError::Unavailable("no server running".into()));
        }
        Ok(())
    }
}

fn row(name: &str, session: &FakeSession) -> SessionRow {
    SessionRow {
        name: name.to_string(),
        tags: session.tags.clone(),
        created_at_ms: session.created_at_ms,
        attached_clients: session.attached_clients,
        window_activity_ms: session.window_activity_ms,
        has_live_pane: session.has_live_pane,
    }
}

#[async_trait]
impl TagQuery for MemoryTmux {
    async fn list_sessions(
        &self,
        filter: TagFilter<'_>,
        _keys: &[&str],
    ) -> Result<Vec<SessionRow>, TmuxError> {
        tokio::task::yield_now().await;
        self.check()?;
        let state = self.state.lock().unwrap();
        Ok(state
            .sessions
            .iter()
            .map(|(name, session)| row(name, session))
            .filter(|row| row.matches(filter))
            .collect())
    }

    async fn get_global_option(&self, key: &str) -> Result<Option<String>, TmuxError> {
        tokio::task::yield_now().await;
        self.check()?;
        Ok(self.global(key).filter(|v| !v.is_empty()))
    }

    async fn set_global_option(&self, key: &str, value: &str) -> Result<(), TmuxError> {
        tokio::task::yield_now().await;
        self.check()?;
        self.set_global(key, value);
        Ok(())
    }

    async fn unset_global_option(&self, key: &str) -> Result<(), TmuxError> {
        tokio::task::yield_now().await;
        self.check()?;
        self.state.lock().unwrap().globals.remove(key);
        Ok(())
    }

    async fn capture_tail(&self, session: &str, lines: usize) -> Option<String> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock().unwrap();
        if state.unavailable {
            return None;
        }
        state.captures.push(session.to_string());
        let fake = state.sessions.get(session)?;
        if fake.capture_fails {
            return None;
        }
        let all: Vec<&str> = fake.content.lines().collect();
        Some(all[all.len().saturating_sub(lines)..].join("\n"))
    }

    async fn session_has_clients(&self, session: &str) -> Result<bool, TmuxError> {
        tokio::task::yield_now().await;
        self.check()?;
        let state = self.state.lock().unwrap();
        state
            .sessions
            .get(session)
            .map(|s| s.attached_clients > 0)
            .ok_or_else(|| TmuxError::NoSession(session.to_string()))
    }

    async fn session_created_at(&self, session: &str) -> Result<Option<i64>, TmuxError> {
        tokio::task::yield_now().await;
        self.check()?;
        let state = self.state.lock().unwrap();
        state
            .sessions
            .get(session)
            .map(|s| s.created_at_ms)
            .ok_or_else(|| TmuxError::NoSession(session.to_string()))
    }

    async fn kill_session(&self, session: &str) -> Result<(), TmuxError> {
        tokio::task::yield_now().await;
        self.check()?;
        let mut state = self.state.lock().unwrap();
        if state.sessions.remove(session).is_none() {
            return Err(TmuxError::NoSession(session.to_string()));
        }
        state.killed.push(session.to_string());
        Ok(())
    }

    async fn kill_sessions_matching(
        &self,
        filter: TagFilter<'_>,
        name_prefix: Option<&str>,
    ) -> Result<usize, TmuxError> {
        tokio::task::yield_now().await;
        self.check()?;
        let mut state = self.state.lock().unwrap();
        let doomed: Vec<String> = state
            .sessions
            .iter()
            .filter(|(name, session)| {
                row(name, session).matches(filter)
                    && name_prefix.map_or(true, |prefix| name.starts_with(prefix))
            })
            .map(|(name, _)| name.clone())
            .collect();
        for name in &doomed {
            state.sessions.remove(name);
            state.killed.push(name.clone());
        }
        Ok(doomed.len())
    }
}
