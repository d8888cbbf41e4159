use std::collections::{BTreeSet, HashMap};

use tracing::debug;

use super::hysteresis::{
    FallbackReason, FallbackTarget, HysteresisEngine, SessionActivityState,
};
use crate::config::ActivityConfig;
use crate::facts::SessionFacts;
use crate::tmux::{content_digest, tags, SessionRow, TagQuery};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclaredType {
    Agent,
    Terminal,
}

impl DeclaredType {
    fn parse(value: &str) -> Option<Self> {
        match value {
            tags::TYPE_AGENT => Some(DeclaredType::Agent),
            tags::TYPE_TERMINAL => Some(DeclaredType::Terminal),
            _ => None,
        }
    }
}

/// Tag values of one session, read once per scan
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaggedSession {
    pub name: String,
    pub workspace_id: Option<String>,
    pub tab_id: Option<String>,
    pub declared_type: Option<DeclaredType>,
    pub last_output_ms: Option<i64>,
    pub last_input_ms: Option<i64>,
    /// Carries the application marker
    pub tagged: bool,
}

impl TaggedSession {
    pub fn from_row(row: &SessionRow) -> Self {
        Self {
            name: row.name.clone(),
            workspace_id: row.tag(tags::WORKSPACE).map(str::to_string),
            tab_id: row.tag(tags::TAB).map(str::to_string),
            declared_type: row.tag(tags::TYPE).and_then(DeclaredType::parse).or_else(|| {
                // Sessions launched for an assistant are agents even without a type tag
                row.tag(tags::ASSISTANT).map(|_| DeclaredType::Agent)
            }),
            last_output_ms: row.tag_ms(tags::LAST_OUTPUT_AT),
            last_input_ms: row.tag_ms(tags::LAST_INPUT_AT),
            tagged: row.is_app_session(),
        }
    }
}

/// Where a session's activity decision comes from this scan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Not a chat/agent session
    Skip,
    /// Fresh output tag; active without looking at content
    TagActive,
    Fallback(FallbackReason),
}

pub struct ClassifierInput<'a> {
    pub sessions: &'a [TaggedSession],
    pub facts: &'a SessionFacts,
    /// Session name to "its window had output recently"
    pub window_recent: &'a HashMap<String, bool>,
    pub now_ms: i64,
}

#[derive(Debug, Clone, Default)]
pub struct Classification {
    pub active_workspaces: BTreeSet<String>,
    pub active_sessions: BTreeSet<String>,
    /// States for every session classified this scan; anything else was reset
    pub states: HashMap<String, SessionActivityState>,
}

/// Tag fast path in front of the hysteresis engine
#[derive(Debug, Clone)]
pub struct TagClassifier {
    config: ActivityConfig,
    engine: HysteresisEngine,
}

impl TagClassifier {
    pub fn new(config: &ActivityConfig) -> Self {
        Self {
            config: config.clone(),
            engine: HysteresisEngine::new(config),
        }
    }

    pub fn route(&self, session: &TaggedSession, facts: &SessionFacts, now_ms: i64) -> Route {
        let is_chat = match facts.get(&session.name) {
            Some(fact) => fact.is_chat,
            None => session.declared_type == Some(DeclaredType::Agent),
        };
        if !is_chat {
            return Route::Skip;
        }

        if let Some(output_ms) = session.last_output_ms {
            let age = now_ms - output_ms;
            let fresh = (0..=self.config.output_window_ms).contains(&age);
            let echo = session.last_input_ms.is_some_and(|input_ms| {
                (0..=self.config.echo_window_ms).contains(&(output_ms - input_ms))
            });

            if fresh && !echo {
                return Route::TagActive;
            }
            if !fresh {
                return Route::Fallback(FallbackReason::StaleTag);
            }
        }

        let typing = session.last_input_ms.is_some_and(|input_ms| {
            (0..=self.config.input_suppress_window_ms).contains(&(now_ms - input_ms))
        });
        if typing {
            return Route::Fallback(FallbackReason::InputSuppressed);
        }

        Route::Fallback(FallbackReason::Untagged)
    }

    /// Classify every session, consuming the previous states.
    ///
    /// States of sessions that are skipped or no longer listed are dropped,
    /// so a session that comes back starts from a first observation.
    pub async fn classify(
        &self,
        query: &dyn TagQuery,
        input: ClassifierInput<'_>,
        mut previous: HashMap<String, SessionActivityState>,
    ) -> Classification {
        let mut states = HashMap::with_capacity(input.sessions.len());
        let mut active_sessions = BTreeSet::new();
        let mut targets = Vec::new();

        for session in input.sessions {
            let route = self.route(session, input.facts, input.now_ms);
            debug!(
                session = %session.name,
                tab = session.tab_id.as_deref().unwrap_or("-"),
                route = ?route,
                "classified session"
            );

            let mut state = match route {
                Route::Skip => continue,
                _ => previous.remove(&session.name).unwrap_or_default(),
            };

            match route {
                Route::Skip => {}
                Route::TagActive => {
                    // Keep the baseline current so that when the tag goes
                    // stale the fallback compares against recent content.
                    if let Some(content) = query
                        .capture_tail(&session.name, self.config.capture_lines)
                        .await
                    {
                        state.seed(content_digest(&content));
                    }
                    active_sessions.insert(session.name.clone());
                }
                Route::Fallback(reason) => {
                    if reason == FallbackReason::StaleTag {
                        state.clamp_for_fallback(self.engine.threshold());
                    }
                    targets.push(FallbackTarget {
                        session: session.name.clone(),
                        reason,
                        window_recent: input.window_recent.get(&session.name).copied(),
                    });
                }
            }

            states.insert(session.name.clone(), state);
        }

        let fallback_active = self
            .engine
            .run(query, &targets, &mut states, input.now_ms)
            .await;
        active_sessions.extend(fallback_active);

        let by_name: HashMap<&str, &TaggedSession> = input
            .sessions
            .iter()
            .map(|session| (session.name.as_str(), session))
            .collect();
        let active_workspaces = active_sessions
            .iter()
            .filter_map(|name| {
                input
                    .facts
                    .get(name)
                    .map(|fact| fact.workspace_id.clone())
                    .or_else(|| by_name.get(name.as_str())?.workspace_id.clone())
            })
            .collect();

        Classification {
            active_workspaces,
            active_sessions,
            states,
        }
    }
}
