use std::collections::{BTreeSet, HashMap};

use tracing::trace;

use crate::config::ActivityConfig;
use crate::tmux::{content_digest, ContentDigest, TagQuery};

/// Per-session content-delta history, owned by the scheduler
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionActivityState {
    pub last_digest: ContentDigest,
    /// Always within `[0, score_max]`
    pub score: u8,
    /// Last time the score reached the active threshold on a change
    pub hold_since_ms: Option<i64>,
    /// Whether `last_digest` holds a real baseline
    pub initialized: bool,
}

impl SessionActivityState {
    /// Forget everything; the next observation is a first observation
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Used when a stale tag hands the session back to content detection,
    /// so an old hold window or a high score cannot carry the session.
    pub fn clamp_for_fallback(&mut self, threshold: u8) {
        self.score = self.score.min(threshold);
        self.hold_since_ms = None;
    }

    /// Record `digest` as the baseline without touching the score
    pub fn seed(&mut self, digest: ContentDigest) {
        self.last_digest = digest;
        self.initialized = true;
    }

    fn decay(&mut self) {
        self.score = self.score.saturating_sub(1);
    }
}

/// Outcome of looking at a pane this scan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// Capture failed or was suppressed
    Failed,
    /// tmux reports no window activity; equivalent to an unchanged capture
    Quiet,
    Captured(ContentDigest),
}

/// How a session arrived at content-delta detection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackReason {
    /// No usable tag, or a tracked tab whose tags are ambiguous
    Untagged,
    /// The last-output tag is old or dated in the future
    StaleTag,
    /// The user typed recently; the pane is not captured this scan
    InputSuppressed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackTarget {
    pub session: String,
    pub reason: FallbackReason,
    /// From tmux window activity; `None` when unknown
    pub window_recent: Option<bool>,
}

/// Bounded-score classifier over successive pane digests.
///
/// A change adds 2, a quiet scan subtracts 1. With the default threshold
/// of 3 two consecutive deltas are needed to go active, which filters
/// one-off redraws while still reacting within two scans.
#[derive(Debug, Clone)]
pub struct HysteresisEngine {
    threshold: u8,
    score_max: u8,
    hold_ms: i64,
    capture_lines: usize,
}

impl HysteresisEngine {
    pub fn new(config: &ActivityConfig) -> Self {
        Self {
            threshold: config.threshold,
            score_max: config.score_max,
            hold_ms: config.hold_duration_ms,
            capture_lines: config.capture_lines,
        }
    }

    pub fn threshold(&self) -> u8 {
        self.threshold
    }

    /// Fold one observation into `state`.
    ///
    /// `baseline_idle` makes a first observation start at score 0 instead of
    /// the threshold.
    pub fn observe(
        &self,
        state: &mut SessionActivityState,
        observation: Observation,
        baseline_idle: bool,
        now_ms: i64,
    ) {
        let digest = match observation {
            Observation::Failed | Observation::Quiet => {
                state.decay();
                return;
            }
            Observation::Captured(digest) => digest,
        };

        if !state.initialized {
            state.seed(digest);
            // Newly discovered sessions are assumed busy, but without a hold
            // so one unchanged scan lets them drop out.
            state.score = if baseline_idle { 0 } else { self.threshold };
            state.hold_since_ms = None;
            return;
        }

        if digest == state.last_digest {
            state.decay();
            return;
        }

        state.score = state.score.saturating_add(2).min(self.score_max);
        state.last_digest = digest;
        if state.score >= self.threshold {
            state.hold_since_ms = Some(now_ms);
        }
    }

    pub fn is_active(&self, state: &SessionActivityState, now_ms: i64) -> bool {
        state.score >= self.threshold
            || state
                .hold_since_ms
                .is_some_and(|since| now_ms - since < self.hold_ms)
    }

    /// Capture and score every target, returning the sessions that are active.
    ///
    /// States for targets are created on demand; the caller decides what
    /// happens to sessions that are not targeted.
    pub async fn run(
        &self,
        query: &dyn TagQuery,
        targets: &[FallbackTarget],
        states: &mut HashMap<String, SessionActivityState>,
        now_ms: i64,
    ) -> BTreeSet<String> {
        let mut active = BTreeSet::new();

        for target in targets {
            let state = states.entry(target.session.clone()).or_default();

            let observation = if target.reason == FallbackReason::InputSuppressed {
                Observation::Failed
            } else if state.initialized && target.window_recent == Some(false) {
                Observation::Quiet
            } else {
                match query.capture_tail(&target.session, self.capture_lines).await {
                    Some(content) => Observation::Captured(content_digest(&content)),
                    None => Observation::Failed,
                }
            };

            let baseline_idle = target.reason == FallbackReason::StaleTag;
            self.observe(state, observation, baseline_idle, now_ms);

            let is_active = self.is_active(state, now_ms);
            trace!(
                session = %target.session,
                reason = ?target.reason,
                score = state.score,
                active = is_active,
                "hysteresis observation"
            );
            if is_active {
                active.insert(target.session.clone());
            }
        }

        active
    }
}
