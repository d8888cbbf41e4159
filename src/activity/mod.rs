//! Deciding which agent sessions are producing output.
//!
//! The classifier trusts fresh output tags; everything else goes through
//! the hysteresis engine, which compares pane digests across scans.

mod classifier;
mod hysteresis;

pub use classifier::{
    Classification, ClassifierInput, DeclaredType, Route, TagClassifier, TaggedSession,
};
pub use hysteresis::{
    FallbackReason, FallbackTarget, HysteresisEngine, Observation, SessionActivityState,
};
