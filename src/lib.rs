//! Session lifecycle and activity tracking for AI agent workspaces hosted in tmux.

pub mod activity;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod facts;
pub mod gc;
pub mod registry;
pub mod runtime;
pub mod scheduler;
pub mod tmux;
