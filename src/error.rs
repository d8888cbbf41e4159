use thiserror::Error;

/// Failures talking to the tmux server
#[derive(Debug, Error)]
pub enum TmuxError {
    /// The tmux binary could not be spawned or the server is unreachable
    #[error("tmux is unavailable: {0}")]
    Unavailable(String),

    /// tmux ran but reported a failure
    #[error("tmux {command} failed: {stderr}")]
    CommandFailed {
        command: &'static str,
        stderr: String,
    },

    /// The target session does not exist
    #[error("no such session: {0}")]
    NoSession(String),
}

impl TmuxError {
    /// Whether the whole server is out of reach, as opposed to one command failing
    pub fn is_unavailable(&self) -> bool {
        matches!(self, TmuxError::Unavailable(_))
    }
}
