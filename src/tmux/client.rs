use std::collections::HashMap;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::{SessionRow, TagFilter, TagQuery};
use crate::error::TmuxError;

/// Fixed columns emitted ahead of the requested tags by `list-sessions`
const LIST_FORMAT: &str =
    "#{session_name}\t#{session_created}\t#{session_attached}\t#{window_activity}\t#{pane_dead}";
const FIXED_COLUMNS: usize = 5;

/// Client for interacting with tmux via CLI
pub struct TmuxClient {
    /// Path to tmux binary
    tmux_path: String,
}

impl TmuxClient {
    pub fn new(tmux_path: impl Into<String>) -> Self {
        Self {
            tmux_path: tmux_path.into(),
        }
    }

    async fn run(&self, command: &'static str, args: &[&str]) -> Result<String, TmuxError> {
        let output = Command::new(&self.tmux_path)
            .arg(command)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| TmuxError::Unavailable(format!("failed to execute tmux: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(classify_failure(command, stderr));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn display(&self, session: &str, format: &str) -> Result<String, TmuxError> {
        let target = exact_session(session);
        self.run("display-message", &["-p", "-t", &target, format])
            .await
            .map(|out| out.trim().to_string())
            .map_err(|e| with_session(e, session))
    }

    /// Get the command to attach to a session (for external execution)
    pub fn attach_command(&self, session: &str) -> Vec<String> {
        vec![
            self.tmux_path.clone(),
            "attach-session".to_string(),
            "-t".to_string(),
            exact_session(session),
        ]
    }
}

impl Default for TmuxClient {
    fn default() -> Self {
        Self::new("tmux")
    }
}

#[async_trait]
impl TagQuery for TmuxClient {
    async fn list_sessions(
        &self,
        filter: TagFilter<'_>,
        keys: &[&str],
    ) -> Result<Vec<SessionRow>, TmuxError> {
        let mut columns: Vec<&str> = Vec::with_capacity(keys.len() + filter.len());
        for key in filter.iter().map(|(k, _)| *k).chain(keys.iter().copied()) {
            if !columns.contains(&key) {
                columns.push(key);
            }
        }

        let mut format = LIST_FORMAT.to_string();
        for key in &columns {
            format.push_str("\t#{");
            format.push_str(key);
            format.push('}');
        }

        let stdout = match self.run("list-sessions", &["-F", &format]).await {
            Ok(stdout) => stdout,
            // A server with no sessions exits non-zero; there is simply nothing to list
            Err(TmuxError::CommandFailed { stderr, .. }) if stderr.contains("no sessions") => {
                return Ok(Vec::new())
            }
            Err(TmuxError::Unavailable(reason)) if reason.contains("no server running") => {
                return Ok(Vec::new())
            }
            Err(e) => return Err(e),
        };

        Ok(stdout
            .lines()
            .filter_map(|line| parse_session_line(line, &columns))
            .filter(|row| row.matches(filter))
            .collect())
    }

    async fn get_global_option(&self, key: &str) -> Result<Option<String>, TmuxError> {
        let value = self.run("show-options", &["-gqv", key]).await?;
        let value = value.trim();
        Ok((!value.is_empty()).then(|| value.to_string()))
    }

    async fn set_global_option(&self, key: &str, value: &str) -> Result<(), TmuxError> {
        self.run("set-option", &["-g", key, value]).await.map(|_| ())
    }

    async fn unset_global_option(&self, key: &str) -> Result<(), TmuxError> {
        self.run("set-option", &["-gu", key]).await.map(|_| ())
    }

    async fn capture_tail(&self, session: &str, lines: usize) -> Option<String> {
        let target = format!("{}:", exact_session(session));
        match self.run("capture-pane", &["-p", "-J", "-t", &target]).await {
            Ok(content) => Some(tail_lines(&content, lines)),
            Err(e) => {
                debug!(session = %session, error = %e, "capture-pane failed");
                None
            }
        }
    }

    async fn session_has_clients(&self, session: &str) -> Result<bool, TmuxError> {
        let attached = self.display(session, "#{session_attached}").await?;
        Ok(attached.parse::<usize>().unwrap_or(0) > 0)
    }

    async fn session_created_at(&self, session: &str) -> Result<Option<i64>, TmuxError> {
        let created = self.display(session, "#{session_created}").await?;
        Ok(parse_epoch_secs(&created))
    }

    async fn kill_session(&self, session: &str) -> Result<(), TmuxError> {
        let target = exact_session(session);
        self.run("kill-session", &["-t", &target])
            .await
            .map(|_| ())
            .map_err(|e| with_session(e, session))
    }

    async fn kill_sessions_matching(
        &self,
        filter: TagFilter<'_>,
        name_prefix: Option<&str>,
    ) -> Result<usize, TmuxError> {
        let rows = self.list_sessions(filter, &[]).await?;
        let mut killed = 0;
        for row in rows {
            if name_prefix.is_some_and(|prefix| !row.name.starts_with(prefix)) {
                continue;
            }
            match self.kill_session(&row.name).await {
                Ok(()) => killed += 1,
                Err(TmuxError::NoSession(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(killed)
    }
}

/// `=name` makes tmux match the session name exactly instead of by prefix
fn exact_session(session: &str) -> String {
    format!("={session}")
}

fn classify_failure(command: &'static str, stderr: String) -> TmuxError {
    if stderr.contains("no server running")
        || stderr.contains("error connecting")
        || stderr.contains("failed to connect")
    {
        TmuxError::Unavailable(stderr)
    } else {
        TmuxError::CommandFailed { command, stderr }
    }
}

fn with_session(error: TmuxError, session: &str) -> TmuxError {
    match error {
        TmuxError::CommandFailed { ref stderr, .. }
            if stderr.contains("can't find session") || stderr.contains("session not found") =>
        {
            TmuxError::NoSession(session.to_string())
        }
        other => other,
    }
}

fn parse_epoch_secs(value: &str) -> Option<i64> {
    value
        .trim()
        .parse::<i64>()
        .ok()
        .filter(|secs| *secs > 0)
        .map(|secs| secs * 1000)
}

fn parse_session_line(line: &str, columns: &[&str]) -> Option<SessionRow> {
    let parts: Vec<&str> = line.split('\t').collect();
    if parts.len() < FIXED_COLUMNS + columns.len() {
        return None;
    }

    let name = parts[0].trim();
    if name.is_empty() {
        return None;
    }

    let tags: HashMap<String, String> = columns
        .iter()
        .zip(&parts[FIXED_COLUMNS..])
        .filter(|(_, value)| !value.is_empty())
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect();

    Some(SessionRow {
        name: name.to_string(),
        tags,
        created_at_ms: parse_epoch_secs(parts[1]),
        attached_clients: parts[2].trim().parse().unwrap_or(0),
        window_activity_ms: parse_epoch_secs(parts[3]),
        has_live_pane: parts[4].trim() != "1",
    })
}

/// Last `lines` rows of a capture, ignoring the blank rows below the cursor
fn tail_lines(content: &str, lines: usize) -> String {
    let mut rows: Vec<&str> = content.lines().collect();
    while rows.last().is_some_and(|row| row.trim().is_empty()) {
        rows.pop();
    }
    let start = rows.len().saturating_sub(lines);
    rows[start..].join("\n")
}
