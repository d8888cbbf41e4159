use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::facts::Workspace;

#[derive(Debug, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    workspaces: Vec<Workspace>,
}

/// Read the workspace list written by the persistence layer.
///
/// A registry that does not exist yet is an empty list; a file that is
/// present but unreadable is an error so the caller can keep its last good
/// copy instead of treating every session as orphaned.
pub async fn load_workspaces(path: &Path) -> Result<Vec<Workspace>> {
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read registry {}", path.display()))
        }
    };

    let file: RegistryFile = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse registry {}", path.display()))?;
    Ok(file.workspaces)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facts::TabStatus;

    #[tokio::test]
    async fn test_missing_registry_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let workspaces = load_workspaces(&dir.path().join("workspaces.json"))
            .await
            .unwrap();
        assert!(workspaces.is_empty());
    }

    #[tokio::test]
    async fn test_load_registry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("workspaces.json");
        std::fs::write(
            &path,
            r#"{
                "workspaces": [
                    {"id": "ws-a", "name": "feature-a", "tabs": [
                        {"id": "t1", "session_name": "agent-deck-ws-a-t1", "assistant": "claude"},
                        {"id": "t2", "session_name": "agent-deck-ws-a-t2", "status": "stopped"}
                    ]},
                    {"id": "ws-b", "creating": true}
                ]
            }"#,
        )
        .unwrap();

        let workspaces = load_workspaces(&path).await.unwrap();
        assert_eq!(workspaces.len(), 2);
        assert!(workspaces[0].tabs[0].is_chat());
        assert_eq!(workspaces[0].tabs[0].status, TabStatus::Running);
        assert_eq!(workspaces[0].tabs[1].status, TabStatus::Stopped);
        assert!(workspaces[1].creating);
        assert!(workspaces[1].tabs.is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_registry_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("workspaces.json");
        std::fs::write(&path, "[").unwrap();
        assert!(load_workspaces(&path).await.is_err());
    }
}
