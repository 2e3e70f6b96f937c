use anyhow::Result;
use cohere_core::{StoredMessage, runtime_dir};
use std::fs;
use std::path::{Path, PathBuf};

/// Where a history file lives. `Workspace` is scoped to one project's runtime
/// directory; `Global` is shared across workspaces under the user's home.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryScope {
    Workspace,
    Global,
}

/// Chat history persistence as small JSON arrays of `StoredMessage`.
///
/// A missing or unreadable file loads as an empty history; persistence must
/// never block a chat turn.
pub struct HistoryStore {
    workspace_path: PathBuf,
    global_path: PathBuf,
}

impl HistoryStore {
    /// `global_base` is the directory holding cross-workspace state
    /// (normally the user's home). Passed explicitly so tests can isolate it.
    pub fn new(workspace: &Path, global_base: &Path) -> Self {
        Self {
            workspace_path: runtime_dir(workspace).join("history.json"),
            global_path: global_base.join(".cohere").join("history.json"),
        }
    }

    pub fn open_default(workspace: &Path) -> Result<Self> {
        let home = std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .map_err(|_| anyhow::anyhow!("cannot resolve home directory for global history"))?;
        Ok(Self::new(workspace, Path::new(&home)))
    }

    fn path(&self, scope: HistoryScope) -> &Path {
        match scope {
            HistoryScope::Workspace => &self.workspace_path,
            HistoryScope::Global => &self.global_path,
        }
    }

    /// Load the history for `scope`. Missing or corrupt files read as empty.
    pub fn load(&self, scope: HistoryScope) -> Vec<StoredMessage> {
        let path = self.path(scope);
        let Ok(raw) = fs::read_to_string(path) else {
            return Vec::new();
        };
        serde_json::from_str(&raw).unwrap_or_default()
    }

    pub fn save(&self, scope: HistoryScope, messages: &[StoredMessage]) -> Result<()> {
        let path = self.path(scope);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_vec_pretty(messages)?)?;
        Ok(())
    }

    pub fn clear(&self, scope: HistoryScope) -> Result<()> {
        let path = self.path(scope);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }
}
