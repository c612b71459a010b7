// src/storage/mod.rs — Artifact content and checkpoint persistence
//
// Artifact content is keyed by (id, cycle) and treated as immutable once
// written; metadata lives inside `CycleState` and is checkpointed with it.
// `FileStorage` uses atomic write (temp file + rename) for the checkpoint so
// a torn-down process can always resume from a consistent state.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::core::types::CycleState;

pub trait Storage: Send + Sync {
    fn get_artifact(&self, id: &str, cycle: u64) -> anyhow::Result<Option<String>>;
    fn set_artifact(&self, id: &str, cycle: u64, content: &str) -> anyhow::Result<()>;
    fn save_state(&self, state: &CycleState) -> anyhow::Result<()>;
    fn load_state(&self) -> anyhow::Result<Option<CycleState>>;
}

/// In-memory storage used by tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryStorage {
    artifacts: Mutex<HashMap<(String, u64), String>>,
    state: Mutex<Option<CycleState>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn get_artifact(&self, id: &str, cycle: u64) -> anyhow::Result<Option<String>> {
        let artifacts = self.artifacts.lock().map_err(|_| poisoned())?;
        Ok(artifacts.get(&(id.to_string(), cycle)).cloned())
    }

    fn set_artifact(&self, id: &str, cycle: u64, content: &str) -> anyhow::Result<()> {
        let mut artifacts = self.artifacts.lock().map_err(|_| poisoned())?;
        artifacts.insert((id.to_string(), cycle), content.to_string());
        Ok(())
    }

    fn save_state(&self, state: &CycleState) -> anyhow::Result<()> {
        let mut slot = self.state.lock().map_err(|_| poisoned())?;
        *slot = Some(state.clone());
        Ok(())
    }

    fn load_state(&self) -> anyhow::Result<Option<CycleState>> {
        let slot = self.state.lock().map_err(|_| poisoned())?;
        Ok(slot.clone())
    }
}

fn poisoned() -> anyhow::Error {
    anyhow::anyhow!("storage mutex poisoned")
}

/// Disk-backed storage rooted at a directory:
///
/// ```text
/// <root>/state.json                 checkpointed CycleState
/// <root>/artifacts/<id>/<cycle>     artifact content, one file per version
/// ```
pub struct FileStorage {
    root: PathBuf,
}

/// On-disk checkpoint envelope; the timestamp aids debugging torn-down runs.
#[derive(Serialize, Deserialize)]
struct Checkpoint {
    saved_at: chrono::DateTime<Utc>,
    state: CycleState,
}

impl FileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn state_path(&self) -> PathBuf {
        self.root.join("state.json")
    }

    fn artifact_path(&self, id: &str, cycle: u64) -> PathBuf {
        // Artifact ids are dotted names ("target.body", "meta.summary_context");
        // path separators are not legal in them.
        let safe: String = id
            .chars()
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect();
        self.root.join("artifacts").join(safe).join(cycle.to_string())
    }
}

impl Storage for FileStorage {
    fn get_artifact(&self, id: &str, cycle: u64) -> anyhow::Result<Option<String>> {
        let path = self.artifact_path(id, cycle);
        match std::fs::read_to_string(&path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("reading artifact {}", path.display())),
        }
    }

    fn set_artifact(&self, id: &str, cycle: u64, content: &str) -> anyhow::Result<()> {
        let path = self.artifact_path(id, cycle);
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(&path, content)
            .with_context(|| format!("writing artifact {}", path.display()))
    }

    fn save_state(&self, state: &CycleState) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        let dst = self.state_path();
        let tmp = self.root.join(".state.json.tmp");

        let checkpoint = Checkpoint {
            saved_at: Utc::now(),
            state: state.clone(),
        };
        let json = serde_json::to_string_pretty(&checkpoint)?;
        let mut f = std::fs::File::create(&tmp)?;
        f.write_all(json.as_bytes())?;
        f.sync_all()?;
        std::fs::rename(&tmp, &dst)?;
        Ok(())
    }

    fn load_state(&self) -> anyhow::Result<Option<CycleState>> {
        let path = self.state_path();
        match std::fs::read_to_string(&path) {
            Ok(json) => {
                let checkpoint: Checkpoint = serde_json::from_str(&json)
                    .with_context(|| format!("parsing checkpoint {}", path.display()))?;
                Ok(Some(checkpoint.state))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("reading checkpoint {}", path.display())),
        }
    }
}

/// Convenience for reading the latest version of an artifact as tracked by
/// state metadata.
pub fn latest_artifact(
    storage: &dyn Storage,
    state: &CycleState,
    id: &str,
) -> anyhow::Result<Option<String>> {
    match state.artifact_metadata.get(id) {
        Some(meta) => storage.get_artifact(id, meta.latest_cycle),
        None => Ok(None),
    }
}
