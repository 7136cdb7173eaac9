//! File-based task store: lightweight persistence.
//! Tasks saved as one human-readable JSON file.
//! Reads are served from an in-memory copy; every mutation writes through.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use stockwatch_core::error::{Result, StockWatchError};
use stockwatch_core::traits::TaskStore;
use stockwatch_core::types::{MonitoringTask, TaskPatch};
use tokio::sync::Mutex;

const TASKS_FILE: &str = "tasks.json";

/// File-based task store.
pub struct FileTaskStore {
    /// `None` keeps everything in memory.
    path: Option<PathBuf>,
    tasks: Mutex<Vec<MonitoringTask>>,
}

impl FileTaskStore {
    /// Open the store in `dir`, loading `tasks.json` if it exists.
    pub fn new(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let file = dir.join(TASKS_FILE);
        let tasks = load(&file)?;
        tracing::debug!("📂 Loaded {} task(s) from {}", tasks.len(), file.display());
        Ok(Self {
            path: Some(file),
            tasks: Mutex::new(tasks),
        })
    }

    /// In-memory store, nothing touches disk.
    pub fn ephemeral() -> Self {
        Self {
            path: None,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Default store path (~/.stockwatch/tasks).
    pub fn default_path() -> PathBuf {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        home.join(".stockwatch").join("tasks")
    }

    fn save(&self, tasks: &[MonitoringTask]) -> Result<()> {
        let Some(file) = &self.path else {
            return Ok(());
        };
        let json = serde_json::to_string_pretty(tasks)?;
        // Write to a sibling file first so a crash never leaves half a file.
        let tmp = file.with_extension("json.tmp");
        std::fs::write(&tmp, &json)?;
        std::fs::rename(&tmp, file)?;
        tracing::debug!("💾 Saved {} tasks to {}", tasks.len(), file.display());
        Ok(())
    }
}

fn load(file: &Path) -> Result<Vec<MonitoringTask>> {
    if !file.exists() {
        return Ok(Vec::new());
    }
    let json = std::fs::read_to_string(file)?;
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(&json).map_err(|e| {
        StockWatchError::Store(format!("Failed to parse {}: {e}", file.display()))
    })
}

/// Apply a patch to one task. Shared by every in-process store.
pub(crate) fn apply_patch(task: &mut MonitoringTask, patch: TaskPatch) -> Result<()> {
    if let Some(update) = &patch.last_significant_hash {
        if task.last_significant_hash != update.expected {
            return Err(StockWatchError::StoreConflict(task.id.clone()));
        }
    }
    if let Some(active) = patch.active {
        task.active = active;
    }
    if let Some(update) = patch.last_significant_hash {
        task.last_significant_hash = Some(update.new);
    }
    Ok(())
}

#[async_trait]
impl TaskStore for FileTaskStore {
    async fn list(&self) -> Result<Vec<MonitoringTask>> {
        Ok(self.tasks.lock().await.clone())
    }

    async fn get(&self, id: &str) -> Result<Option<MonitoringTask>> {
        Ok(self.tasks.lock().await.iter().find(|t| t.id == id).cloned())
    }

    async fn update(&self, id: &str, patch: TaskPatch) -> Result<()> {
        let mut tasks = self.tasks.lock().await;
        let mut updated = tasks.clone();
        let task = updated
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| StockWatchError::TaskNotFound(id.to_string()))?;
        apply_patch(task, patch)?;
        self.save(&updated)?;
        *tasks = updated;
        Ok(())
    }

    async fn create(&self, task: MonitoringTask) -> Result<()> {
        let mut tasks = self.tasks.lock().await;
        if tasks.iter().any(|t| t.id == task.id) {
            return Err(StockWatchError::Store(format!("task {} already exists", task.id)));
        }
        tracing::info!("📅 Task added: '{}' ({})", task.name, task.id);
        let mut updated = tasks.clone();
        updated.push(task);
        self.save(&updated)?;
        *tasks = updated;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let mut tasks = self.tasks.lock().await;
        let len = tasks.len();
        let updated: Vec<MonitoringTask> = tasks.iter().filter(|t| t.id != id).cloned().collect();
        if updated.len() == len {
            return Ok(false);
        }
        self.save(&updated)?;
        *tasks = updated;
        Ok(true)
    }
}
