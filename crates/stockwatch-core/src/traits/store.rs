//! Task store trait.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{MonitoringTask, TaskPatch};

/// Persistence for monitoring tasks.
///
/// `update` with a `HashUpdate` is a compare-and-set: if the stored
/// `lastSignificantHash` no longer equals `expected`, nothing is written and
/// `StockWatchError::StoreConflict` is returned.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn list(&self) -> Result<Vec<MonitoringTask>>;

    async fn get(&self, id: &str) -> Result<Option<MonitoringTask>>;

    async fn update(&self, id: &str, patch: TaskPatch) -> Result<()>;

    async fn create(&self, task: MonitoringTask) -> Result<()>;

    /// Returns whether a task was removed.
    async fn delete(&self, id: &str) -> Result<bool>;
}
