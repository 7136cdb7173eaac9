//! SQLite-backed task store.
//! Survives restarts and supports several processes sharing one database:
//! the hash update is a single conditional UPDATE, so a concurrent writer
//! surfaces as `StoreConflict` instead of being overwritten.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params};
use stockwatch_core::error::{Result, StockWatchError};
use stockwatch_core::traits::TaskStore;
use stockwatch_core::types::{MonitoringTask, NotifyCondition, TaskPatch};

const SELECT_COLUMNS: &str = "SELECT id, name, items, active, schedule, recipients, notify_condition, last_significant_hash FROM monitoring_tasks";

/// SQLite-backed task store.
pub struct SqliteTaskStore {
    conn: Mutex<Connection>,
}

impl SqliteTaskStore {
    /// Open or create the task database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(db_err("DB open"))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(db_err("DB open"))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        tracing::debug!("🗄️ Task database ready at {}", path.display());
        Ok(store)
    }

    /// Private in-memory database.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err("DB open"))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    /// Default database path (~/.stockwatch/tasks.db).
    pub fn default_path() -> PathBuf {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        home.join(".stockwatch").join("tasks.db")
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| StockWatchError::Store(format!("DB lock poisoned: {e}")))
    }

    /// Run migrations to create tables.
    fn migrate(&self) -> Result<()> {
        self.lock()?
            .execute_batch(
                "
            CREATE TABLE IF NOT EXISTS monitoring_tasks (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                items TEXT NOT NULL,              -- JSON array of line items
                active INTEGER NOT NULL DEFAULT 1,
                schedule TEXT NOT NULL,
                recipients TEXT NOT NULL,         -- JSON array of addresses
                notify_condition TEXT NOT NULL DEFAULT 'OnChange',
                last_significant_hash TEXT,
                created_at TEXT NOT NULL
            );
         ",
            )
            .map_err(db_err("Migration"))
    }

    fn exists(conn: &Connection, id: &str) -> Result<bool> {
        conn.query_row(
            "SELECT 1 FROM monitoring_tasks WHERE id = ?1",
            params![id],
            |_| Ok(()),
        )
        .optional()
        .map(|r| r.is_some())
        .map_err(db_err("Lookup"))
    }
}

fn db_err(context: &'static str) -> impl Fn(rusqlite::Error) -> StockWatchError {
    move |e| StockWatchError::Store(format!("{context}: {e}"))
}

/// Raw column values of one row; decoded outside the rusqlite closure so
/// JSON errors keep their own error class.
struct RawTask {
    id: String,
    name: String,
    items: String,
    active: bool,
    schedule: String,
    recipients: String,
    notify_condition: String,
    last_significant_hash: Option<String>,
}

impl RawTask {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            items: row.get(2)?,
            active: row.get::<_, i64>(3)? != 0,
            schedule: row.get(4)?,
            recipients: row.get(5)?,
            notify_condition: row.get(6)?,
            last_significant_hash: row.get(7)?,
        })
    }

    fn decode(self) -> Result<MonitoringTask> {
        let notify_condition = match self.notify_condition.as_str() {
            "Always" => NotifyCondition::Always,
            "OnChange" => NotifyCondition::OnChange,
            other => {
                return Err(StockWatchError::Store(format!(
                    "task {} has unknown notify condition '{other}'",
                    self.id
                )));
            }
        };
        Ok(MonitoringTask {
            items: serde_json::from_str(&self.items)?,
            recipients: serde_json::from_str(&self.recipients)?,
            id: self.id,
            name: self.name,
            active: self.active,
            schedule: self.schedule,
            notify_condition,
            last_significant_hash: self.last_significant_hash,
        })
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn list(&self) -> Result<Vec<MonitoringTask>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!("{SELECT_COLUMNS} ORDER BY created_at, id"))
            .map_err(db_err("Prepare"))?;
        let raw: Vec<RawTask> = stmt
            .query_map([], RawTask::from_row)
            .map_err(db_err("Query"))?
            .collect::<rusqlite::Result<_>>()
            .map_err(db_err("Row"))?;
        raw.into_iter().map(RawTask::decode).collect()
    }

    async fn get(&self, id: &str) -> Result<Option<MonitoringTask>> {
        let conn = self.lock()?;
        let raw = conn
            .query_row(
                &format!("{SELECT_COLUMNS} WHERE id = ?1"),
                params![id],
                RawTask::from_row,
            )
            .optional()
            .map_err(db_err("Query"))?;
        raw.map(RawTask::decode).transpose()
    }

    async fn update(&self, id: &str, patch: TaskPatch) -> Result<()> {
        let conn = self.lock()?;
        let active = patch.active.map(|a| a as i64);

        let changed = match &patch.last_significant_hash {
            Some(update) => conn
                .execute(
                    "UPDATE monitoring_tasks
                     SET last_significant_hash = ?1, active = COALESCE(?2, active)
                     WHERE id = ?3 AND last_significant_hash IS ?4",
                    params![update.new, active, id, update.expected],
                )
                .map_err(db_err("Update"))?,
            None => conn
                .execute(
                    "UPDATE monitoring_tasks SET active = COALESCE(?1, active) WHERE id = ?2",
                    params![active, id],
                )
                .map_err(db_err("Update"))?,
        };

        if changed == 0 {
            if Self::exists(&conn, id)? {
                return Err(StockWatchError::StoreConflict(id.to_string()));
            }
            return Err(StockWatchError::TaskNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn create(&self, task: MonitoringTask) -> Result<()> {
        let items = serde_json::to_string(&task.items)?;
        let recipients = serde_json::to_string(&task.recipients)?;
        let conn = self.lock()?;
        if Self::exists(&conn, &task.id)? {
            return Err(StockWatchError::Store(format!("task {} already exists", task.id)));
        }
        conn.execute(
            "INSERT INTO monitoring_tasks
             (id, name, items, active, schedule, recipients, notify_condition, last_significant_hash, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                task.id,
                task.name,
                items,
                task.active as i64,
                task.schedule,
                recipients,
                task.notify_condition.to_string(),
                task.last_significant_hash,
                chrono::Utc::now().to_rfc3339(),
            ],
        )
        .map_err(db_err("Insert"))?;
        tracing::info!("📅 Task added: '{}' ({})", task.name, task.id);
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let n = conn
            .execute("DELETE FROM monitoring_tasks WHERE id = ?1", params![id])
            .map_err(db_err("Delete"))?;
        Ok(n > 0)
    }
}
