//! Data model: monitoring tasks, calculation results and notification requests.
//!
//! `MonitoringTask` is the persisted task record; its serde form is the
//! stable boundary format shared with every task store:
//! ```text
//! { id, name, items: [{name, quantity, version?}], active,
//!   schedule, recipients: [string], notifyCondition: "Always"|"OnChange",
//!   lastSignificantHash?: string }
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{Result, StockWatchError};

/// One line of a task's input: a part and how many are needed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub name: String,
    pub quantity: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl LineItem {
    pub fn new(name: &str, quantity: f64) -> Self {
        Self {
            name: name.to_string(),
            quantity,
            version: None,
        }
    }

    pub fn with_version(mut self, version: &str) -> Self {
        self.version = Some(version.to_string());
        self
    }
}

/// When a completed check should produce a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum NotifyCondition {
    /// Every cycle reports, whatever the result.
    Always,
    /// Only report when the shortage picture differs from the last report.
    #[default]
    OnChange,
}

impl std::fmt::Display for NotifyCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotifyCondition::Always => write!(f, "Always"),
            NotifyCondition::OnChange => write!(f, "OnChange"),
        }
    }
}

/// A stored recurring check definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringTask {
    pub id: String,
    pub name: String,
    pub items: Vec<LineItem>,
    pub active: bool,
    /// Cron expression (`MIN HOUR DOM MON DOW`, or an `@daily`-style macro).
    pub schedule: String,
    pub recipients: Vec<String>,
    #[serde(default)]
    pub notify_condition: NotifyCondition,
    /// Digest of the last shortage picture that was successfully reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_significant_hash: Option<String>,
}

impl MonitoringTask {
    /// Create a new active task with a generated id.
    pub fn new(name: &str, schedule: &str, items: Vec<LineItem>, recipients: Vec<String>) -> Self {
        Self {
            id: format!("task-{}", uuid::Uuid::new_v4().simple()),
            name: name.to_string(),
            items,
            active: true,
            schedule: schedule.to_string(),
            recipients,
            notify_condition: NotifyCondition::OnChange,
            last_significant_hash: None,
        }
    }

    pub fn with_condition(mut self, condition: NotifyCondition) -> Self {
        self.notify_condition = condition;
        self
    }

    /// Validate everything except the schedule, which needs the cron parser.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(StockWatchError::ConfigValidation("task id is empty".into()));
        }
        if self.active && self.recipients.is_empty() {
            return Err(StockWatchError::ConfigValidation(format!(
                "task '{}' is active but has no recipients",
                self.id
            )));
        }
        if let Some(bad) = self.recipients.iter().find(|r| !is_plausible_address(r)) {
            return Err(StockWatchError::ConfigValidation(format!(
                "task '{}' has an invalid recipient address '{bad}'",
                self.id
            )));
        }
        if self.items.is_empty() {
            return Err(StockWatchError::ConfigValidation(format!(
                "task '{}' has no items",
                self.id
            )));
        }
        for item in &self.items {
            if item.name.trim().is_empty() {
                return Err(StockWatchError::ConfigValidation(format!(
                    "task '{}' has an item without a name",
                    self.id
                )));
            }
            if !item.quantity.is_finite() || item.quantity < 0.0 {
                return Err(StockWatchError::ConfigValidation(format!(
                    "task '{}' item '{}' has invalid quantity {}",
                    self.id, item.name, item.quantity
                )));
            }
        }
        Ok(())
    }
}

/// Cheap structural check; the mail transport does the real parsing.
pub fn is_plausible_address(address: &str) -> bool {
    let address = address.trim();
    if address.chars().any(char::is_whitespace) {
        return false;
    }
    match address.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.is_empty()
                && !domain.contains('@')
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
        }
        None => false,
    }
}

/// Partial update applied through `TaskStore::update`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskPatch {
    pub active: Option<bool>,
    pub last_significant_hash: Option<HashUpdate>,
}

impl TaskPatch {
    pub fn set_active(active: bool) -> Self {
        Self {
            active: Some(active),
            last_significant_hash: None,
        }
    }

    pub fn set_hash(expected: Option<String>, new: String) -> Self {
        Self {
            active: None,
            last_significant_hash: Some(HashUpdate { expected, new }),
        }
    }
}

/// Compare-and-set of `lastSignificantHash`: applied only when the stored
/// value still equals `expected`, otherwise the store reports a conflict.
#[derive(Debug, Clone, PartialEq)]
pub struct HashUpdate {
    pub expected: Option<String>,
    pub new: String,
}

/// Aggregate counts of a calculation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultSummary {
    #[serde(default)]
    pub total_items: u32,
    #[serde(default)]
    pub items_in_shortage: u32,
    #[serde(default)]
    pub critical_items: u32,
}

/// Per-item outcome of a calculation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetailedRow {
    pub item_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub required: f64,
    #[serde(default)]
    pub available: f64,
    /// Missing quantity; zero when fully available.
    #[serde(default)]
    pub shortage: f64,
    /// Below the critical threshold.
    #[serde(default)]
    pub critical: bool,
}

impl DetailedRow {
    pub fn in_shortage(&self) -> bool {
        self.shortage > 0.0
    }
}

/// Output of the external calculation collaborator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalculationResult {
    #[serde(default)]
    pub summary: ResultSummary,
    #[serde(default)]
    pub detailed_rows: Vec<DetailedRow>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub has_critical_error: bool,
    /// Only meaningful when `has_critical_error` is set.
    #[serde(default)]
    pub is_retryable: bool,
}

impl CalculationResult {
    /// Build a result from rows, deriving the summary counts.
    pub fn from_rows(rows: Vec<DetailedRow>) -> Self {
        let summary = ResultSummary {
            total_items: rows.len() as u32,
            items_in_shortage: rows.iter().filter(|r| r.in_shortage()).count() as u32,
            critical_items: rows.iter().filter(|r| r.critical).count() as u32,
        };
        Self {
            summary,
            detailed_rows: rows,
            warnings: Vec::new(),
            has_critical_error: false,
            is_retryable: false,
        }
    }

    /// A failed calculation as reported by the collaborator itself.
    pub fn critical(message: &str, retryable: bool) -> Self {
        Self {
            warnings: vec![message.to_string()],
            has_critical_error: true,
            is_retryable: retryable,
            ..Self::default()
        }
    }

    pub fn shortage_rows(&self) -> impl Iterator<Item = &DetailedRow> {
        self.detailed_rows.iter().filter(|r| r.in_shortage())
    }

    /// Human-readable failure text for escalations.
    pub fn failure_description(&self) -> String {
        if self.warnings.is_empty() {
            "calculation reported a critical error".to_string()
        } else {
            self.warnings.join("; ")
        }
    }
}

/// One report to deliver: created per run, consumed once by the channels.
#[derive(Debug, Clone)]
pub struct NotificationRequest {
    pub task: MonitoringTask,
    pub result: CalculationResult,
    /// Present for `OnChange` tasks.
    pub hash: Option<String>,
    pub generated_at: chrono::DateTime<chrono::Utc>,
}

impl NotificationRequest {
    pub fn new(task: MonitoringTask, result: CalculationResult, hash: Option<String>) -> Self {
        Self {
            task,
            result,
            hash,
            generated_at: chrono::Utc::now(),
        }
    }
}

/// A rendered e-mail handed to the mail transport.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMail {
    pub to: Vec<String>,
    pub subject: String,
    pub html_body: String,
    pub text_body: String,
}
