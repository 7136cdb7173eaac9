//! # StockWatch Core
//!
//! Shared foundation for the StockWatch pipeline:
//! - `error`: the error taxonomy every crate reports through
//! - `config`: the resolved configuration handed to the core at startup
//! - `types`: monitoring tasks, calculation results, notification requests
//! - `traits`: the collaborator seams (task store, calculator, mail, channels)
//! - `retry`: bounded retry with exponential backoff and jitter
//!
//! ## Architecture
//! ```text
//! Scheduler (tokio interval)
//!   └── TaskExecutor::run(task_id)
//!         ├── Calculator::evaluate(items)      ← RetryPolicy
//!         ├── canonical hash (OnChange only)
//!         ├── NotifyChannel::deliver_report    ← RetryPolicy, admin escalation
//!         └── TaskStore::update(lastSignificantHash)
//! ```

pub mod config;
pub mod error;
pub mod retry;
pub mod traits;
pub mod types;

pub use config::StockWatchConfig;
pub use error::{Result, StockWatchError, TransportFailure};
pub use retry::{RetryPolicy, TerminalError, TerminalKind};
pub use traits::{Calculator, DeliveryResult, MailTransport, NotifyChannel, TaskStore};
pub use types::{
    CalculationResult, DetailedRow, HashUpdate, LineItem, MonitoringTask, NotificationRequest,
    NotifyCondition, OutgoingMail, ResultSummary, TaskPatch,
};
