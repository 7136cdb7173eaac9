//! Calculation collaborator trait.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{CalculationResult, LineItem};

/// Black-box availability calculation over a task's line items.
///
/// Implementations return `Err` when no result could be obtained at all
/// (classified via `StockWatchError::is_transient`). A result whose
/// `has_critical_error` is set must carry a truthful `is_retryable`.
#[async_trait]
pub trait Calculator: Send + Sync {
    fn name(&self) -> &str;

    async fn evaluate(&self, items: &[LineItem]) -> Result<CalculationResult>;
}
