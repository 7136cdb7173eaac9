//! Task Executor: one check → decide → notify cycle for one task id.
//!
//! ```text
//! run(task_id)
//!   ├── store.get            → NotFound / Inactive / InvalidConfig ⇒ Skipped
//!   ├── calculator.evaluate  (RetryPolicy + deadline per attempt)
//!   │     └── terminal        ⇒ admin escalation on every channel ⇒ Failed
//!   ├── decide               Always ⇒ notify
//!   │                        OnChange ⇒ notify iff shortage hash differs
//!   ├── channels.deliver_report (each channel retries internally)
//!   └── all Sent + OnChange  ⇒ store.update(hash, compare-and-set)
//! ```
//!
//! Nothing escapes `run`: errors and panics alike become `RunOutcome::Failed`.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use stockwatch_core::error::{Result, StockWatchError};
use stockwatch_core::retry::{RetryPolicy, TerminalKind};
use stockwatch_core::traits::{Calculator, DeliveryResult, NotifyChannel, TaskStore};
use stockwatch_core::types::{
    CalculationResult, MonitoringTask, NotificationRequest, NotifyCondition, TaskPatch,
};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::cron::validate_task;
use crate::hash::shortage_hash;

/// Why a cycle did nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    NotFound,
    Inactive,
    InvalidConfig(String),
    /// Another execution for the same id is still running.
    AlreadyRunning,
    ShuttingDown,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::NotFound => write!(f, "task not found"),
            SkipReason::Inactive => write!(f, "task is inactive"),
            SkipReason::InvalidConfig(msg) => write!(f, "invalid configuration: {msg}"),
            SkipReason::AlreadyRunning => write!(f, "already running"),
            SkipReason::ShuttingDown => write!(f, "scheduler is shutting down"),
        }
    }
}

/// Result of one cycle.
#[derive(Debug)]
pub enum RunOutcome {
    /// The cycle ran to the end. `notified` is true when a report went out.
    Completed { notified: bool },
    Skipped(SkipReason),
    Failed(StockWatchError),
}

impl RunOutcome {
    /// The standing trigger for this id should be removed.
    pub fn drops_trigger(&self) -> bool {
        matches!(
            self,
            RunOutcome::Skipped(
                SkipReason::NotFound | SkipReason::Inactive | SkipReason::InvalidConfig(_)
            )
        )
    }
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunOutcome::Completed { notified: true } => write!(f, "completed, notification sent"),
            RunOutcome::Completed { notified: false } => write!(f, "completed, no notification"),
            RunOutcome::Skipped(reason) => write!(f, "skipped: {reason}"),
            RunOutcome::Failed(e) => write!(f, "failed: {e}"),
        }
    }
}

/// Runs task cycles against the configured collaborators.
pub struct TaskExecutor {
    store: Arc<dyn TaskStore>,
    calculator: Arc<dyn Calculator>,
    channels: Vec<Arc<dyn NotifyChannel>>,
    calc_retry: RetryPolicy,
    calc_timeout: Duration,
}

impl TaskExecutor {
    pub fn new(
        store: Arc<dyn TaskStore>,
        calculator: Arc<dyn Calculator>,
        calc_retry: RetryPolicy,
        calc_timeout: Duration,
    ) -> Self {
        Self {
            store,
            calculator,
            channels: Vec::new(),
            calc_retry,
            calc_timeout,
        }
    }

    /// Add a notification channel. Reports and escalations fan out to all of them.
    pub fn with_channel(mut self, channel: Arc<dyn NotifyChannel>) -> Self {
        self.channels.push(channel);
        self
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    /// Run one full cycle. Never panics, never returns an error.
    pub async fn run(&self, task_id: &str, cancel: &CancellationToken) -> RunOutcome {
        let span = tracing::info_span!("task", id = %task_id);
        let cycle = AssertUnwindSafe(self.run_cycle(task_id, cancel)).catch_unwind();

        match cycle.instrument(span.clone()).await {
            Ok(Ok(outcome)) => {
                span.in_scope(|| tracing::debug!("🏁 Cycle {outcome}"));
                outcome
            }
            Ok(Err(e)) => {
                span.in_scope(|| tracing::error!("❌ Cycle for task {task_id} failed: {e}"));
                RunOutcome::Failed(e)
            }
            Err(panic) => {
                let msg = panic_message(panic.as_ref());
                span.in_scope(|| tracing::error!("💥 Cycle for task {task_id} panicked: {msg}"));
                RunOutcome::Failed(StockWatchError::Internal(format!("panic: {msg}")))
            }
        }
    }

    async fn run_cycle(&self, task_id: &str, cancel: &CancellationToken) -> Result<RunOutcome> {
        let Some(task) = self.store.get(task_id).await? else {
            return Ok(RunOutcome::Skipped(SkipReason::NotFound));
        };
        if !task.active {
            return Ok(RunOutcome::Skipped(SkipReason::Inactive));
        }
        if let Err(e) = validate_task(&task) {
            return Ok(RunOutcome::Skipped(SkipReason::InvalidConfig(e.to_string())));
        }

        tracing::info!("🔔 Checking '{}' ({} item(s))", task.name, task.items.len());

        let result = match self.calculate(&task, cancel).await {
            Ok(result) => result,
            Err(e) => return Ok(RunOutcome::Failed(e)),
        };

        let hash = match task.notify_condition {
            NotifyCondition::Always => None,
            NotifyCondition::OnChange => {
                let current = shortage_hash(&result)?;
                if task.last_significant_hash.as_deref() == Some(current.as_str()) {
                    tracing::info!("😴 No change in shortage picture for '{}'", task.name);
                    return Ok(RunOutcome::Completed { notified: false });
                }
                Some(current)
            }
        };

        let previous_hash = task.last_significant_hash.clone();
        let request = NotificationRequest::new(task, result, hash.clone());
        let delivered = self.deliver(&request).await?;
        if !delivered {
            return Ok(RunOutcome::Completed { notified: false });
        }

        if let Some(new_hash) = hash {
            self.persist_hash(task_id, previous_hash, new_hash).await?;
        }
        Ok(RunOutcome::Completed { notified: true })
    }

    /// Calculation with retries. Terminal failures are escalated here.
    async fn calculate(
        &self,
        task: &MonitoringTask,
        cancel: &CancellationToken,
    ) -> Result<CalculationResult> {
        let calculator = &self.calculator;
        let items = &task.items;
        let timeout = self.calc_timeout;
        let label = format!("calculation for '{}'", task.name);

        let attempt = |_attempt: u32| async move {
            let result = tokio::time::timeout(timeout, calculator.evaluate(items))
                .await
                .map_err(|_| {
                    StockWatchError::Timeout(format!("calculation exceeded {timeout:?}"))
                })??;
            if result.has_critical_error {
                let msg = result.failure_description();
                return Err(if result.is_retryable {
                    StockWatchError::TransientDependency(msg)
                } else {
                    StockWatchError::TerminalDependency(msg)
                });
            }
            Ok::<_, StockWatchError>(result)
        };

        match self
            .calc_retry
            .execute(&label, attempt, StockWatchError::is_transient, cancel)
            .await
        {
            Ok(result) => Ok(result),
            Err(terminal) if terminal.kind == TerminalKind::Cancelled => {
                tracing::info!("🛑 Calculation for '{}' abandoned by shutdown", task.name);
                Err(StockWatchError::Cancelled)
            }
            Err(terminal) => {
                let outcome = match terminal.kind {
                    TerminalKind::ExhaustedRetries => {
                        format!("retries exhausted after {} attempts", terminal.attempts)
                    }
                    _ => "non-retryable error".to_string(),
                };
                let details = format!(
                    "Task: {} ({})\nStage: calculation\nOutcome: {outcome}\nCause: {}",
                    task.name, task.id, terminal.last_error
                );
                self.escalate(&format!("Calculation failed for '{}'", task.name), &details)
                    .await;
                Err(terminal.into())
            }
        }
    }

    /// Fan the report out. True only when every channel sent it.
    async fn deliver(&self, request: &NotificationRequest) -> Result<bool> {
        if self.channels.is_empty() {
            tracing::warn!(
                "⚠️ No notification channels configured, report for '{}' dropped",
                request.task.name
            );
            return Ok(false);
        }

        let mut failures = Vec::new();
        let mut all_sent = true;
        for channel in &self.channels {
            match channel.deliver_report(request).await {
                DeliveryResult::Sent => {}
                DeliveryResult::Disabled => all_sent = false,
                DeliveryResult::Failed(reason) => {
                    all_sent = false;
                    failures.push(format!("{}: {reason}", channel.name()));
                }
            }
        }

        if !failures.is_empty() {
            return Err(StockWatchError::Delivery(failures.join("; ")));
        }
        if all_sent {
            tracing::info!("📨 Report for '{}' delivered", request.task.name);
        }
        Ok(all_sent)
    }

    /// Store the new hash. A conflicting concurrent write is re-read once:
    /// if it already holds our hash we are done, otherwise we retry against it.
    async fn persist_hash(
        &self,
        task_id: &str,
        expected: Option<String>,
        new_hash: String,
    ) -> Result<()> {
        match self
            .store
            .update(task_id, TaskPatch::set_hash(expected, new_hash.clone()))
            .await
        {
            Err(StockWatchError::StoreConflict(_)) => {}
            other => return other,
        }

        let current = self
            .store
            .get(task_id)
            .await?
            .ok_or_else(|| StockWatchError::TaskNotFound(task_id.to_string()))?;
        if current.last_significant_hash.as_deref() == Some(new_hash.as_str()) {
            tracing::debug!("Hash for {task_id} already stored by a concurrent run");
            return Ok(());
        }

        // Our report for `new_hash` has just reached the recipients, so it is
        // the last significant state they saw. Storing anything else would
        // suppress the next real change or repeat this one. The displaced
        // value is logged and a second conflict fails the cycle.
        tracing::warn!(
            "⚠️ Hash for {task_id} changed concurrently ({:?}), retrying once",
            current.last_significant_hash
        );
        self.store
            .update(
                task_id,
                TaskPatch::set_hash(current.last_significant_hash, new_hash),
            )
            .await
    }

    /// Operator escalation on every channel. Failures are only logged.
    async fn escalate(&self, subject: &str, details: &str) {
        for channel in &self.channels {
            if let DeliveryResult::Failed(reason) = channel.deliver_admin(subject, details).await {
                tracing::error!("🚨 Escalation via {} failed: {reason}", channel.name());
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;
    use async_trait::async_trait;
    use stockwatch_core::types::LineItem;

    #[tokio::test]
    async fn test_always_notifies_every_cycle_without_hash() {
        let h = Harness::new(
            ScriptedCalculator::returning(two_shortages()),
            RecordingChannel::new(),
        );
        h.store.create(task("t1", NotifyCondition::Always)).await.unwrap();
        let cancel = CancellationToken::new();

        for _ in 0..3 {
            let outcome = h.executor.run("t1", &cancel).await;
            assert!(matches!(outcome, RunOutcome::Completed { notified: true }));
        }

        assert_eq!(h.channel.report_count(), 3);
        let reports = h.channel.reports.lock().unwrap();
        assert_eq!(reports[0].result.summary.total_items, 3);
        assert_eq!(reports[0].result.summary.items_in_shortage, 2);
        assert!(reports[0].hash.is_none());
        drop(reports);
        assert_eq!(h.store.hash_writes(), 0);
        assert_eq!(h.store.stored_hash("t1").await, None);
    }

    #[tokio::test]
    async fn test_on_change_h1_h1_h2() {
        let h1 = two_shortages();
        let h2 = CalculationResult::from_rows(vec![row("R10k", 4.0), row("C100n", 5.0)]);
        let calc = ScriptedCalculator::returning(h2.clone())
            .then(Ok(h1.clone()))
            .then(Ok(h1.clone()));
        let h = Harness::new(calc, RecordingChannel::new());
        h.store.create(task("t1", NotifyCondition::OnChange)).await.unwrap();
        let cancel = CancellationToken::new();

        let first = h.executor.run("t1", &cancel).await;
        assert!(matches!(first, RunOutcome::Completed { notified: true }));
        let stored_h1 = h.store.stored_hash("t1").await.unwrap();
        assert_eq!(stored_h1, shortage_hash(&h1).unwrap());

        let second = h.executor.run("t1", &cancel).await;
        assert!(matches!(second, RunOutcome::Completed { notified: false }));
        assert_eq!(h.channel.report_count(), 1);
        assert_eq!(h.store.hash_writes(), 1);

        let third = h.executor.run("t1", &cancel).await;
        assert!(matches!(third, RunOutcome::Completed { notified: true }));
        assert_eq!(h.channel.report_count(), 2);
        assert_eq!(
            h.store.stored_hash("t1").await.unwrap(),
            shortage_hash(&h2).unwrap()
        );
        assert_eq!(h.store.hash_writes(), 2);
    }

    #[tokio::test]
    async fn test_failed_delivery_keeps_hash_and_retries_next_cycle() {
        let channel = RecordingChannel::new().then(DeliveryResult::Failed("smtp down".into()));
        let h = Harness::new(ScriptedCalculator::returning(two_shortages()), channel);
        h.store.create(task("t1", NotifyCondition::OnChange)).await.unwrap();
        let cancel = CancellationToken::new();

        let first = h.executor.run("t1", &cancel).await;
        assert!(matches!(first, RunOutcome::Failed(StockWatchError::Delivery(_))));
        assert_eq!(h.store.stored_hash("t1").await, None);

        let second = h.executor.run("t1", &cancel).await;
        assert!(matches!(second, RunOutcome::Completed { notified: true }));
        assert_eq!(h.channel.report_count(), 2);
        assert_eq!(h.store.hash_writes(), 1);
    }

    #[tokio::test]
    async fn test_disabled_channel_does_not_advance_hash() {
        let h = Harness::new(
            ScriptedCalculator::returning(two_shortages()),
            RecordingChannel::answering(DeliveryResult::Disabled),
        );
        h.store.create(task("t1", NotifyCondition::OnChange)).await.unwrap();

        let outcome = h.executor.run("t1", &CancellationToken::new()).await;
        assert!(matches!(outcome, RunOutcome::Completed { notified: false }));
        assert_eq!(h.store.stored_hash("t1").await, None);
    }

    #[tokio::test]
    async fn test_calculation_retry_ceiling_escalates() {
        let h = Harness::new(
            ScriptedCalculator::failing(|| StockWatchError::TransientDependency("503".into())),
            RecordingChannel::new(),
        );
        h.store.create(task("t1", NotifyCondition::Always)).await.unwrap();

        let outcome = h.executor.run("t1", &CancellationToken::new()).await;
        match outcome {
            RunOutcome::Failed(e) => assert!(e.is_exhausted(), "unexpected error: {e}"),
            other => panic!("expected failure, got {other}"),
        }
        assert_eq!(h.calculator.calls(), 3);
        assert_eq!(h.channel.report_count(), 0);
        assert_eq!(h.channel.admin_count(), 1);
        let admin = h.channel.admin.lock().unwrap();
        assert!(admin[0].1.contains("retries exhausted after 3 attempts"));
    }

    #[tokio::test]
    async fn test_critical_result_retryable_vs_not() {
        // Retryable critical error recovers on the second attempt.
        let calc = ScriptedCalculator::returning(two_shortages())
            .then(Ok(CalculationResult::critical("stock db locked", true)));
        let h = Harness::new(calc, RecordingChannel::new());
        h.store.create(task("t1", NotifyCondition::Always)).await.unwrap();
        let outcome = h.executor.run("t1", &CancellationToken::new()).await;
        assert!(matches!(outcome, RunOutcome::Completed { notified: true }));
        assert_eq!(h.calculator.calls(), 2);
        assert_eq!(h.channel.admin_count(), 0);

        // Non-retryable critical error stops at once and escalates.
        let calc = ScriptedCalculator::returning(CalculationResult::critical("unknown part", false));
        let h = Harness::new(calc, RecordingChannel::new());
        h.store.create(task("t1", NotifyCondition::Always)).await.unwrap();
        let outcome = h.executor.run("t1", &CancellationToken::new()).await;
        assert!(matches!(
            outcome,
            RunOutcome::Failed(StockWatchError::TerminalDependency(_))
        ));
        assert_eq!(h.calculator.calls(), 1);
        assert_eq!(h.channel.report_count(), 0);
        let admin = h.channel.admin.lock().unwrap();
        assert!(admin[0].1.contains("non-retryable error"));
        assert!(admin[0].1.contains("unknown part"));
    }

    #[tokio::test]
    async fn test_skips_missing_inactive_and_invalid() {
        let h = Harness::new(
            ScriptedCalculator::returning(two_shortages()),
            RecordingChannel::new(),
        );
        let cancel = CancellationToken::new();

        assert!(matches!(
            h.executor.run("ghost", &cancel).await,
            RunOutcome::Skipped(SkipReason::NotFound)
        ));

        let mut inactive = task("off", NotifyCondition::Always);
        inactive.active = false;
        h.store.create(inactive).await.unwrap();
        assert!(matches!(
            h.executor.run("off", &cancel).await,
            RunOutcome::Skipped(SkipReason::Inactive)
        ));

        let mut bad = task("bad", NotifyCondition::Always);
        bad.schedule = "whenever".into();
        h.store.create(bad).await.unwrap();
        let outcome = h.executor.run("bad", &cancel).await;
        assert!(outcome.drops_trigger());
        assert!(matches!(outcome, RunOutcome::Skipped(SkipReason::InvalidConfig(_))));

        assert_eq!(h.calculator.calls(), 0);
    }

    #[tokio::test]
    async fn test_store_conflict_is_reread_not_overwritten_blindly() {
        let h = Harness::new(
            ScriptedCalculator::returning(two_shortages()),
            RecordingChannel::new(),
        );
        h.store.create(task("t1", NotifyCondition::OnChange)).await.unwrap();
        h.store.race_next_hash_update("someone-else");

        let outcome = h.executor.run("t1", &CancellationToken::new()).await;
        assert!(matches!(outcome, RunOutcome::Completed { notified: true }));
        assert_eq!(
            h.store.stored_hash("t1").await.unwrap(),
            shortage_hash(&two_shortages()).unwrap()
        );
    }

    struct PanickingCalculator;

    #[async_trait]
    impl Calculator for PanickingCalculator {
        fn name(&self) -> &str {
            "panics"
        }

        async fn evaluate(&self, _items: &[LineItem]) -> Result<CalculationResult> {
            panic!("calculator bug");
        }
    }

    #[tokio::test]
    async fn test_panic_becomes_failed_outcome() {
        let store = Arc::new(CountingStore::new());
        store.create(task("t1", NotifyCondition::Always)).await.unwrap();
        let executor = TaskExecutor::new(
            store,
            Arc::new(PanickingCalculator),
            fast_retry(1),
            Duration::from_secs(1),
        );

        match executor.run("t1", &CancellationToken::new()).await {
            RunOutcome::Failed(StockWatchError::Internal(msg)) => {
                assert!(msg.contains("calculator bug"))
            }
            other => panic!("expected internal failure, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_cancelled_calculation_is_not_escalated() {
        let h = Harness::new(
            ScriptedCalculator::failing(|| StockWatchError::TransientDependency("503".into())),
            RecordingChannel::new(),
        );
        h.store.create(task("t1", NotifyCondition::Always)).await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = h.executor.run("t1", &cancel).await;
        assert!(matches!(outcome, RunOutcome::Failed(StockWatchError::Cancelled)));
        assert_eq!(h.calculator.calls(), 1);
        assert_eq!(h.channel.admin_count(), 0);
    }
}
