//! Scheduler Engine: owns the trigger set and fires the executor.
//! Uses tokio::interval for zero-overhead ticking (sleeps between checks).
//!
//! ```text
//! run loop
//!   ├── reconcile tick (every reconcile_interval_secs) → store.list → reconcile
//!   └── fire tick (every tick_interval_secs)
//!         └── due trigger → dispatch(id)
//!               ├── id already running → skip + count (never queued)
//!               └── TaskTracker::spawn → semaphore permit → executor.run
//!                     └── Skipped(NotFound | Inactive | InvalidConfig) → drop trigger
//! ```
//!
//! Shutdown cancels the shared token (retry loops stop at their next backoff),
//! closes the tracker and waits for in-flight runs up to a grace period.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use stockwatch_core::config::SchedulerConfig;
use stockwatch_core::error::{Result, StockWatchError};
use stockwatch_core::traits::TaskStore;
use stockwatch_core::types::{MonitoringTask, TaskPatch};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::cron::{CronSchedule, validate_task};
use crate::executor::{RunOutcome, SkipReason, TaskExecutor};

/// One installed recurring trigger.
#[derive(Debug, Clone)]
struct Trigger {
    schedule: CronSchedule,
    next_fire: DateTime<Utc>,
}

/// Execution counters. Exposed for observability only, never escalated.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    fired: AtomicU64,
    skipped_overlap: AtomicU64,
    completed: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time copy of `SchedulerStats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub fired: u64,
    pub skipped_overlap: u64,
    pub completed: u64,
    pub skipped: u64,
    pub failed: u64,
}

impl SchedulerStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            fired: self.fired.load(Ordering::Relaxed),
            skipped_overlap: self.skipped_overlap.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    fn record(&self, outcome: &RunOutcome) {
        let counter = match outcome {
            RunOutcome::Completed { .. } => &self.completed,
            RunOutcome::Skipped(_) => &self.skipped,
            RunOutcome::Failed(_) => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// What a reconcile pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub installed: usize,
    pub removed: usize,
    pub unchanged: usize,
    pub invalid: usize,
}

/// The scheduler: manages triggers and dispatches executions.
pub struct Scheduler {
    executor: Arc<TaskExecutor>,
    config: SchedulerConfig,
    triggers: Mutex<HashMap<String, Trigger>>,
    running: Arc<Mutex<HashSet<String>>>,
    /// (task id, schedule) pairs already reported as invalid.
    reported_invalid: Mutex<HashSet<(String, String)>>,
    permits: Arc<Semaphore>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    stats: SchedulerStats,
}

/// Per-id execution claim, released on drop.
struct RunningGuard {
    running: Arc<Mutex<HashSet<String>>>,
    id: String,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        lock(&self.running).remove(&self.id);
    }
}

impl Scheduler {
    /// `shutdown` is shared with the notification channels so their retry
    /// loops stop together with the scheduler.
    pub fn new(
        executor: Arc<TaskExecutor>,
        config: SchedulerConfig,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let permits = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Arc::new(Self {
            executor,
            config,
            triggers: Mutex::new(HashMap::new()),
            running: Arc::new(Mutex::new(HashSet::new())),
            reported_invalid: Mutex::new(HashSet::new()),
            permits,
            shutdown,
            tracker: TaskTracker::new(),
            stats: SchedulerStats::default(),
        })
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Ids with an installed trigger, sorted.
    pub fn scheduled_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.triggers).keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Next firing of an installed trigger.
    pub fn next_fire(&self, id: &str) -> Option<DateTime<Utc>> {
        lock(&self.triggers).get(id).map(|t| t.next_fire)
    }

    /// Ids currently executing, sorted.
    pub fn running_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.running).iter().cloned().collect();
        ids.sort();
        ids
    }

    /// Make the trigger set match `tasks`: one trigger per active task with a
    /// valid record and schedule. Unchanged schedules keep their next firing.
    pub async fn reconcile(&self, tasks: &[MonitoringTask]) -> ReconcileSummary {
        let now = Utc::now();
        let mut summary = ReconcileSummary::default();
        let mut desired: HashMap<&str, CronSchedule> = HashMap::new();
        let mut invalid: Vec<(&MonitoringTask, StockWatchError)> = Vec::new();

        for task in tasks.iter().filter(|t| t.active) {
            match validate_task(task) {
                Ok(schedule) => {
                    desired.insert(task.id.as_str(), schedule);
                }
                Err(e) => invalid.push((task, e)),
            }
        }
        summary.invalid = invalid.len();

        {
            let mut triggers = lock(&self.triggers);
            let before = triggers.len();
            triggers.retain(|id, _| desired.contains_key(id.as_str()));
            summary.removed = before - triggers.len();

            for (id, schedule) in desired {
                match triggers.get(id) {
                    Some(existing) if existing.schedule == schedule => summary.unchanged += 1,
                    _ => match schedule.next_after(now) {
                        Some(next_fire) => {
                            tracing::info!(
                                "📅 Trigger installed for {id}: '{schedule}' (next {next_fire})"
                            );
                            triggers.insert(id.to_string(), Trigger { schedule, next_fire });
                            summary.installed += 1;
                        }
                        None => {
                            tracing::warn!(
                                "⚠️ Schedule '{schedule}' of {id} never fires, not installed"
                            );
                            if triggers.remove(id).is_some() {
                                summary.removed += 1;
                            }
                        }
                    },
                }
            }
        }

        self.report_invalid(&invalid).await;

        if summary.installed > 0 || summary.removed > 0 {
            tracing::info!(
                "🔄 Reconciled: {} installed, {} removed, {} unchanged, {} invalid",
                summary.installed,
                summary.removed,
                summary.unchanged,
                summary.invalid
            );
        }
        summary
    }

    /// Reload every task from the store and reconcile.
    pub async fn reconcile_from_store(&self) -> Result<ReconcileSummary> {
        let tasks = self.executor.store().list().await?;
        Ok(self.reconcile(&tasks).await)
    }

    /// Log each invalid (id, schedule) once; optionally deactivate the task.
    async fn report_invalid(&self, invalid: &[(&MonitoringTask, StockWatchError)]) {
        let fresh: Vec<&(&MonitoringTask, StockWatchError)> = {
            let mut reported = lock(&self.reported_invalid);
            let current: HashSet<(String, String)> = invalid
                .iter()
                .map(|(t, _)| (t.id.clone(), t.schedule.clone()))
                .collect();
            reported.retain(|key| current.contains(key));
            invalid
                .iter()
                .filter(|(t, _)| reported.insert((t.id.clone(), t.schedule.clone())))
                .collect()
        };

        for (task, err) in fresh {
            tracing::warn!("⚠️ Task {} excluded from scheduling: {err}", task.id);
            if self.config.deactivate_invalid_tasks {
                self.deactivate(&task.id).await;
            }
        }
    }

    async fn deactivate(&self, id: &str) {
        match self
            .executor
            .store()
            .update(id, TaskPatch::set_active(false))
            .await
        {
            Ok(()) => tracing::info!("⏸️ Task {id} deactivated"),
            Err(e) => tracing::warn!("⚠️ Failed to deactivate task {id}: {e}"),
        }
    }

    /// Claim `id` for execution. `None` when a run for it is in progress.
    fn try_claim(&self, id: &str) -> Option<RunningGuard> {
        if lock(&self.running).insert(id.to_string()) {
            Some(RunningGuard {
                running: Arc::clone(&self.running),
                id: id.to_string(),
            })
        } else {
            self.stats.skipped_overlap.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    /// Advance due triggers and return their ids.
    fn take_due(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut triggers = lock(&self.triggers);
        let mut due = Vec::new();
        let mut exhausted = Vec::new();
        for (id, trigger) in triggers.iter_mut() {
            if trigger.next_fire > now {
                continue;
            }
            due.push(id.clone());
            match trigger.schedule.next_after(now) {
                Some(next) => trigger.next_fire = next,
                None => exhausted.push(id.clone()),
            }
        }
        for id in exhausted {
            triggers.remove(&id);
        }
        due.sort();
        due
    }

    /// Fire every trigger due at `now`.
    pub fn fire_due(self: &Arc<Self>, now: DateTime<Utc>) -> usize {
        self.take_due(now)
            .into_iter()
            .filter(|id| self.dispatch(id))
            .count()
    }

    /// Start one execution for `id` in the background, unless one is running.
    pub fn dispatch(self: &Arc<Self>, id: &str) -> bool {
        if self.shutdown.is_cancelled() {
            return false;
        }
        let Some(claim) = self.try_claim(id) else {
            tracing::warn!("⏭️ Skipping firing of {id}: previous run still in progress");
            return false;
        };

        self.stats.fired.fetch_add(1, Ordering::Relaxed);
        tracing::info!("🔔 Task triggered: {id}");
        let this = Arc::clone(self);
        let id = id.to_string();
        self.tracker.spawn(async move {
            let outcome = this.run_claimed(&id, claim).await;
            if outcome.drops_trigger() {
                this.drop_trigger(&id, &outcome).await;
            }
        });
        true
    }

    /// Manual run. Bypasses the recurrence and never touches triggers.
    pub async fn trigger_now(self: &Arc<Self>, id: &str) -> RunOutcome {
        if self.shutdown.is_cancelled() {
            return RunOutcome::Skipped(SkipReason::ShuttingDown);
        }
        let Some(claim) = self.try_claim(id) else {
            tracing::warn!("⏭️ Manual run of {id} refused: previous run still in progress");
            return RunOutcome::Skipped(SkipReason::AlreadyRunning);
        };

        tracing::info!("▶️ Manual run requested for {id}");
        let this = Arc::clone(self);
        let owned = id.to_string();
        let handle = self
            .tracker
            .spawn(async move { this.run_claimed(&owned, claim).await });
        match handle.await {
            Ok(outcome) => outcome,
            Err(e) => RunOutcome::Failed(StockWatchError::Internal(format!(
                "execution task for {id} ended abnormally: {e}"
            ))),
        }
    }

    /// Wait for a concurrency permit, run, record. The claim is held throughout.
    ///
    /// Shutdown only preempts a run still queued behind the concurrency limit.
    /// A run that can take a permit at once is in-flight work and completes.
    async fn run_claimed(&self, id: &str, _claim: RunningGuard) -> RunOutcome {
        let permit = tokio::select! {
            biased;
            permit = Arc::clone(&self.permits).acquire_owned() => permit.ok(),
            _ = self.shutdown.cancelled() => None,
        };

        let outcome = match permit {
            Some(_permit) => self.executor.run(id, &self.shutdown).await,
            None => RunOutcome::Skipped(SkipReason::ShuttingDown),
        };
        self.stats.record(&outcome);
        tracing::info!("🏁 {id}: {outcome}");
        outcome
    }

    /// Self-healing: a firing found its task gone, inactive or invalid.
    async fn drop_trigger(&self, id: &str, outcome: &RunOutcome) {
        if lock(&self.triggers).remove(id).is_some() {
            tracing::info!("🧹 Dropped trigger for {id} ({outcome})");
        }
        if self.config.deactivate_invalid_tasks
            && matches!(outcome, RunOutcome::Skipped(SkipReason::InvalidConfig(_)))
        {
            self.deactivate(id).await;
        }
    }

    /// Main loop. Returns once the shutdown token is cancelled.
    pub async fn run(self: Arc<Self>) {
        let tick_secs = self.config.tick_interval_secs.max(1);
        let reconcile_secs = self.config.reconcile_interval_secs.max(1);
        tracing::info!(
            "⏰ Scheduler started (tick every {tick_secs}s, reconcile every {reconcile_secs}s)"
        );

        let mut tick = tokio::time::interval(Duration::from_secs(tick_secs));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut reconcile = tokio::time::interval(Duration::from_secs(reconcile_secs));
        reconcile.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = reconcile.tick() => {
                    if let Err(e) = self.reconcile_from_store().await {
                        tracing::warn!("⚠️ Reconcile failed, keeping current triggers: {e}");
                    }
                }
                _ = tick.tick() => {
                    self.fire_due(Utc::now());
                }
            }
        }

        tracing::info!("⏰ Scheduler loop stopped");
    }

    /// Spawn the main loop as a background tokio task.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(self).run())
    }

    /// Stop firing, let in-flight runs finish within the grace period.
    /// Returns false when runs had to be abandoned.
    pub async fn shutdown(&self) -> bool {
        tracing::info!("🛑 Scheduler shutting down");
        self.shutdown.cancel();
        self.tracker.close();

        let grace = Duration::from_secs(self.config.shutdown_grace_secs);
        match tokio::time::timeout(grace, self.tracker.wait()).await {
            Ok(()) => {
                tracing::info!("✅ All executions finished");
                true
            }
            Err(_) => {
                tracing::warn!(
                    "⚠️ Shutdown grace of {grace:?} elapsed, abandoning {} execution(s): {:?}",
                    self.tracker.len(),
                    self.running_ids()
                );
                false
            }
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;
    use stockwatch_core::types::NotifyCondition;

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            tick_interval_secs: 1,
            reconcile_interval_secs: 60,
            max_concurrent: 4,
            shutdown_grace_secs: 5,
            deactivate_invalid_tasks: false,
        }
    }

    fn scheduler(h: &Harness, config: SchedulerConfig) -> Arc<Scheduler> {
        Scheduler::new(h.executor.clone(), config, CancellationToken::new())
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent() {
        let h = Harness::new(ScriptedCalculator::returning(two_shortages()), RecordingChannel::new());
        let s = scheduler(&h, config());
        let tasks = vec![
            task("a", NotifyCondition::Always),
            task("b", NotifyCondition::OnChange),
        ];

        let first = s.reconcile(&tasks).await;
        assert_eq!(first.installed, 2);
        let next_a = s.next_fire("a");

        let second = s.reconcile(&tasks).await;
        assert_eq!(second.installed, 0);
        assert_eq!(second.removed, 0);
        assert_eq!(second.unchanged, 2);
        assert_eq!(s.scheduled_ids(), vec!["a", "b"]);
        assert_eq!(s.next_fire("a"), next_a);
    }

    #[tokio::test]
    async fn test_reconcile_removes_absent_inactive_and_invalid() {
        let h = Harness::new(ScriptedCalculator::returning(two_shortages()), RecordingChannel::new());
        let s = scheduler(&h, config());
        let mut tasks = vec![
            task("a", NotifyCondition::Always),
            task("b", NotifyCondition::Always),
            task("c", NotifyCondition::Always),
        ];
        s.reconcile(&tasks).await;
        assert_eq!(s.scheduled_ids().len(), 3);

        tasks[0].active = false;
        tasks[1].schedule = "61 * * * *".into();
        tasks.pop();
        tasks.push(task("d", NotifyCondition::Always));

        let summary = s.reconcile(&tasks).await;
        assert_eq!(summary.removed, 3);
        assert_eq!(summary.installed, 1);
        assert_eq!(summary.invalid, 1);
        assert_eq!(s.scheduled_ids(), vec!["d"]);
    }

    #[tokio::test]
    async fn test_schedule_change_reinstalls_trigger() {
        let h = Harness::new(ScriptedCalculator::returning(two_shortages()), RecordingChannel::new());
        let s = scheduler(&h, config());
        let mut t = task("a", NotifyCondition::Always);
        s.reconcile(std::slice::from_ref(&t)).await;

        t.schedule = "@yearly".into();
        let summary = s.reconcile(std::slice::from_ref(&t)).await;
        assert_eq!(summary.installed, 1);
        assert!(s.next_fire("a").unwrap() > Utc::now() + chrono::Duration::minutes(2));
    }

    #[tokio::test]
    async fn test_invalid_task_deactivated_when_configured() {
        let h = Harness::new(ScriptedCalculator::returning(two_shortages()), RecordingChannel::new());
        let mut bad = task("bad", NotifyCondition::Always);
        bad.schedule = "nonsense".into();
        h.store.create(bad).await.unwrap();

        let s = scheduler(
            &h,
            SchedulerConfig {
                deactivate_invalid_tasks: true,
                ..config()
            },
        );
        let summary = s.reconcile_from_store().await.unwrap();
        assert_eq!(summary.invalid, 1);
        assert!(!h.store.get("bad").await.unwrap().unwrap().active);

        // Reported once: a second pass over the same record writes nothing.
        let mut again = h.store.get("bad").await.unwrap().unwrap();
        again.active = true;
        s.reconcile(&[again]).await;
        assert_eq!(h.store.active_writes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_same_id_never_overlaps() {
        let calc = ScriptedCalculator::returning(two_shortages()).slow(Duration::from_millis(300));
        let h = Harness::new(calc, RecordingChannel::new());
        h.store.create(task("a", NotifyCondition::Always)).await.unwrap();
        let s = scheduler(&h, config());

        assert!(s.dispatch("a"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!s.dispatch("a"));
        assert!(!s.dispatch("a"));

        assert!(s.shutdown().await);
        assert_eq!(h.calculator.calls(), 1);
        assert_eq!(h.calculator.max_in_flight(), 1);
        let stats = s.stats();
        assert_eq!(stats.fired, 1);
        assert_eq!(stats.skipped_overlap, 2);
        assert_eq!(stats.completed, 1);
    }

    #[tokio::test]
    async fn test_distinct_ids_run_concurrently() {
        let calc = ScriptedCalculator::returning(two_shortages()).slow(Duration::from_millis(200));
        let h = Harness::new(calc, RecordingChannel::new());
        for id in ["a", "b", "c"] {
            h.store.create(task(id, NotifyCondition::Always)).await.unwrap();
        }
        let s = scheduler(&h, config());
        for id in ["a", "b", "c"] {
            assert!(s.dispatch(id));
        }
        assert!(s.shutdown().await);
        assert_eq!(h.calculator.calls(), 3);
        assert!(h.calculator.max_in_flight() > 1);
        assert_eq!(h.channel.report_count(), 3);
    }

    #[tokio::test]
    async fn test_concurrency_limit() {
        let calc = ScriptedCalculator::returning(two_shortages()).slow(Duration::from_millis(100));
        let h = Harness::new(calc, RecordingChannel::new());
        for id in ["a", "b", "c", "d"] {
            h.store.create(task(id, NotifyCondition::Always)).await.unwrap();
        }
        let s = scheduler(
            &h,
            SchedulerConfig {
                max_concurrent: 1,
                ..config()
            },
        );
        for id in ["a", "b", "c", "d"] {
            s.dispatch(id);
        }
        assert!(s.shutdown().await);
        assert_eq!(h.calculator.max_in_flight(), 1);
    }

    #[tokio::test]
    async fn test_firing_for_vanished_task_drops_trigger() {
        let h = Harness::new(ScriptedCalculator::returning(two_shortages()), RecordingChannel::new());
        let s = scheduler(&h, config());
        // Trigger installed from a snapshot, but the store has no such task.
        s.reconcile(&[task("ghost", NotifyCondition::Always)]).await;
        assert_eq!(s.scheduled_ids(), vec!["ghost"]);

        let later = s.next_fire("ghost").unwrap();
        assert_eq!(s.fire_due(later), 1);
        assert!(s.shutdown().await);
        assert!(s.scheduled_ids().is_empty());
        assert_eq!(s.stats().skipped, 1);
    }

    #[tokio::test]
    async fn test_fire_due_only_fires_due_triggers() {
        let h = Harness::new(ScriptedCalculator::returning(two_shortages()), RecordingChannel::new());
        h.store.create(task("a", NotifyCondition::Always)).await.unwrap();
        let mut yearly = task("b", NotifyCondition::Always);
        yearly.schedule = "@yearly".into();
        h.store.create(yearly).await.unwrap();
        let s = scheduler(&h, config());
        s.reconcile_from_store().await.unwrap();

        let due_at = s.next_fire("a").unwrap();
        assert_eq!(s.fire_due(due_at - chrono::Duration::seconds(1)), 0);
        assert_eq!(s.fire_due(due_at), 1);
        assert!(s.next_fire("a").unwrap() > due_at);
        assert!(s.shutdown().await);
        assert_eq!(h.channel.report_count(), 1);
    }

    #[tokio::test]
    async fn test_trigger_now_leaves_triggers_alone() {
        let h = Harness::new(ScriptedCalculator::returning(two_shortages()), RecordingChannel::new());
        h.store.create(task("a", NotifyCondition::Always)).await.unwrap();
        let s = scheduler(&h, config());

        let outcome = s.trigger_now("a").await;
        assert!(matches!(outcome, RunOutcome::Completed { notified: true }));
        assert!(s.scheduled_ids().is_empty());

        // A missing task is reported, and no trigger is touched either way.
        s.reconcile(&[task("ghost", NotifyCondition::Always)]).await;
        let outcome = s.trigger_now("ghost").await;
        assert!(matches!(outcome, RunOutcome::Skipped(SkipReason::NotFound)));
        assert_eq!(s.scheduled_ids(), vec!["ghost"]);
    }

    #[tokio::test]
    async fn test_trigger_now_while_running_is_skipped() {
        let calc = ScriptedCalculator::returning(two_shortages()).slow(Duration::from_millis(300));
        let h = Harness::new(calc, RecordingChannel::new());
        h.store.create(task("a", NotifyCondition::Always)).await.unwrap();
        let s = scheduler(&h, config());

        assert!(s.dispatch("a"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        let outcome = s.trigger_now("a").await;
        assert!(matches!(outcome, RunOutcome::Skipped(SkipReason::AlreadyRunning)));
        assert!(s.shutdown().await);
        assert_eq!(h.calculator.calls(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_stops_retry_loops_and_new_firings() {
        let h = Harness::new(
            ScriptedCalculator::failing(|| StockWatchError::TransientDependency("503".into())),
            RecordingChannel::new(),
        );
        h.store.create(task("a", NotifyCondition::Always)).await.unwrap();
        // Long backoff: without cancellation the run would take minutes.
        let executor = Arc::new(
            TaskExecutor::new(
                h.store.clone(),
                h.calculator.clone(),
                stockwatch_core::retry::RetryPolicy::new(5, Duration::from_secs(60)),
                Duration::from_secs(5),
            )
            .with_channel(h.channel.clone()),
        );
        let s = Scheduler::new(executor, config(), CancellationToken::new());

        assert!(s.dispatch("a"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(s.running_ids(), vec!["a"]);

        assert!(s.shutdown().await);
        assert!(s.running_ids().is_empty());
        assert_eq!(h.calculator.calls(), 1);
        assert_eq!(h.channel.admin_count(), 0);
        assert!(!s.dispatch("a"));
        assert!(matches!(
            s.trigger_now("a").await,
            RunOutcome::Skipped(SkipReason::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn test_dispatched_run_completes_across_immediate_shutdown() {
        for _ in 0..20 {
            let h = Harness::new(
                ScriptedCalculator::returning(two_shortages()),
                RecordingChannel::new(),
            );
            for id in ["a", "b", "c"] {
                h.store.create(task(id, NotifyCondition::Always)).await.unwrap();
            }
            let s = scheduler(&h, config());
            for id in ["a", "b", "c"] {
                assert!(s.dispatch(id));
            }
            assert!(s.shutdown().await);

            assert_eq!(h.calculator.calls(), 3);
            assert_eq!(h.channel.report_count(), 3);
            let stats = s.stats();
            assert_eq!(stats.fired, 3);
            assert_eq!(stats.completed, 3);
            assert_eq!(stats.skipped, 0);
        }
    }

    #[tokio::test]
    async fn test_queued_run_is_skipped_on_shutdown() {
        let calc = ScriptedCalculator::returning(two_shortages()).slow(Duration::from_millis(200));
        let h = Harness::new(calc, RecordingChannel::new());
        for id in ["a", "b"] {
            h.store.create(task(id, NotifyCondition::Always)).await.unwrap();
        }
        let s = scheduler(
            &h,
            SchedulerConfig {
                max_concurrent: 1,
                ..config()
            },
        );
        assert!(s.dispatch("a"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(s.dispatch("b"));
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(s.shutdown().await);
        assert_eq!(h.calculator.calls(), 1);
        let stats = s.stats();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.skipped, 1);
    }

    #[tokio::test]
    async fn test_shutdown_grace_elapses() {
        let calc = ScriptedCalculator::returning(two_shortages()).slow(Duration::from_secs(5));
        let h = Harness::new(calc, RecordingChannel::new());
        h.store.create(task("a", NotifyCondition::Always)).await.unwrap();
        let s = scheduler(
            &h,
            SchedulerConfig {
                shutdown_grace_secs: 0,
                ..config()
            },
        );
        assert!(s.dispatch("a"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!s.shutdown().await);
    }

    #[tokio::test]
    async fn test_run_loop_reconciles_and_stops() {
        let h = Harness::new(ScriptedCalculator::returning(two_shortages()), RecordingChannel::new());
        h.store.create(task("a", NotifyCondition::Always)).await.unwrap();
        let s = scheduler(&h, config());

        let handle = s.spawn();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(s.scheduled_ids(), vec!["a"]);

        s.shutdown().await;
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
