//! Test doubles for the executor and scheduler tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use stockwatch_core::error::{Result, StockWatchError};
use stockwatch_core::retry::RetryPolicy;
use stockwatch_core::traits::{Calculator, DeliveryResult, NotifyChannel, TaskStore};
use stockwatch_core::types::{
    CalculationResult, DetailedRow, LineItem, MonitoringTask, NotificationRequest,
    NotifyCondition, TaskPatch,
};

use crate::executor::TaskExecutor;
use crate::store::FileTaskStore;

/// Calculator that replays scripted replies, then repeats the fallback.
pub struct ScriptedCalculator {
    replies: Mutex<VecDeque<Result<CalculationResult>>>,
    fallback: Mutex<Box<dyn Fn() -> Result<CalculationResult> + Send>>,
    delay: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedCalculator {
    pub fn returning(result: CalculationResult) -> Self {
        Self::with_fallback(move || Ok(result.clone()))
    }

    pub fn failing(make: fn() -> StockWatchError) -> Self {
        Self::with_fallback(move || Err(make()))
    }

    fn with_fallback(f: impl Fn() -> Result<CalculationResult> + Send + 'static) -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(Box::new(f)),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn then(self, reply: Result<CalculationResult>) -> Self {
        self.replies.lock().unwrap().push_back(reply);
        self
    }

    pub fn slow(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Calculator for ScriptedCalculator {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn evaluate(&self, _items: &[LineItem]) -> Result<CalculationResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let scripted = self.replies.lock().unwrap().pop_front();
        match scripted {
            Some(reply) => reply,
            None => {
                let fallback = self.fallback.lock().unwrap();
                (*fallback)()
            }
        }
    }
}

/// Channel that records everything and answers reports from a script.
pub struct RecordingChannel {
    pub reports: Mutex<Vec<NotificationRequest>>,
    pub admin: Mutex<Vec<(String, String)>>,
    report_replies: Mutex<VecDeque<DeliveryResult>>,
    default_reply: DeliveryResult,
}

impl RecordingChannel {
    pub fn new() -> Self {
        Self::answering(DeliveryResult::Sent)
    }

    pub fn answering(default_reply: DeliveryResult) -> Self {
        Self {
            reports: Mutex::new(Vec::new()),
            admin: Mutex::new(Vec::new()),
            report_replies: Mutex::new(VecDeque::new()),
            default_reply,
        }
    }

    pub fn then(self, reply: DeliveryResult) -> Self {
        self.report_replies.lock().unwrap().push_back(reply);
        self
    }

    pub fn report_count(&self) -> usize {
        self.reports.lock().unwrap().len()
    }

    pub fn admin_count(&self) -> usize {
        self.admin.lock().unwrap().len()
    }
}

#[async_trait]
impl NotifyChannel for RecordingChannel {
    fn name(&self) -> &str {
        "recording"
    }

    async fn deliver_report(&self, request: &NotificationRequest) -> DeliveryResult {
        self.reports.lock().unwrap().push(request.clone());
        let scripted = self.report_replies.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| self.default_reply.clone())
    }

    async fn deliver_admin(&self, subject: &str, details: &str) -> DeliveryResult {
        self.admin
            .lock()
            .unwrap()
            .push((subject.to_string(), details.to_string()));
        DeliveryResult::Sent
    }
}

/// Store wrapper counting hash writes, optionally injecting one conflict
/// by changing the stored hash right before the next hash update.
pub struct CountingStore {
    inner: FileTaskStore,
    pub hash_writes: AtomicUsize,
    pub active_writes: AtomicUsize,
    race_with: Mutex<Option<String>>,
}

impl CountingStore {
    pub fn new() -> Self {
        Self {
            inner: FileTaskStore::ephemeral(),
            hash_writes: AtomicUsize::new(0),
            active_writes: AtomicUsize::new(0),
            race_with: Mutex::new(None),
        }
    }

    /// Before the next hash update, a concurrent writer stores `hash`.
    pub fn race_next_hash_update(&self, hash: &str) {
        *self.race_with.lock().unwrap() = Some(hash.to_string());
    }

    pub fn hash_writes(&self) -> usize {
        self.hash_writes.load(Ordering::SeqCst)
    }

    pub async fn stored_hash(&self, id: &str) -> Option<String> {
        self.inner
            .get(id)
            .await
            .unwrap()
            .and_then(|t| t.last_significant_hash)
    }
}

#[async_trait]
impl TaskStore for CountingStore {
    async fn list(&self) -> Result<Vec<MonitoringTask>> {
        self.inner.list().await
    }

    async fn get(&self, id: &str) -> Result<Option<MonitoringTask>> {
        self.inner.get(id).await
    }

    async fn update(&self, id: &str, patch: TaskPatch) -> Result<()> {
        if patch.last_significant_hash.is_some() {
            let racing = self.race_with.lock().unwrap().take();
            if let Some(hash) = racing {
                let expected = self.inner.get(id).await?.and_then(|t| t.last_significant_hash);
                self.inner.update(id, TaskPatch::set_hash(expected, hash)).await?;
            }
            let result = self.inner.update(id, patch.clone()).await;
            if result.is_ok() {
                self.hash_writes.fetch_add(1, Ordering::SeqCst);
            }
            return result;
        }
        if patch.active.is_some() {
            self.active_writes.fetch_add(1, Ordering::SeqCst);
        }
        self.inner.update(id, patch).await
    }

    async fn create(&self, task: MonitoringTask) -> Result<()> {
        self.inner.create(task).await
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        self.inner.delete(id).await
    }
}

pub fn task(id: &str, condition: NotifyCondition) -> MonitoringTask {
    let mut t = MonitoringTask::new(
        "Main board",
        "* * * * *",
        vec![
            LineItem::new("R10k", 40.0),
            LineItem::new("C100n", 12.0),
            LineItem::new("U1", 1.0),
        ],
        vec!["buyer@example.com".into()],
    )
    .with_condition(condition);
    t.id = id.into();
    t
}

pub fn row(name: &str, shortage: f64) -> DetailedRow {
    DetailedRow {
        item_name: name.into(),
        version: None,
        required: 10.0,
        available: 10.0 - shortage,
        shortage,
        critical: false,
    }
}

/// Three items, two of them short.
pub fn two_shortages() -> CalculationResult {
    CalculationResult::from_rows(vec![row("R10k", 4.0), row("C100n", 2.0), row("U1", 0.0)])
}

pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay_ms: 1,
        max_jitter_ms: 0,
        max_delay_ms: 5,
    }
}

pub struct Harness {
    pub store: Arc<CountingStore>,
    pub calculator: Arc<ScriptedCalculator>,
    pub channel: Arc<RecordingChannel>,
    pub executor: Arc<TaskExecutor>,
}

impl Harness {
    pub fn new(calculator: ScriptedCalculator, channel: RecordingChannel) -> Self {
        let store = Arc::new(CountingStore::new());
        let calculator = Arc::new(calculator);
        let channel = Arc::new(channel);
        let executor = Arc::new(
            TaskExecutor::new(
                store.clone(),
                calculator.clone(),
                fast_retry(3),
                Duration::from_secs(5),
            )
            .with_channel(channel.clone()),
        );
        Self {
            store,
            calculator,
            channel,
            executor,
        }
    }
}
