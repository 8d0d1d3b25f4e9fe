//! Source scheduler.
//!
//! Owns the runtime state of every configured source and runs their
//! collection cycles:
//!
//! ```text
//!            ┌────────────── BinaryHeap<(next_run, priority, source)> ─────────────┐
//!            ▼                                                                     │
//!   run() loop ── due ──▶ spawn cycle ──▶ ingest::run_cycle ──▶ record_result ──▶ Finished
//!      │                       (semaphore: max_concurrency)                 (reschedule at
//!      ├── health tick ──▶ check_health (advisory)                           now + interval)
//!      ├── process tick ─▶ Processor::process_pending
//!      └── root token cancelled ──▶ stop, wait for in-flight cycles
//! ```
//!
//! # Invariants
//!
//! - A source never has two cycles in flight. The queue holds at most one
//!   entry per source, and every cycle (scheduled or manual) claims the
//!   source in the in-flight set first.
//! - A failed cycle is still rescheduled. Only the error threshold takes
//!   a source off the schedule: once its cumulative error count exceeds
//!   `error_threshold`, its status becomes `error` and its timer token is
//!   cancelled until [`Scheduler::reset_source`].
//! - Health flags are advisory and never pause scheduling.
//!
//! Source status and health are persisted after every cycle and restored
//! by [`Scheduler::restore_status`], so an `error` source stays off the
//! schedule across restarts.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use casewatch_core::models::{
    DataSourceDescriptor, Priority, SourceHealthStatus, SourceStatus, SourceStatusSnapshot,
    SyncResult,
};
use casewatch_core::store::RecordStore;

use crate::config::{Config, SchedulerConfig};
use crate::ingest;
use crate::process::Processor;
use crate::progress::{NoProgress, SyncProgressReporter};
use crate::rate_limit::RateLimiter;
use crate::traits::ConnectorRegistry;

/// Weight of the newest sample in the rolling response time.
const RESPONSE_TIME_ALPHA: f64 = 0.2;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct SourceState {
    descriptor: DataSourceDescriptor,
    health: SourceHealthStatus,
    /// Cancels this source's pending timer. Child of the root token.
    token: CancellationToken,
    /// Health reference point for sources that never succeeded.
    tracked_since: DateTime<Utc>,
}

impl SourceState {
    fn snapshot(&self) -> SourceStatusSnapshot {
        SourceStatusSnapshot {
            source_id: self.descriptor.id.clone(),
            name: self.descriptor.name.clone(),
            status: self.descriptor.status,
            error_count: self.descriptor.error_count,
            health: self.health.clone(),
        }
    }
}

enum LoopMessage {
    /// A scheduled cycle ended; run again after the interval.
    Finished(String),
    /// A source was reset; run it now.
    Reactivated(String),
}

/// Releases a source's in-flight claim when the cycle ends.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<String>>,
    id: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        lock(self.set).remove(&self.id);
    }
}

struct Inner {
    config: SchedulerConfig,
    store: Arc<dyn RecordStore>,
    registry: ConnectorRegistry,
    progress: Arc<dyn SyncProgressReporter>,
    states: Mutex<BTreeMap<String, SourceState>>,
    in_flight: Mutex<HashSet<String>>,
    permits: Semaphore,
    root: CancellationToken,
    messages: mpsc::UnboundedSender<LoopMessage>,
    inbox: Mutex<Option<mpsc::UnboundedReceiver<LoopMessage>>>,
    /// Set while [`Scheduler::run`] drains `inbox`.
    looping: AtomicBool,
}

/// Cloneable handle to the scheduler.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        descriptors: Vec<DataSourceDescriptor>,
        registry: ConnectorRegistry,
        store: Arc<dyn RecordStore>,
        progress: Arc<dyn SyncProgressReporter>,
    ) -> Self {
        let root = CancellationToken::new();
        let now = Utc::now();
        let states = descriptors
            .into_iter()
            .map(|descriptor| {
                let state = SourceState {
                    health: SourceHealthStatus::new(descriptor.id.clone()),
                    token: root.child_token(),
                    tracked_since: now,
                    descriptor,
                };
                (state.descriptor.id.clone(), state)
            })
            .collect();
        let (messages, inbox) = mpsc::unbounded_channel();

        Self {
            inner: Arc::new(Inner {
                permits: Semaphore::new(config.max_concurrency.max(1)),
                config,
                store,
                registry,
                progress,
                states: Mutex::new(states),
                in_flight: Mutex::new(HashSet::new()),
                root,
                messages,
                inbox: Mutex::new(Some(inbox)),
                looping: AtomicBool::new(false),
            }),
        }
    }

    /// Build a scheduler for every configured source and restore their
    /// persisted status.
    pub async fn from_config(
        config: &Config,
        store: Arc<dyn RecordStore>,
        limiter: Arc<RateLimiter>,
        progress: Arc<dyn SyncProgressReporter>,
    ) -> Result<Self> {
        let registry = ConnectorRegistry::from_config(config, limiter)?;
        let scheduler = Self::new(
            config.scheduler.clone(),
            config.descriptors(),
            registry,
            store,
            progress,
        );
        scheduler.restore_status().await?;
        Ok(scheduler)
    }

    /// Apply persisted status snapshots to the configured sources.
    ///
    /// Sources disabled in config stay inactive.
    pub async fn restore_status(&self) -> Result<()> {
        let ids: Vec<String> = lock(&self.inner.states).keys().cloned().collect();
        for id in ids {
            let Some(snapshot) = self.inner.store.get_source_status(&id).await? else {
                continue;
            };
            let mut states = lock(&self.inner.states);
            let Some(state) = states.get_mut(&id) else {
                continue;
            };
            state.descriptor.error_count = snapshot.error_count;
            state.health = snapshot.health;
            if state.descriptor.status != SourceStatus::Inactive
                && snapshot.status != SourceStatus::Inactive
            {
                state.descriptor.status = snapshot.status;
            }
            if state.descriptor.status == SourceStatus::Error {
                state.token.cancel();
            }
            tracing::debug!(
                source_id = %id,
                status = state.descriptor.status.as_str(),
                error_count = state.descriptor.error_count,
                "restored source status"
            );
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════
    // Queries
    // ═══════════════════════════════════════════════════════════════════

    /// Active sources, most urgent priority first.
    pub fn get_active_sources(&self) -> Vec<DataSourceDescriptor> {
        let mut active: Vec<DataSourceDescriptor> = lock(&self.inner.states)
            .values()
            .filter(|s| s.descriptor.status == SourceStatus::Active)
            .map(|s| s.descriptor.clone())
            .collect();
        active.sort_by(|a, b| {
            a.schedule
                .priority
                .cmp(&b.schedule.priority)
                .then_with(|| a.id.cmp(&b.id))
        });
        active
    }

    /// Every source with its health, ordered by id.
    pub fn sources(&self) -> Vec<(DataSourceDescriptor, SourceHealthStatus)> {
        lock(&self.inner.states)
            .values()
            .map(|s| (s.descriptor.clone(), s.health.clone()))
            .collect()
    }

    pub fn source(&self, id: &str) -> Option<(DataSourceDescriptor, SourceHealthStatus)> {
        lock(&self.inner.states)
            .get(id)
            .map(|s| (s.descriptor.clone(), s.health.clone()))
    }

    fn is_schedulable(&self, id: &str) -> Option<(Priority, u64)> {
        let states = lock(&self.inner.states);
        let state = states.get(id)?;
        let runnable = state.descriptor.status == SourceStatus::Active
            && !state.token.is_cancelled()
            && self.inner.registry.find(id).is_some();
        runnable.then_some((
            state.descriptor.schedule.priority,
            state.descriptor.schedule.interval_minutes,
        ))
    }

    // ═══════════════════════════════════════════════════════════════════
    // Cycles
    // ═══════════════════════════════════════════════════════════════════

    /// Run one cycle for a source unless one is already in flight.
    async fn run_source(&self, id: &str) -> Option<SyncResult> {
        let connector = self.inner.registry.find(id)?;
        if !lock(&self.inner.in_flight).insert(id.to_string()) {
            tracing::debug!(source_id = %id, "cycle already in flight, skipping");
            return None;
        }
        let _claim = InFlight {
            set: &self.inner.in_flight,
            id: id.to_string(),
        };
        let _permit = self.inner.permits.acquire().await.ok()?;

        let result =
            ingest::run_cycle(&*connector, &*self.inner.store, &*self.inner.progress).await;
        self.record_result(&result).await;
        Some(result)
    }

    /// Update source state from a finished cycle and persist it.
    async fn record_result(&self, result: &SyncResult) {
        let snapshot = {
            let mut states = lock(&self.inner.states);
            let Some(state) = states.get_mut(&result.source_id) else {
                return;
            };

            if result.success {
                let sample = result.duration_ms().max(0) as f64;
                let health = &mut state.health;
                health.average_response_ms = if health.average_response_ms == 0.0 {
                    sample
                } else {
                    RESPONSE_TIME_ALPHA * sample
                        + (1.0 - RESPONSE_TIME_ALPHA) * health.average_response_ms
                };
                health.last_successful_sync = Some(result.finished_at);
                health.consecutive_errors = 0;
                health.last_error = None;
                health.is_healthy = true;
            } else {
                state.descriptor.error_count += 1;
                state.health.consecutive_errors += 1;
                state.health.last_error = Some(result.errors.join("; "));

                if state.descriptor.error_count > self.inner.config.error_threshold
                    && state.descriptor.status == SourceStatus::Active
                {
                    state.descriptor.status = SourceStatus::Error;
                    state.token.cancel();
                    tracing::warn!(
                        source_id = %result.source_id,
                        error_count = state.descriptor.error_count,
                        "source exceeded error threshold, status set to error"
                    );
                }
            }
            state.snapshot()
        };

        if let Err(e) = self.inner.store.append_sync_result(result).await {
            tracing::error!(source_id = %result.source_id, error = %format!("{:#}", e), "failed to persist sync result");
        }
        if let Err(e) = self.inner.store.upsert_source_status(&snapshot).await {
            tracing::error!(source_id = %result.source_id, error = %format!("{:#}", e), "failed to persist source status");
        }
    }

    /// Run one source now, outside its schedule.
    pub async fn trigger_manual_sync(&self, id: &str) -> Result<SyncResult> {
        if self.source(id).is_none() {
            bail!("Unknown source: '{}'", id);
        }
        if self.inner.registry.find(id).is_none() {
            bail!("No connector registered for source '{}'", id);
        }
        match self.run_source(id).await {
            Some(result) => Ok(result),
            None => bail!("A collection cycle for '{}' is already running", id),
        }
    }

    /// Run the given sources (default: every active source) in parallel,
    /// bounded by `max_concurrency`. Sources with a cycle in flight are
    /// skipped.
    pub async fn run_parallel_collection(&self, ids: Option<&[String]>) -> Result<Vec<SyncResult>> {
        let ids: Vec<String> = match ids {
            Some(ids) => {
                for id in ids {
                    if self.source(id).is_none() {
                        bail!("Unknown source: '{}'", id);
                    }
                }
                ids.to_vec()
            }
            None => self.get_active_sources().into_iter().map(|d| d.id).collect(),
        };
        let results = join_all(ids.iter().map(|id| self.run_source(id))).await;
        Ok(results.into_iter().flatten().collect())
    }

    /// Launch every active source in parallel.
    pub async fn start_collection(&self) -> Vec<SyncResult> {
        let ids: Vec<String> = self.get_active_sources().into_iter().map(|d| d.id).collect();
        tracing::info!(sources = ids.len(), "starting collection for all active sources");
        let results = join_all(ids.iter().map(|id| self.run_source(id))).await;
        results.into_iter().flatten().collect()
    }

    /// Run active sources in groups of `batch_size`, pausing
    /// `batch_delay_secs` between groups.
    pub async fn run_batch_processing(&self, batch_size: usize) -> Vec<SyncResult> {
        let ids: Vec<String> = self.get_active_sources().into_iter().map(|d| d.id).collect();
        let delay = Duration::from_secs(self.inner.config.batch_delay_secs);
        let mut results = Vec::with_capacity(ids.len());

        for (n, group) in ids.chunks(batch_size.max(1)).enumerate() {
            if n > 0 && !delay.is_zero() {
                tracing::debug!(delay_secs = delay.as_secs(), "pausing between batches");
                tokio::time::sleep(delay).await;
            }
            tracing::info!(batch = n + 1, sources = group.len(), "running collection batch");
            let batch = join_all(group.iter().map(|id| self.run_source(id))).await;
            results.extend(batch.into_iter().flatten());
        }
        results
    }

    /// Reactivate a source: status `active`, error counters cleared.
    pub async fn reset_source(&self, id: &str) -> Result<()> {
        let snapshot = {
            let mut states = lock(&self.inner.states);
            let Some(state) = states.get_mut(id) else {
                bail!("Unknown source: '{}'", id);
            };
            state.descriptor.status = SourceStatus::Active;
            state.descriptor.error_count = 0;
            state.health.consecutive_errors = 0;
            state.health.last_error = None;
            if state.token.is_cancelled() {
                state.token = self.inner.root.child_token();
            }
            state.snapshot()
        };
        self.inner.store.upsert_source_status(&snapshot).await?;
        if self.inner.looping.load(Ordering::SeqCst) {
            if let Err(e) = self
                .inner
                .messages
                .send(LoopMessage::Reactivated(id.to_string()))
            {
                tracing::debug!(source_id = %id, error = %e, "scheduler loop gone, timer not rearmed");
            }
        }
        tracing::info!(source_id = %id, "source reset to active");
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════
    // Health
    // ═══════════════════════════════════════════════════════════════════

    /// Flag sources whose last success is older than twice their interval.
    /// Returns the ids of unhealthy sources.
    pub fn check_health(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut unhealthy = Vec::new();
        for (id, state) in lock(&self.inner.states).iter_mut() {
            let reference = state
                .health
                .last_successful_sync
                .unwrap_or(state.tracked_since);
            let allowed =
                chrono::Duration::minutes(2 * state.descriptor.schedule.interval_minutes as i64);
            let healthy = now - reference <= allowed;
            if state.health.is_healthy && !healthy {
                tracing::warn!(
                    source_id = %id,
                    last_success = ?state.health.last_successful_sync,
                    "source unhealthy: no successful sync within twice its interval"
                );
            }
            state.health.is_healthy = healthy;
            if !healthy {
                unhealthy.push(id.clone());
            }
        }
        unhealthy
    }

    // ═══════════════════════════════════════════════════════════════════
    // Loop
    // ═══════════════════════════════════════════════════════════════════

    /// Cancel every pending timer and end [`run`](Self::run). In-flight
    /// cycles finish on their own.
    pub fn stop(&self) {
        self.inner.root.cancel();
    }

    /// Run the scheduling loop until [`stop`](Self::stop) is called.
    ///
    /// Every active source fires once at startup, most urgent first, then
    /// every `interval_minutes` after its previous cycle finished. With a
    /// processor, pending records are processed every
    /// `process_interval_secs`.
    pub async fn run(&self, processor: Option<Arc<Processor>>) -> Result<()> {
        let inbox = lock(&self.inner.inbox).take();
        let Some(mut inbox) = inbox else {
            bail!("scheduler loop is already running");
        };
        self.inner.looping.store(true, Ordering::SeqCst);
        let config = &self.inner.config;

        let mut queue: BinaryHeap<Reverse<(Instant, Priority, String)>> = BinaryHeap::new();
        let mut queued: HashSet<String> = HashSet::new();
        let start = Instant::now();
        for descriptor in self.get_active_sources() {
            queued.insert(descriptor.id.clone());
            queue.push(Reverse((start, descriptor.schedule.priority, descriptor.id)));
        }

        let mut tasks: JoinSet<()> = JoinSet::new();
        let mut health = tokio::time::interval(Duration::from_secs(
            config.health_check_interval_secs.max(1),
        ));
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut process_tick =
            tokio::time::interval(Duration::from_secs(config.process_interval_secs.max(1)));
        process_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let processing = Arc::new(AtomicBool::new(false));

        tracing::info!(sources = queued.len(), "scheduler started");

        loop {
            let next_due = queue.peek().map(|Reverse((at, _, _))| *at);
            let far = Instant::now() + Duration::from_secs(3600);

            tokio::select! {
                _ = self.inner.root.cancelled() => break,

                _ = tokio::time::sleep_until(next_due.unwrap_or(far)), if next_due.is_some() => {
                    let now = Instant::now();
                    while queue.peek().is_some_and(|Reverse((at, _, _))| *at <= now) {
                        let Some(Reverse((_, _, id))) = queue.pop() else { break };
                        queued.remove(&id);
                        if self.is_schedulable(&id).is_none() {
                            tracing::debug!(source_id = %id, "source no longer active, dropping timer");
                            continue;
                        }
                        let scheduler = self.clone();
                        let messages = self.inner.messages.clone();
                        tasks.spawn(async move {
                            scheduler.run_source(&id).await;
                            if let Err(e) = messages.send(LoopMessage::Finished(id)) {
                                tracing::debug!(error = %e, "scheduler loop gone, cycle not rescheduled");
                            }
                        });
                    }
                }

                Some(message) = inbox.recv() => {
                    let (id, delay_minutes) = match message {
                        LoopMessage::Finished(id) => {
                            let interval = self.is_schedulable(&id).map(|(_, m)| m).unwrap_or(0);
                            (id, interval)
                        }
                        LoopMessage::Reactivated(id) => (id, 0),
                    };
                    if let Some((priority, _)) = self.is_schedulable(&id) {
                        if queued.insert(id.clone()) {
                            let at = Instant::now() + Duration::from_secs(delay_minutes * 60);
                            queue.push(Reverse((at, priority, id)));
                        }
                    }
                }

                _ = health.tick() => {
                    let unhealthy = self.check_health(Utc::now());
                    tracing::debug!(unhealthy = unhealthy.len(), "health check");
                }

                _ = process_tick.tick(), if processor.is_some() => {
                    if let Some(processor) = &processor {
                        if !processing.swap(true, Ordering::SeqCst) {
                            let processor = processor.clone();
                            let flag = processing.clone();
                            let batch_size = config.process_batch_size;
                            tasks.spawn(async move {
                                if let Err(e) = processor.process_pending(batch_size, None, &NoProgress).await {
                                    tracing::error!(error = %format!("{:#}", e), "pending processing failed");
                                }
                                flag.store(false, Ordering::SeqCst);
                            });
                        }
                    }
                }

                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "scheduler task panicked");
                    }
                }
            }
        }

        self.inner.looping.store(false, Ordering::SeqCst);
        tracing::info!(in_flight = tasks.len(), "scheduler stopping, waiting for in-flight work");
        while tasks.join_next().await.is_some() {}
        tracing::info!("scheduler stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use anyhow::Result;
    use async_trait::async_trait;
    use casewatch_core::models::{
        AdapterKind, CasePayload, CollectedRecord, RateLimit, RecordType, Schedule,
    };
    use casewatch_core::store::memory::InMemoryStore;

    use crate::traits::Connector;

    struct FakeConnector {
        id: String,
        fail: bool,
        delay: Duration,
        calls: Arc<AtomicUsize>,
        running: Arc<AtomicUsize>,
        max_running: Arc<AtomicUsize>,
    }

    impl FakeConnector {
        fn new(id: &str, fail: bool, delay: Duration) -> Self {
            Self {
                id: id.into(),
                fail,
                delay,
                calls: Arc::new(AtomicUsize::new(0)),
                running: Arc::new(AtomicUsize::new(0)),
                max_running: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl Connector for FakeConnector {
        fn source_id(&self) -> &str {
            &self.id
        }

        fn description(&self) -> &str {
            "fake"
        }

        fn kind(&self) -> AdapterKind {
            AdapterKind::Api
        }

        async fn collect(&self) -> Result<Vec<CollectedRecord>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now_running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(now_running, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.running.fetch_sub(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("connection reset");
            }
            let payload = CasePayload {
                name: Some(format!("Person from {}", self.id)),
                ..Default::default()
            };
            Ok(vec![CollectedRecord::new(
                self.id.clone(),
                "1",
                RecordType::MissingPerson,
                payload,
                Utc::now(),
            )])
        }
    }

    fn descriptor(id: &str, interval_minutes: u64, priority: Priority) -> DataSourceDescriptor {
        DataSourceDescriptor {
            id: id.into(),
            name: id.to_uppercase(),
            kind: AdapterKind::Api,
            base_url: "https://example.org".into(),
            rate_limit: RateLimit {
                requests_per_minute: 60,
                burst: 5,
            },
            schedule: Schedule {
                interval_minutes,
                priority,
            },
            status: SourceStatus::Active,
            error_count: 0,
        }
    }

    fn scheduler(
        connectors: Vec<FakeConnector>,
        descriptors: Vec<DataSourceDescriptor>,
        store: Arc<InMemoryStore>,
    ) -> Scheduler {
        let mut registry = ConnectorRegistry::new();
        for connector in connectors {
            registry.register(Arc::new(connector));
        }
        Scheduler::new(
            SchedulerConfig::default(),
            descriptors,
            registry,
            store,
            Arc::new(NoProgress),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_six_failures_move_source_to_error() {
        let store = Arc::new(InMemoryStore::new());
        let connector = FakeConnector::new("flaky", true, Duration::ZERO);
        let calls = connector.calls.clone();
        let scheduler = scheduler(
            vec![connector],
            vec![descriptor("flaky", 30, Priority::High)],
            store.clone(),
        );

        let handle = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.run(None).await })
        };
        tokio::time::sleep(Duration::from_secs(4 * 3600)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 6);
        let (descriptor, health) = scheduler.source("flaky").unwrap();
        assert_eq!(descriptor.status, SourceStatus::Error);
        assert_eq!(descriptor.error_count, 6);
        assert_eq!(health.consecutive_errors, 6);
        assert!(scheduler.get_active_sources().is_empty());

        let snapshot = store.get_source_status("flaky").await.unwrap().unwrap();
        assert_eq!(snapshot.status, SourceStatus::Error);
        assert_eq!(store.recent_sync_history(Some("flaky"), 10).await.unwrap().len(), 6);

        scheduler.stop();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_reactivates_source() {
        let store = Arc::new(InMemoryStore::new());
        let connector = FakeConnector::new("flaky", true, Duration::ZERO);
        let scheduler = scheduler(
            vec![connector],
            vec![descriptor("flaky", 30, Priority::High)],
            store.clone(),
        );
        for _ in 0..6 {
            let result = scheduler.trigger_manual_sync("flaky").await.unwrap();
            assert!(!result.success);
        }
        assert!(scheduler.get_active_sources().is_empty());

        scheduler.reset_source("flaky").await.unwrap();
        let active = scheduler.get_active_sources();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].error_count, 0);
        let snapshot = store.get_source_status("flaky").await.unwrap().unwrap();
        assert_eq!(snapshot.status, SourceStatus::Active);

        // no run loop: nothing is left queued for a later one
        let mut inbox = lock(&scheduler.inner.inbox);
        assert!(inbox.as_mut().unwrap().try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restored_error_status_stays_excluded() {
        let store = Arc::new(InMemoryStore::new());
        let mut snapshot = SourceStatusSnapshot {
            source_id: "flaky".into(),
            name: "FLAKY".into(),
            status: SourceStatus::Error,
            error_count: 7,
            health: SourceHealthStatus::new("flaky"),
        };
        snapshot.health.consecutive_errors = 7;
        store.upsert_source_status(&snapshot).await.unwrap();

        let scheduler = scheduler(
            vec![FakeConnector::new("flaky", false, Duration::ZERO)],
            vec![descriptor("flaky", 30, Priority::High)],
            store.clone(),
        );
        scheduler.restore_status().await.unwrap();
        assert!(scheduler.get_active_sources().is_empty());
        assert_eq!(scheduler.source("flaky").unwrap().0.error_count, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycles_never_overlap() {
        let store = Arc::new(InMemoryStore::new());
        // each cycle outlasts the interval
        let connector = FakeConnector::new("slow", false, Duration::from_secs(5 * 60));
        let calls = connector.calls.clone();
        let max_running = connector.max_running.clone();
        let scheduler = scheduler(
            vec![connector],
            vec![descriptor("slow", 1, Priority::Medium)],
            store,
        );

        let handle = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.run(None).await })
        };
        let manual = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                scheduler.trigger_manual_sync("slow").await
            })
        };
        tokio::time::sleep(Duration::from_secs(60 * 60)).await;

        assert!(manual.await.unwrap().is_err());
        assert_eq!(max_running.load(Ordering::SeqCst), 1);
        // 5 minute cycles plus 1 minute gaps
        let runs = calls.load(Ordering::SeqCst);
        assert!((9..=11).contains(&runs), "unexpected cycle count {}", runs);

        scheduler.stop();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_batches_pause_between_groups() {
        let store = Arc::new(InMemoryStore::new());
        let scheduler = scheduler(
            vec![
                FakeConnector::new("a", false, Duration::ZERO),
                FakeConnector::new("b", false, Duration::ZERO),
                FakeConnector::new("c", false, Duration::ZERO),
            ],
            vec![
                descriptor("a", 60, Priority::Low),
                descriptor("b", 60, Priority::Critical),
                descriptor("c", 60, Priority::Medium),
            ],
            store.clone(),
        );

        let started = Instant::now();
        let results = scheduler.run_batch_processing(2).await;
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.success));
        assert_eq!(results[0].source_id, "b");
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert_eq!(store.record_counts().await.unwrap().pending, 3);
    }

    #[tokio::test]
    async fn test_parallel_collection_and_unknown_source() {
        let store = Arc::new(InMemoryStore::new());
        let scheduler = scheduler(
            vec![
                FakeConnector::new("a", false, Duration::ZERO),
                FakeConnector::new("b", true, Duration::ZERO),
            ],
            vec![
                descriptor("a", 60, Priority::High),
                descriptor("b", 60, Priority::High),
            ],
            store,
        );

        let results = scheduler.run_parallel_collection(None).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results.iter().filter(|r| r.success).count(), 1);

        let only_a = ["a".to_string()];
        let results = scheduler.run_parallel_collection(Some(&only_a)).await.unwrap();
        assert_eq!(results.len(), 1);

        assert!(scheduler
            .run_parallel_collection(Some(&["nope".to_string()]))
            .await
            .is_err());
        assert!(scheduler.trigger_manual_sync("nope").await.is_err());
        assert_eq!(scheduler.start_collection().await.len(), 2);
    }

    #[tokio::test]
    async fn test_health_and_response_time() {
        let store = Arc::new(InMemoryStore::new());
        let scheduler = scheduler(
            vec![FakeConnector::new("a", false, Duration::ZERO)],
            vec![descriptor("a", 30, Priority::High)],
            store,
        );

        let t0 = Utc::now();
        let result = |ms: i64| SyncResult {
            id: "x".into(),
            source_id: "a".into(),
            started_at: t0,
            finished_at: t0 + chrono::Duration::milliseconds(ms),
            records_processed: 0,
            records_added: 0,
            records_updated: 0,
            records_skipped: 0,
            errors: Vec::new(),
            success: true,
        };
        scheduler.record_result(&result(100)).await;
        scheduler.record_result(&result(200)).await;
        let (_, health) = scheduler.source("a").unwrap();
        assert!((health.average_response_ms - 120.0).abs() < 1e-9);

        let last = health.last_successful_sync.unwrap();
        assert!(scheduler.check_health(last + chrono::Duration::minutes(59)).is_empty());
        assert_eq!(
            scheduler.check_health(last + chrono::Duration::minutes(61)),
            vec!["a".to_string()]
        );
        assert!(!scheduler.source("a").unwrap().1.is_healthy);
        // advisory only
        assert_eq!(scheduler.get_active_sources().len(), 1);
    }
}
