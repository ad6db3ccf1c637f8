//! Testing utilities for stores, middleware, persistence and sagas.
//!
//! # Feature Flag
//!
//! This module is only available with the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! statecraft = { version = "0.1", features = ["testing"] }
//! ```
//!
//! # What's Here
//!
//! - [`InMemoryStorage`]: a [`Storage`] that records every successful save
//!   and can be told to fail.
//! - [`InMemorySagaStorage`]: a [`SagaStorage`] that round-trips instances
//!   through JSON, so serialization bugs surface in tests.
//! - [`ManualClock`]: a [`Clock`] that only moves when told to.
//! - [`RecordingMiddleware`]: logs the order in which it wraps the chain.
//! - [`RecordingSink`]: an [`ActionSink`] that keeps what it receives.
//! - [`RecordingLog`]: a [`LogSink`] for asserting on what was logged.
//! - [`EventLatch`]: wait for N things to happen instead of sleeping.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Notify;

use crate::cache::Clock;
use crate::core::{Action, ActionRef, StoreState};
use crate::error::StoreError;
use crate::logger::{LogLevel, LogSink, Logger};
use crate::middleware::{Middleware, Next};
use crate::persistence::Storage;
use crate::saga::SagaInstance;
use crate::saga_persistence::SagaStorage;
use crate::store::{ActionSink, Store};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

// =============================================================================
// ManualClock
// =============================================================================

/// A clock that stands still until advanced.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let delta = TimeDelta::from_std(by).unwrap_or(TimeDelta::MAX);
        let mut now = lock(&self.now);
        *now = now.checked_add_signed(delta).unwrap_or(DateTime::<Utc>::MAX_UTC);
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *lock(&self.now) = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *lock(&self.now)
    }
}

// =============================================================================
// InMemoryStorage
// =============================================================================

/// Snapshot storage held in memory.
///
/// Every successful save is appended to a history available through
/// [`InMemoryStorage::saves`]. Failed saves leave no trace.
#[derive(Debug)]
pub struct InMemoryStorage<S> {
    stored: Mutex<Option<S>>,
    saves: Mutex<Vec<S>>,
    fail_saves: AtomicBool,
    fail_loads: AtomicBool,
}

impl<S: Clone> InMemoryStorage<S> {
    pub fn new() -> Self {
        Self {
            stored: Mutex::new(None),
            saves: Mutex::new(Vec::new()),
            fail_saves: AtomicBool::new(false),
            fail_loads: AtomicBool::new(false),
        }
    }

    /// Storage that already holds `state`, as if saved by a previous run.
    pub fn with_state(state: S) -> Self {
        let storage = Self::new();
        *lock(&storage.stored) = Some(state);
        storage
    }

    /// Every successful save, oldest first.
    pub fn saves(&self) -> Vec<S> {
        lock(&self.saves).clone()
    }

    pub fn stored(&self) -> Option<S> {
        lock(&self.stored).clone()
    }

    pub fn fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    pub fn fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::SeqCst);
    }
}

impl<S: Clone> Default for InMemoryStorage<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<S: Clone + Send + Sync + 'static> Storage<S> for InMemoryStorage<S> {
    async fn save(&self, state: &S) -> anyhow::Result<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(anyhow!("storage unavailable"));
        }
        *lock(&self.stored) = Some(state.clone());
        lock(&self.saves).push(state.clone());
        Ok(())
    }

    async fn load(&self) -> anyhow::Result<Option<S>> {
        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(anyhow!("storage unreadable"));
        }
        Ok(self.stored())
    }

    async fn clear(&self) -> anyhow::Result<()> {
        *lock(&self.stored) = None;
        Ok(())
    }

    async fn exists(&self) -> anyhow::Result<bool> {
        Ok(lock(&self.stored).is_some())
    }
}

// =============================================================================
// InMemorySagaStorage
// =============================================================================

/// Saga instance storage holding JSON documents in memory.
#[derive(Debug)]
pub struct InMemorySagaStorage<T> {
    documents: Mutex<HashMap<String, String>>,
    save_count: AtomicUsize,
    fail: AtomicBool,
    _state: std::marker::PhantomData<fn() -> T>,
}

impl<T: Serialize + DeserializeOwned> InMemorySagaStorage<T> {
    pub fn new() -> Self {
        Self {
            documents: Mutex::new(HashMap::new()),
            save_count: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
            _state: std::marker::PhantomData,
        }
    }

    /// Decode the stored instance `id`, if any.
    pub fn get(&self, id: &str) -> Option<SagaInstance<T>> {
        let documents = lock(&self.documents);
        let json = documents.get(id)?;
        serde_json::from_str(json).ok()
    }

    pub fn len(&self) -> usize {
        lock(&self.documents).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Successful saves so far.
    pub fn save_count(&self) -> usize {
        self.save_count.load(Ordering::SeqCst)
    }

    /// Make every operation fail until reset.
    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    fn check(&self) -> anyhow::Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            Err(anyhow!("saga storage unavailable"))
        } else {
            Ok(())
        }
    }
}

impl<T: Serialize + DeserializeOwned> Default for InMemorySagaStorage<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T> SagaStorage<T> for InMemorySagaStorage<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn save(&self, id: &str, instance: &SagaInstance<T>) -> anyhow::Result<()> {
        self.check()?;
        let json = serde_json::to_string(instance)?;
        lock(&self.documents).insert(id.to_string(), json);
        self.save_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn load(&self, id: &str) -> anyhow::Result<Option<SagaInstance<T>>> {
        self.check()?;
        let json = lock(&self.documents).get(id).cloned();
        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn remove(&self, id: &str) -> anyhow::Result<()> {
        self.check()?;
        lock(&self.documents).remove(id);
        Ok(())
    }

    async fn list_all_ids(&self) -> anyhow::Result<HashSet<String>> {
        self.check()?;
        Ok(lock(&self.documents).keys().cloned().collect())
    }
}

// =============================================================================
// RecordingMiddleware
// =============================================================================

enum Recording {
    /// `"{label}-before"` / `"{label}-after"` around `next`.
    Around(String),
    /// The type name of each action seen.
    Types,
}

/// Middleware that writes what it sees into a shared log.
pub struct RecordingMiddleware {
    recording: Recording,
    log: Arc<Mutex<Vec<String>>>,
}

impl RecordingMiddleware {
    /// Record `"{label}-before"` and `"{label}-after"` around the chain.
    pub fn new(label: impl Into<String>, log: Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            recording: Recording::Around(label.into()),
            log,
        }
    }

    /// Record the type name of every action.
    pub fn types(log: Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            recording: Recording::Types,
            log,
        }
    }
}

#[async_trait]
impl<S: StoreState> Middleware<S> for RecordingMiddleware {
    async fn handle(
        &self,
        _store: &Store<S>,
        action: ActionRef,
        next: Next<'_, S>,
    ) -> Result<ActionRef, StoreError> {
        match &self.recording {
            Recording::Around(label) => {
                lock(&self.log).push(format!("{label}-before"));
                let result = next.run(action).await;
                lock(&self.log).push(format!("{label}-after"));
                result
            }
            Recording::Types => {
                lock(&self.log).push(action.type_name().to_string());
                next.run(action).await
            }
        }
    }

    fn name(&self) -> &'static str {
        "RecordingMiddleware"
    }
}

// =============================================================================
// RecordingSink
// =============================================================================

/// An [`ActionSink`] that keeps every action dispatched into it.
#[derive(Debug, Default)]
pub struct RecordingSink {
    received: Mutex<Vec<ActionRef>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn received(&self) -> Vec<ActionRef> {
        lock(&self.received).clone()
    }

    pub fn contains<A: Action>(&self) -> bool {
        lock(&self.received).iter().any(|a| a.is::<A>())
    }

    /// Every received `A`, in arrival order.
    pub fn find<A: Action + Clone>(&self) -> Vec<A> {
        lock(&self.received)
            .iter()
            .filter_map(|a| a.downcast_ref::<A>().cloned())
            .collect()
    }
}

#[async_trait]
impl ActionSink for RecordingSink {
    fn dispatch_ref(&self, action: ActionRef) {
        lock(&self.received).push(action);
    }

    async fn dispatch_in_order(&self, action: ActionRef) -> Result<ActionRef, StoreError> {
        lock(&self.received).push(action.clone());
        Ok(action)
    }
}

// =============================================================================
// RecordingLog
// =============================================================================

/// A [`LogSink`] that keeps every message at or above `min`.
#[derive(Debug)]
pub struct RecordingLog {
    min: LogLevel,
    lines: Mutex<Vec<(LogLevel, String)>>,
}

impl RecordingLog {
    pub fn new(min: LogLevel) -> Arc<Self> {
        Arc::new(Self {
            min,
            lines: Mutex::new(Vec::new()),
        })
    }

    /// A [`Logger`] named `component` that writes here.
    pub fn logger(self: &Arc<Self>, component: &str) -> Logger {
        Logger::new(component.to_string(), self.clone())
    }

    /// Messages logged at exactly `level`.
    pub fn at(&self, level: LogLevel) -> Vec<String> {
        lock(&self.lines)
            .iter()
            .filter(|(l, _)| *l == level)
            .map(|(_, message)| message.clone())
            .collect()
    }
}

impl LogSink for RecordingLog {
    fn enabled(&self, level: LogLevel) -> bool {
        level >= self.min
    }

    fn emit(&self, _component: &str, level: LogLevel, message: &str) {
        lock(&self.lines).push((level, message.to_string()));
    }
}

// =============================================================================
// EventLatch
// =============================================================================

/// Counts down to zero and wakes every waiter.
///
/// Count from code that runs after a snapshot is committed, such as a
/// subscriber or a lifecycle listener. A reducer runs before the commit, so
/// a latch counted there can open while the last snapshot is still pending.
///
/// ```ignore
/// let latch = shared_latch(1);
/// let mut rx = store.subscribe();
/// tokio::spawn({
///     let latch = latch.clone();
///     async move {
///         rx.changed().await.ok();
///         latch.dec();
///     }
/// });
///
/// store.dispatch(Tick);
/// timeout(Duration::from_secs(5), latch.await_zero()).await.expect("no commit");
/// ```
#[derive(Debug)]
pub struct EventLatch {
    remaining: AtomicUsize,
    opened: Notify,
}

impl EventLatch {
    pub fn new(expected: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(expected),
            opened: Notify::new(),
        }
    }

    /// Count one occurrence.
    ///
    /// # Panics
    ///
    /// When the latch is already open.
    pub fn dec(&self) {
        match self.remaining.fetch_sub(1, Ordering::AcqRel) {
            0 => panic!("EventLatch counted below zero: more occurrences than expected"),
            1 => self.opened.notify_waiters(),
            _ => {}
        }
    }

    /// Resolves once the count is zero.
    pub async fn await_zero(&self) {
        loop {
            let opened = self.opened.notified();
            if self.is_complete() {
                return;
            }
            opened.await;
        }
    }

    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    pub fn is_complete(&self) -> bool {
        self.remaining() == 0
    }
}

pub type SharedEventLatch = Arc<EventLatch>;

pub fn shared_latch(expected: usize) -> SharedEventLatch {
    Arc::new(EventLatch::new(expected))
}
