//! Persistence scheduler.
//!
//! Drives restoration at startup and then decides, per
//! [`PersistenceStrategy`], when the [`Storage`] collaborator saves.
//!
//! ```text
//! build()
//!   ├─ RestorationStarted
//!   ├─ storage.load() ──► RestoreState dispatched, baseline = loaded
//!   ├─ RestorationCompleted(restored)
//!   └─ observer attached ──► change ─► decide ─► save now / later / never
//!
//! dispatch(action)
//!   └─ PersistenceMiddleware ─► arm on first real action
//!                            └─ OnAction match ─► save current state
//! ```
//!
//! The baseline is the last state known to be stored. It only moves on a
//! successful save, so a failed save is retried by the next qualifying
//! change.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::core::{ActionRef, RestoreState, StoreState};
use crate::error::{PersistenceError, StoreError};
use crate::lifecycle::{Lifecycle, LifecycleEvent};
use crate::logger::Logger;
use crate::middleware::{Middleware, Next};
use crate::persistence::{PersistenceStrategy, Storage};
use crate::store::Store;

/// Receives storage failures.
pub type PersistenceErrorHandler = Arc<dyn Fn(&PersistenceError) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SaveDecision {
    Skip,
    Now,
    /// Save now and start a new throttle window.
    Throttled,
    After(Duration),
}

struct Shared<S: StoreState> {
    storage: Arc<dyn Storage<S>>,
    strategy: PersistenceStrategy<S>,
    on_error: PersistenceErrorHandler,
    lifecycle: Lifecycle,
    logger: Logger,
    restored: AtomicBool,
    initialized: AtomicBool,
    shut_down: AtomicBool,
    baseline: Mutex<Option<Arc<S>>>,
    last_throttled_save: Mutex<Option<Instant>>,
    generation: AtomicU64,
    pending: Mutex<Option<(u64, JoinHandle<()>)>>,
    observer: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Restores and saves one store's state.
///
/// Created by [`StoreBuilder::with_persistence`](crate::StoreBuilder::with_persistence);
/// reachable afterwards through [`Store::persistence`].
pub struct PersistenceScheduler<S: StoreState> {
    shared: Arc<Shared<S>>,
}

impl<S: StoreState> Clone for PersistenceScheduler<S> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<S: StoreState> PersistenceScheduler<S> {
    pub(crate) fn new(
        storage: Arc<dyn Storage<S>>,
        strategy: PersistenceStrategy<S>,
        on_error: PersistenceErrorHandler,
        lifecycle: Lifecycle,
        logger: Logger,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                storage,
                strategy,
                on_error,
                lifecycle,
                logger,
                restored: AtomicBool::new(false),
                initialized: AtomicBool::new(false),
                shut_down: AtomicBool::new(false),
                baseline: Mutex::new(None),
                last_throttled_save: Mutex::new(None),
                generation: AtomicU64::new(0),
                pending: Mutex::new(None),
                observer: Mutex::new(None),
            }),
        }
    }

    pub fn strategy(&self) -> &PersistenceStrategy<S> {
        &self.shared.strategy
    }

    /// Restoration has finished (whether or not anything was loaded).
    pub fn is_restored(&self) -> bool {
        self.shared.restored.load(Ordering::Acquire)
    }

    /// A real action has been processed since restoration.
    pub fn is_initialized(&self) -> bool {
        self.shared.initialized.load(Ordering::Acquire)
    }

    /// Last state known to be stored.
    pub fn baseline(&self) -> Option<Arc<S>> {
        lock(&self.shared.baseline).clone()
    }

    /// Load the stored snapshot and apply it to `store`.
    pub(crate) async fn restore(&self, store: &Store<S>) {
        let shared = &self.shared;
        shared.lifecycle.notify(LifecycleEvent::RestorationStarted);

        let restored = match shared.storage.load().await {
            Ok(Some(state)) => {
                let state = Arc::new(state);
                match store
                    .dispatch_and_wait(RestoreState::new(state.clone()))
                    .await
                {
                    Ok(_) => {
                        *lock(&shared.baseline) = Some(state);
                        true
                    }
                    Err(e) => {
                        shared
                            .logger
                            .error("applying restored state failed: {error}", &[&e]);
                        *lock(&shared.baseline) = Some(store.state());
                        false
                    }
                }
            }
            Ok(None) => {
                shared.logger.debug("no stored state, starting fresh", &[]);
                *lock(&shared.baseline) = Some(store.state());
                false
            }
            Err(e) => {
                (shared.on_error)(&PersistenceError::Load(e));
                *lock(&shared.baseline) = Some(store.state());
                false
            }
        };

        shared.restored.store(true, Ordering::Release);
        shared
            .lifecycle
            .notify(LifecycleEvent::RestorationCompleted { restored });
    }

    /// Start observing state changes. Called after [`Self::restore`].
    pub(crate) fn attach(&self, mut rx: watch::Receiver<Arc<S>>) {
        if !self.shared.strategy.observes_changes() || self.shared.shut_down.load(Ordering::Acquire)
        {
            return;
        }

        // Whatever restoration produced is not a change.
        rx.borrow_and_update();

        let shared = self.shared.clone();
        let handle = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let current = rx.borrow_and_update().clone();
                shared.on_change(current).await;
            }
        });
        *lock(&self.shared.observer) = Some(handle);
    }

    /// Arm the scheduler once restoration is done.
    pub(crate) fn mark_initialized(&self) {
        if self.is_restored() && !self.shared.initialized.swap(true, Ordering::AcqRel) {
            self.shared.logger.trace("armed after first action", &[]);
        }
    }

    /// Save `state` immediately, regardless of strategy.
    pub async fn save_now(&self, state: Arc<S>) {
        self.shared.save(state, false).await;
    }

    /// Remove the stored snapshot.
    pub async fn clear(&self) {
        match self.shared.storage.clear().await {
            Ok(()) => {
                *lock(&self.shared.baseline) = None;
                self.shared.logger.debug("stored state cleared", &[]);
            }
            Err(e) => (self.shared.on_error)(&PersistenceError::Clear(e)),
        }
    }

    /// Whether a snapshot is stored. Failures are reported and read as `false`.
    pub async fn has_stored_state(&self) -> bool {
        match self.shared.storage.exists().await {
            Ok(exists) => exists,
            Err(e) => {
                (self.shared.on_error)(&PersistenceError::Exists(e));
                false
            }
        }
    }

    /// Cancel the pending timer and the observer. Does not save.
    pub(crate) fn shutdown(&self) {
        self.shared.shut_down.store(true, Ordering::Release);
        if let Some((_, pending)) = lock(&self.shared.pending).take() {
            pending.abort();
        }
        if let Some(observer) = lock(&self.shared.observer).take() {
            observer.abort();
        }
    }
}

impl<S: StoreState> Shared<S> {
    async fn on_change(self: &Arc<Self>, current: Arc<S>) {
        if !self.initialized.load(Ordering::Acquire) {
            self.logger.trace("change before first action ignored", &[]);
            return;
        }

        let previous = lock(&self.baseline).clone();
        if previous.as_deref() == Some(&*current) {
            // Back to what is stored; anything pending is now stale.
            self.cancel_pending();
            return;
        }

        match self.decide(&self.strategy, &current, previous.as_deref()) {
            SaveDecision::Skip => {}
            SaveDecision::Now => self.save(current, false).await,
            SaveDecision::Throttled => self.save(current, true).await,
            SaveDecision::After(delay) => self.schedule(current, delay),
        }
    }

    fn decide(&self, strategy: &PersistenceStrategy<S>, current: &S, previous: Option<&S>) -> SaveDecision {
        match strategy {
            PersistenceStrategy::OnEveryChange => SaveDecision::Now,
            PersistenceStrategy::Debounced(delay) => SaveDecision::After(*delay),
            PersistenceStrategy::Throttled(interval) => match *lock(&self.last_throttled_save) {
                Some(last) if last.elapsed() < *interval => SaveDecision::Skip,
                _ => SaveDecision::Throttled,
            },
            PersistenceStrategy::OnAction(_) => SaveDecision::Skip,
            PersistenceStrategy::Conditional(predicate) => match previous {
                Some(previous) if predicate(current, previous) => SaveDecision::Now,
                _ => SaveDecision::Skip,
            },
            PersistenceStrategy::Combined(members) => {
                for member in members {
                    let decision = self.decide(member, current, previous);
                    if decision != SaveDecision::Skip {
                        return decision;
                    }
                }
                SaveDecision::Skip
            }
        }
    }

    fn schedule(self: &Arc<Self>, state: Arc<S>, delay: Duration) {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let shared = self.clone();

        let mut pending = lock(&self.pending);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            // Detach from `pending` so a later schedule cannot abort the save.
            {
                let mut pending = lock(&shared.pending);
                let is_latest =
                    matches!(pending.as_ref(), Some((scheduled, _)) if *scheduled == generation);
                if !is_latest {
                    return;
                }
                pending.take();
            }

            if lock(&shared.baseline).as_deref() == Some(&*state) {
                return;
            }
            shared.save(state, false).await;
        });

        if let Some((_, previous)) = pending.replace((generation, handle)) {
            previous.abort();
        }
    }

    fn cancel_pending(&self) {
        if let Some((_, pending)) = lock(&self.pending).take() {
            pending.abort();
        }
    }

    async fn save(&self, state: Arc<S>, throttled: bool) {
        if self.shut_down.load(Ordering::Acquire) {
            return;
        }

        let started = Instant::now();
        match self.storage.save(&state).await {
            Ok(()) => {
                *lock(&self.baseline) = Some(state);
                if throttled {
                    *lock(&self.last_throttled_save) = Some(started);
                }
                self.logger.trace("state saved", &[]);
            }
            Err(e) => (self.on_error)(&PersistenceError::Save(e)),
        }
    }
}

/// Dispatch-side half of the scheduler.
///
/// Installed as the outermost middleware. It arms the scheduler on the
/// first real action and performs `OnAction` saves once the rest of the
/// chain has finished with a matching action.
pub(crate) struct PersistenceMiddleware<S: StoreState> {
    scheduler: PersistenceScheduler<S>,
}

impl<S: StoreState> PersistenceMiddleware<S> {
    pub(crate) fn new(scheduler: PersistenceScheduler<S>) -> Self {
        Self { scheduler }
    }
}

#[async_trait]
impl<S: StoreState> Middleware<S> for PersistenceMiddleware<S> {
    async fn handle(
        &self,
        store: &Store<S>,
        action: ActionRef,
        next: Next<'_, S>,
    ) -> Result<ActionRef, StoreError> {
        if action.is::<RestoreState<S>>() {
            return next.run(action).await;
        }

        self.scheduler.mark_initialized();
        let action_type = action.action_type();
        let result = next.run(action).await?;

        if self.scheduler.strategy().triggers_on(action_type) {
            self.scheduler.save_now(store.state()).await;
        }
        Ok(result)
    }

    fn name(&self) -> &'static str {
        "PersistenceMiddleware"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Action;
    use crate::lifecycle::LifecycleListener;
    use crate::testing::{InMemoryStorage, RecordingMiddleware};

    #[derive(Debug, Clone, PartialEq)]
    struct Add(i64);
    impl Action for Add {}

    #[derive(Debug, Clone, PartialEq)]
    struct Touch;
    impl Action for Touch {}

    fn counter(state: &i64, action: &ActionRef) -> i64 {
        match action.downcast_ref::<Add>() {
            Some(Add(n)) => state + n,
            None => *state,
        }
    }

    async fn store_with(
        storage: Arc<InMemoryStorage<i64>>,
        strategy: PersistenceStrategy<i64>,
    ) -> Store<i64> {
        Store::builder(0_i64)
            .reducer(counter)
            .with_persistence(storage, strategy)
            .build()
            .await
    }

    /// Let spawned observers and timers run.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    // ==========================================================================
    // Restoration
    // ==========================================================================

    struct Phases(Arc<Mutex<Vec<String>>>);

    impl LifecycleListener for Phases {
        fn on_store_created(&self) -> anyhow::Result<()> {
            self.0.lock().unwrap().push("created".into());
            Ok(())
        }

        fn on_restoration_started(&self) -> anyhow::Result<()> {
            self.0.lock().unwrap().push("restoring".into());
            Ok(())
        }

        fn on_restoration_completed(&self, restored: bool) -> anyhow::Result<()> {
            self.0.lock().unwrap().push(format!("restored={}", restored));
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_comes_first_and_is_not_saved() {
        let storage = Arc::new(InMemoryStorage::with_state(10_i64));
        let actions = Arc::new(Mutex::new(Vec::new()));
        let phases = Arc::new(Mutex::new(Vec::new()));

        let store = Store::builder(0_i64)
            .reducer(counter)
            .with_middleware(RecordingMiddleware::types(actions.clone()))
            .with_persistence(storage.clone(), PersistenceStrategy::OnEveryChange)
            .with_lifecycle_listener(Phases(phases.clone()))
            .build()
            .await;

        assert_eq!(*store.state(), 10);
        assert_eq!(
            *phases.lock().unwrap(),
            vec!["created", "restoring", "restored=true"]
        );
        assert_eq!(actions.lock().unwrap().len(), 1);
        assert!(actions.lock().unwrap()[0].contains("RestoreState"));

        settle().await;
        assert!(storage.saves().is_empty());
        assert!(!store.persistence().unwrap().is_initialized());

        store.dispatch_and_wait(Add(5)).await.unwrap();
        settle().await;

        assert_eq!(storage.saves(), vec![15]);
        assert_eq!(
            store.persistence().unwrap().baseline().as_deref(),
            Some(&15)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_stored_state_uses_initial_baseline() {
        let storage = Arc::new(InMemoryStorage::new());
        let phases = Arc::new(Mutex::new(Vec::new()));

        let store = Store::builder(3_i64)
            .with_persistence(storage.clone(), PersistenceStrategy::OnEveryChange)
            .with_lifecycle_listener(Phases(phases.clone()))
            .build()
            .await;

        assert_eq!(*store.state(), 3);
        assert_eq!(store.persistence().unwrap().baseline().as_deref(), Some(&3));
        assert_eq!(phases.lock().unwrap().last().unwrap(), "restored=false");
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_failure_is_reported_and_store_starts_fresh() {
        let storage = Arc::new(InMemoryStorage::with_state(99_i64));
        storage.fail_loads(true);
        let errors = Arc::new(Mutex::new(Vec::new()));

        let store = Store::builder(1_i64)
            .reducer(counter)
            .with_persistence(storage.clone(), PersistenceStrategy::OnEveryChange)
            .with_persistence_error_handler({
                let errors = errors.clone();
                move |e| errors.lock().unwrap().push(e.to_string())
            })
            .build()
            .await;

        assert_eq!(*store.state(), 1);
        assert_eq!(errors.lock().unwrap().len(), 1);
        assert!(errors.lock().unwrap()[0].contains("load"));
    }

    // ==========================================================================
    // Strategies
    // ==========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_every_change_saves_each_distinct_state() {
        let storage = Arc::new(InMemoryStorage::new());
        let store = store_with(storage.clone(), PersistenceStrategy::OnEveryChange).await;

        store.dispatch_and_wait(Add(1)).await.unwrap();
        settle().await;
        store.dispatch_and_wait(Touch).await.unwrap();
        settle().await;
        store.dispatch_and_wait(Add(2)).await.unwrap();
        settle().await;

        assert_eq!(storage.saves(), vec![1, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_collapses_burst_into_last_state() {
        let storage = Arc::new(InMemoryStorage::new());
        let store = store_with(
            storage.clone(),
            PersistenceStrategy::Debounced(Duration::from_millis(100)),
        )
        .await;

        for _ in 0..5 {
            store.dispatch_and_wait(Add(1)).await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(storage.saves().is_empty());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(storage.saves(), vec![5]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_returning_to_baseline_cancels_save() {
        let storage = Arc::new(InMemoryStorage::new());
        let store = store_with(
            storage.clone(),
            PersistenceStrategy::Debounced(Duration::from_millis(100)),
        )
        .await;

        store.dispatch_and_wait(Add(1)).await.unwrap();
        settle().await;
        store.dispatch_and_wait(Add(-1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(storage.saves().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_spacing() {
        let storage = Arc::new(InMemoryStorage::new());
        let store = store_with(
            storage.clone(),
            PersistenceStrategy::Throttled(Duration::from_millis(1000)),
        )
        .await;

        // First change saves immediately.
        store.dispatch_and_wait(Add(1)).await.unwrap();
        settle().await;
        assert_eq!(storage.saves(), vec![1]);

        // Changes inside the window are dropped, not queued.
        store.dispatch_and_wait(Add(1)).await.unwrap();
        settle().await;
        store.dispatch_and_wait(Add(1)).await.unwrap();
        settle().await;
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(storage.saves(), vec![1]);

        // The first change after the window saves the then-current state.
        store.dispatch_and_wait(Add(1)).await.unwrap();
        settle().await;
        assert_eq!(storage.saves(), vec![1, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_on_action_saves_even_without_change() {
        let storage = Arc::new(InMemoryStorage::new());
        let store = store_with(storage.clone(), PersistenceStrategy::on_action::<Touch>()).await;

        store.dispatch_and_wait(Add(2)).await.unwrap();
        settle().await;
        assert!(storage.saves().is_empty());

        store.dispatch_and_wait(Touch).await.unwrap();
        store.dispatch_and_wait(Touch).await.unwrap();
        assert_eq!(storage.saves(), vec![2, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_conditional_compares_with_baseline() {
        let storage = Arc::new(InMemoryStorage::new());
        let store = store_with(
            storage.clone(),
            PersistenceStrategy::conditional(|current: &i64, previous: &i64| current - previous >= 10),
        )
        .await;

        store.dispatch_and_wait(Add(4)).await.unwrap();
        settle().await;
        store.dispatch_and_wait(Add(4)).await.unwrap();
        settle().await;
        assert!(storage.saves().is_empty());

        store.dispatch_and_wait(Add(4)).await.unwrap();
        settle().await;
        assert_eq!(storage.saves(), vec![12]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_combined_saves_once_per_transition() {
        let storage = Arc::new(InMemoryStorage::new());
        let store = store_with(
            storage.clone(),
            PersistenceStrategy::Combined(vec![
                PersistenceStrategy::OnEveryChange,
                PersistenceStrategy::Debounced(Duration::from_millis(50)),
                PersistenceStrategy::conditional(|_: &i64, _: &i64| true),
            ]),
        )
        .await;

        store.dispatch_and_wait(Add(1)).await.unwrap();
        settle().await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(storage.saves(), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_combined_on_action_member_uses_dispatch_side() {
        let storage = Arc::new(InMemoryStorage::new());
        let store = store_with(
            storage.clone(),
            PersistenceStrategy::Combined(vec![
                PersistenceStrategy::Debounced(Duration::from_millis(500)),
                PersistenceStrategy::on_action::<Touch>(),
            ]),
        )
        .await;

        store.dispatch_and_wait(Add(1)).await.unwrap();
        store.dispatch_and_wait(Touch).await.unwrap();
        assert_eq!(storage.saves(), vec![1]);
    }

    // ==========================================================================
    // Failures and teardown
    // ==========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_failed_save_keeps_baseline_and_retries_on_next_change() {
        let storage = Arc::new(InMemoryStorage::new());
        let errors = Arc::new(Mutex::new(Vec::new()));
        let store = Store::builder(0_i64)
            .reducer(counter)
            .with_persistence(storage.clone(), PersistenceStrategy::OnEveryChange)
            .with_persistence_error_handler({
                let errors = errors.clone();
                move |e| errors.lock().unwrap().push(e.to_string())
            })
            .build()
            .await;

        storage.fail_saves(true);
        store.dispatch_and_wait(Add(1)).await.unwrap();
        settle().await;

        assert_eq!(errors.lock().unwrap().len(), 1);
        assert_eq!(store.persistence().unwrap().baseline().as_deref(), Some(&0));

        storage.fail_saves(false);
        store.dispatch_and_wait(Add(1)).await.unwrap();
        settle().await;

        assert_eq!(storage.saves(), vec![2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_cancels_pending_save() {
        let storage = Arc::new(InMemoryStorage::new());
        let store = store_with(
            storage.clone(),
            PersistenceStrategy::Debounced(Duration::from_millis(100)),
        )
        .await;

        store.dispatch_and_wait(Add(1)).await.unwrap();
        settle().await;
        store.destroy().await;
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert!(storage.saves().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_and_exists() {
        let storage = Arc::new(InMemoryStorage::with_state(5_i64));
        let store = store_with(storage.clone(), PersistenceStrategy::OnEveryChange).await;
        let scheduler = store.persistence().unwrap();

        assert!(scheduler.has_stored_state().await);
        scheduler.clear().await;
        assert!(!scheduler.has_stored_state().await);
        assert!(scheduler.baseline().is_none());
    }
}
