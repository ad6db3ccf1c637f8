//! The store: single-writer state container.
//!
//! ```text
//! dispatch(action)
//!     │
//!     ▼
//! [persistence] → [m1] → [m2] → … → terminal (reducer under lock)
//!                                        │
//!                                        ▼
//!                               watch channel (distinct values)
//!                                        │
//!                       ┌────────────────┴───────────────┐
//!                       ▼                                ▼
//!               persistence observer               subscribers
//! ```
//!
//! # Usage
//!
//! ```ignore
//! let store = Store::builder(Todos::default())
//!     .reducer(todos_reducer)
//!     .with_middleware(IsolationMiddleware::new())
//!     .with_middleware(saga_middleware)
//!     .with_persistence(storage, PersistenceStrategy::Debounced(Duration::from_millis(500)))
//!     .build()
//!     .await;
//!
//! // Fire and forget
//! store.dispatch(AddTodo { title: "milk".into() });
//!
//! // Or run the chain on this task and get its result
//! let result = store.dispatch_and_wait(AddTodo { title: "eggs".into() }).await?;
//! ```
//!
//! # Guarantees
//!
//! - Reducer applications never overlap; each sees the previous commit.
//! - Subscribers only observe values that differ from the current snapshot.
//! - Across concurrent dispatchers the commit order is lock-acquisition
//!   order, not call order.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::{watch, Mutex};

use crate::core::{ActionRef, Reducer, RestoreState, StoreState};
use crate::error::{panic_message, PersistenceError, StoreError};
use crate::lifecycle::{Lifecycle, LifecycleEvent, LifecycleListener};
use crate::logger::Logger;
use crate::middleware::{Middleware, Next};
use crate::persistence::{PersistenceStrategy, Storage};
use crate::scheduler::{PersistenceErrorHandler, PersistenceMiddleware, PersistenceScheduler};

/// Anything that accepts dispatched actions.
///
/// Sagas and async flows hold an `Arc<dyn ActionSink>` rather than a typed
/// store so they stay independent of the state type.
#[async_trait]
pub trait ActionSink: Send + Sync + 'static {
    /// Schedule `action` without waiting for it.
    fn dispatch_ref(&self, action: ActionRef);

    /// Process `action` and return once it has gone through the chain.
    ///
    /// Awaiting this between actions applies them in call order.
    async fn dispatch_in_order(&self, action: ActionRef) -> Result<ActionRef, StoreError>;
}

struct StoreInner<S: StoreState> {
    state: watch::Sender<Arc<S>>,
    write_lock: Mutex<()>,
    reducer: Option<Box<dyn Reducer<S>>>,
    middleware: Vec<Arc<dyn Middleware<S>>>,
    lifecycle: Lifecycle,
    persistence: Option<PersistenceScheduler<S>>,
    logger: Logger,
    destroyed: AtomicBool,
}

/// Handle to a store. Cloning shares the same store.
pub struct Store<S: StoreState> {
    inner: Arc<StoreInner<S>>,
}

impl<S: StoreState> Clone for Store<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: StoreState> fmt::Debug for Store<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("middleware", &self.inner.middleware.len())
            .field("persistent", &self.inner.persistence.is_some())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

impl<S: StoreState> Store<S> {
    /// Start building a store around `initial`.
    pub fn builder(initial: S) -> StoreBuilder<S> {
        StoreBuilder::new(initial)
    }

    /// Current snapshot.
    pub fn state(&self) -> Arc<S> {
        self.inner.state.borrow().clone()
    }

    /// Stream of snapshots.
    ///
    /// The receiver starts with the current value marked as seen.
    pub fn subscribe(&self) -> watch::Receiver<Arc<S>> {
        self.inner.state.subscribe()
    }

    /// Schedule `action` for processing and return immediately.
    ///
    /// Errors only reach the store's logger; see [`Store::dispatch_ref`].
    pub fn dispatch(&self, action: impl Into<ActionRef>) {
        self.dispatch_ref(action.into());
    }

    /// Schedule an already type-erased action.
    ///
    /// Nothing is returned to the caller. Contained failures are logged at
    /// warn; fatal ones such as [`StoreError::CacheRecursion`] at error.
    /// Use [`Store::dispatch_and_wait`] to receive them as values.
    pub fn dispatch_ref(&self, action: ActionRef) {
        if self.is_destroyed() {
            self.inner.logger.warn(
                "dropping {action}: store destroyed",
                &[&action.type_name()],
            );
            return;
        }

        let store = self.clone();
        tokio::spawn(async move {
            let type_name = action.type_name();
            if let Err(e) = store.process(action).await {
                if e.is_fatal() {
                    store
                        .inner
                        .logger
                        .error("fatal error processing {action}: {error}", &[&type_name, &e]);
                } else {
                    store
                        .inner
                        .logger
                        .warn("processing {action} failed: {error}", &[&type_name, &e]);
                }
            }
        });
    }

    /// Run `action` through the chain on the caller's task.
    ///
    /// Returns whatever the outermost middleware returned. This is where a
    /// fatal usage error such as [`StoreError::CacheRecursion`] surfaces.
    pub async fn dispatch_and_wait(
        &self,
        action: impl Into<ActionRef>,
    ) -> Result<ActionRef, StoreError> {
        if self.is_destroyed() {
            return Err(StoreError::Destroyed);
        }
        self.process(action.into()).await
    }

    async fn process(&self, action: ActionRef) -> Result<ActionRef, StoreError> {
        let next = Next::new(self, &self.inner.middleware);
        match AssertUnwindSafe(next.run(action)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(StoreError::Panicked {
                message: panic_message(panic.as_ref()),
            }),
        }
    }

    /// Terminal step: commit the next snapshot under the write lock.
    pub(crate) async fn apply(&self, action: ActionRef) -> Result<ActionRef, StoreError> {
        let _guard = self.inner.write_lock.lock().await;

        let current = self.inner.state.borrow().clone();
        let next = if let Some(restore) = action.downcast_ref::<RestoreState<S>>() {
            restore.state().clone()
        } else if let Some(reducer) = &self.inner.reducer {
            Arc::new(reducer.reduce(&current, &action))
        } else {
            current
        };

        self.inner.state.send_if_modified(|slot| {
            if **slot == *next {
                false
            } else {
                *slot = next;
                true
            }
        });

        Ok(action)
    }

    /// Persistence scheduler, if one was configured.
    pub fn persistence(&self) -> Option<&PersistenceScheduler<S>> {
        self.inner.persistence.as_ref()
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::Acquire)
    }

    /// Tear the store down.
    ///
    /// Pending persistence timers and the state observer are cancelled
    /// without a final save. Later dispatches are rejected. Idempotent.
    pub async fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(scheduler) = &self.inner.persistence {
            scheduler.shutdown();
        }
        for middleware in &self.inner.middleware {
            middleware.shutdown();
        }

        drop(self.inner.write_lock.lock().await);

        self.inner.logger.debug("store destroyed", &[]);
        self.inner.lifecycle.notify(LifecycleEvent::StoreDestroyed);
    }
}

#[async_trait]
impl<S: StoreState> ActionSink for Store<S> {
    fn dispatch_ref(&self, action: ActionRef) {
        Store::dispatch_ref(self, action);
    }

    async fn dispatch_in_order(&self, action: ActionRef) -> Result<ActionRef, StoreError> {
        self.dispatch_and_wait(action).await
    }
}

/// Builder for [`Store`].
pub struct StoreBuilder<S: StoreState> {
    initial: S,
    reducer: Option<Box<dyn Reducer<S>>>,
    middleware: Vec<Arc<dyn Middleware<S>>>,
    persistence: Option<(Arc<dyn Storage<S>>, PersistenceStrategy<S>)>,
    error_handler: Option<PersistenceErrorHandler>,
    listeners: Vec<Arc<dyn LifecycleListener>>,
    logger: Logger,
}

impl<S: StoreState> StoreBuilder<S> {
    pub fn new(initial: S) -> Self {
        Self {
            initial,
            reducer: None,
            middleware: Vec::new(),
            persistence: None,
            error_handler: None,
            listeners: Vec::new(),
            logger: Logger::tracing("statecraft::store"),
        }
    }

    /// Set the reducer. Without one, only [`RestoreState`] changes state.
    pub fn reducer<R: Reducer<S>>(mut self, reducer: R) -> Self {
        self.reducer = Some(Box::new(reducer));
        self
    }

    /// Append a middleware. The first one added is the outermost.
    pub fn with_middleware<M: Middleware<S>>(mut self, middleware: M) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    /// Append an already shared middleware.
    pub fn with_middleware_arc(mut self, middleware: Arc<dyn Middleware<S>>) -> Self {
        self.middleware.push(middleware);
        self
    }

    /// Restore from and save to `storage` according to `strategy`.
    pub fn with_persistence(
        mut self,
        storage: Arc<dyn Storage<S>>,
        strategy: PersistenceStrategy<S>,
    ) -> Self {
        self.persistence = Some((storage, strategy));
        self
    }

    /// Receive storage failures. The default handler logs them.
    pub fn with_persistence_error_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&PersistenceError) + Send + Sync + 'static,
    {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    pub fn with_lifecycle_listener<L: LifecycleListener>(mut self, listener: L) -> Self {
        self.listeners.push(Arc::new(listener));
        self
    }

    /// Root logger; components derive named children from it.
    pub fn with_logger(mut self, logger: Logger) -> Self {
        self.logger = logger;
        self
    }

    /// Build the store.
    ///
    /// Fires `StoreCreated`, then (with persistence configured) restores the
    /// stored snapshot and only afterwards starts observing state changes.
    pub async fn build(self) -> Store<S> {
        let logger = self.logger;
        let lifecycle = Lifecycle::new(self.listeners, logger.named("statecraft::lifecycle"));

        let scheduler = self.persistence.map(|(storage, strategy)| {
            let persistence_logger = logger.named("statecraft::persistence");
            let handler = self
                .error_handler
                .unwrap_or_else(|| default_error_handler(persistence_logger.clone()));
            PersistenceScheduler::new(
                storage,
                strategy,
                handler,
                lifecycle.clone(),
                persistence_logger,
            )
        });

        let mut middleware = self.middleware;
        if let Some(scheduler) = &scheduler {
            middleware.insert(0, Arc::new(PersistenceMiddleware::new(scheduler.clone())));
        }

        let (state, _) = watch::channel(Arc::new(self.initial));
        let store = Store {
            inner: Arc::new(StoreInner {
                state,
                write_lock: Mutex::new(()),
                reducer: self.reducer,
                middleware,
                lifecycle,
                persistence: scheduler,
                logger,
                destroyed: AtomicBool::new(false),
            }),
        };

        store.inner.lifecycle.notify(LifecycleEvent::StoreCreated);

        if let Some(scheduler) = &store.inner.persistence {
            scheduler.restore(&store).await;
            scheduler.attach(store.subscribe());
        }

        store
    }
}

fn default_error_handler(logger: Logger) -> PersistenceErrorHandler {
    Arc::new(move |error: &PersistenceError| {
        logger.error("persistence failure: {error}", &[error]);
    })
}
