//! # Statecraft
//!
//! A single-writer state container where middleware intercepts, reducers
//! decide, sagas coordinate, and persistence follows policy.
//!
//! ## Core Concepts
//!
//! - [`Action`] = A fact or request, dispatched as an [`ActionRef`]
//! - [`Reducer`] = Pure `(state, action) -> state`
//! - [`Middleware`] = Async interceptor around the reducer
//!
//! The key principle: **one writer, many observers.** Actions are processed
//! concurrently through the middleware chain, but state is committed by one
//! writer at a time and published as immutable snapshots.
//!
//! ## Architecture
//!
//! ```text
//! dispatch(action)
//!     │
//!     ▼
//! PersistenceMiddleware ─► M1 ─► M2 ─► ... ─► reducer (write lock)
//!                                                  │
//!                                                  ▼
//!                                   watch::Sender<Arc<S>> (distinct only)
//!                                                  │
//!                     ┌────────────────────────────┼──────────────┐
//!                     ▼                            ▼              ▼
//!          PersistenceScheduler             subscribers     SagaMiddleware
//!          (debounce / throttle / ...)                       (after next)
//!                     │                                           │
//!                     ▼                                           ▼
//!                 Storage<S>                                 SagaEngine ─► effects
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Reducers are pure** - No IO, no async
//! 2. **One commit at a time** - The reducer never runs concurrently with itself
//! 3. **Distinct emissions** - Subscribers only see snapshots that differ
//! 4. **Restore first** - A stored snapshot is applied before the first save decision
//! 5. **Failures stay local** - Listener, storage and handler failures are logged, not thrown
//!
//! ## Example
//!
//! ```ignore
//! use statecraft::{Action, ActionRef, Store, IsolationMiddleware, PersistenceStrategy};
//!
//! #[derive(Debug)]
//! struct Increment(i64);
//! impl Action for Increment {}
//!
//! let store = Store::builder(0_i64)
//!     .reducer(|n: &i64, action: &ActionRef| match action.downcast_ref::<Increment>() {
//!         Some(Increment(by)) => n + by,
//!         None => *n,
//!     })
//!     .with_middleware(IsolationMiddleware::new())
//!     .with_persistence(storage, PersistenceStrategy::Debounced(Duration::from_millis(250)))
//!     .build()
//!     .await;
//!
//! store.dispatch(Increment(1));
//! ```
//!
//! ## What This Is Not
//!
//! - No undo/redo or time travel
//! - No cross-process synchronisation
//! - No final save at teardown

// Core modules
mod core;
mod error;
mod lifecycle;
mod logger;
mod middleware;
mod store;

// Middleware
mod async_flow;
mod cache;

// Persistence
mod persistence;
mod scheduler;

// Sagas
mod saga;
mod saga_engine;
mod saga_persistence;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;


// Re-export core types
pub use crate::core::{
    combine_reducers, Action, ActionRef, ActionType, AsAny, CombinedReducer, Reducer,
    RestoreState, StoreState,
};

// Re-export error types
pub use crate::error::{PersistenceError, SagaError, StoreError};

// Re-export logging
pub use logger::{format_template, LogLevel, LogSink, Logger, TracingSink};

// Re-export lifecycle hooks
pub use lifecycle::{LifecycleEvent, LifecycleListener};

// Re-export store and middleware chain
pub use middleware::{IsolationMiddleware, Middleware, Next};
pub use store::{ActionSink, Store, StoreBuilder};

// Re-export cache types
pub use cache::{
    ActionCache, CacheKey, CacheMiddleware, CacheableAction, CachedResult, Clock, SystemClock,
    DEFAULT_CACHE_TTL,
};

// Re-export async workflow types
pub use async_flow::{
    execute_flow, AsyncAction, AsyncCompleted, AsyncFailed, AsyncFlowFinished,
    AsyncFlowMiddleware, AsyncStarted, AsyncSucceeded,
};

// Re-export persistence types
pub use persistence::{
    ChangePredicate, PersistenceStrategy, Storage, StrategySpec, StrategySpecError,
};
pub use scheduler::{PersistenceErrorHandler, PersistenceScheduler};

// Re-export saga types
pub use saga::{SagaDefinition, SagaEffect, SagaInstance, SagaState, SagaTransition};
pub use saga_engine::{SagaEngine, SagaEngineBuilder, SagaMiddleware};
pub use saga_persistence::{SagaPersistencePolicy, SagaStorage};

// Re-export commonly used external types
pub use async_trait::async_trait;
