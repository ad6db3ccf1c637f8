//! Structured error types for statecraft.
//!
//! `StoreError` is what the dispatch pipeline returns, `PersistenceError` is
//! what storage failures are reported as, and `SagaError` covers saga
//! registration and saga storage.
//!
//! # The Containment Rule
//!
//! > **Only cache misuse escapes as a hard failure.**
//!
//! - Middleware failures are contained by [`IsolationMiddleware`](crate::IsolationMiddleware)
//! - Persistence failures go to the configured error handler
//! - Async failures become [`AsyncFailed`](crate::AsyncFailed) actions
//! - Lifecycle listener failures are logged per listener
//!
//! [`StoreError::is_fatal`] identifies the one class that must never be
//! swallowed.
//!
//! # Example
//!
//! ```ignore
//! match store.dispatch_and_wait(FetchUser { id: 7 }).await {
//!     Ok(result) => tracing::debug!(?result, "dispatched"),
//!     Err(StoreError::CacheRecursion { action, result }) => {
//!         panic!("{action} produced cacheable {result}");
//!     }
//!     Err(e) => tracing::warn!(error = %e, "dispatch failed"),
//! }
//! ```

use thiserror::Error;

/// Errors produced by the dispatch pipeline.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A cacheable action produced another cacheable action.
    ///
    /// Caching the result would recurse without bound, so this is a usage
    /// error and is never contained.
    #[error("cacheable action {action} produced cacheable result {result}")]
    CacheRecursion {
        action: &'static str,
        result: &'static str,
    },

    /// A middleware reported a failure.
    #[error("middleware {middleware} failed: {cause:#}")]
    Middleware {
        middleware: &'static str,
        cause: anyhow::Error,
    },

    /// Part of the chain panicked.
    #[error("dispatch panicked: {message}")]
    Panicked { message: String },

    /// The store has been destroyed.
    #[error("store has been destroyed")]
    Destroyed,
}

impl StoreError {
    /// Wrap a collaborator failure raised inside a middleware.
    pub fn middleware(middleware: &'static str, cause: impl Into<anyhow::Error>) -> Self {
        Self::Middleware {
            middleware,
            cause: cause.into(),
        }
    }

    /// Whether this error must propagate past isolation.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::CacheRecursion { .. })
    }
}

/// A storage collaborator operation failed.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("failed to save state: {0:#}")]
    Save(anyhow::Error),

    #[error("failed to load state: {0:#}")]
    Load(anyhow::Error),

    #[error("failed to clear state: {0:#}")]
    Clear(anyhow::Error),

    #[error("failed to check for stored state: {0:#}")]
    Exists(anyhow::Error),
}

/// Errors from saga registration and saga storage.
#[derive(Debug, Error)]
pub enum SagaError {
    #[error("no saga registered under {name}")]
    UnknownSaga { name: String },

    #[error("saga {name} is already registered")]
    DuplicateSaga { name: String },

    #[error("saga storage for {saga} failed: {cause:#}")]
    Storage { saga: String, cause: anyhow::Error },
}

/// Extract a readable message from a panic payload.
pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
