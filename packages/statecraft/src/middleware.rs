//! Middleware chain.
//!
//! A store's middleware list `[m1, m2, .., mn]` wraps the terminal reducer
//! step as `m1(m2(..mn(terminal)))`. Each middleware receives the rest of
//! the chain as a [`Next`] continuation and may:
//!
//! - inspect or replace the action before passing it on
//! - short-circuit by never calling `next`
//! - call `next` more than once
//! - return a different action than it received
//!
//! The returned action only goes back to the immediate caller. It is never
//! re-injected into the chain.
//!
//! # Example
//!
//! ```ignore
//! struct Timing;
//!
//! #[async_trait]
//! impl<S: StoreState> Middleware<S> for Timing {
//!     async fn handle(
//!         &self,
//!         _store: &Store<S>,
//!         action: ActionRef,
//!         next: Next<'_, S>,
//!     ) -> Result<ActionRef, StoreError> {
//!         let started = Instant::now();
//!         let result = next.run(action).await;
//!         tracing::debug!(elapsed = ?started.elapsed(), "action processed");
//!         result
//!     }
//! }
//! ```

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;

use crate::core::{ActionRef, StoreState};
use crate::error::{panic_message, StoreError};
use crate::logger::Logger;
use crate::store::Store;

/// Interceptor around action processing.
#[async_trait]
pub trait Middleware<S: StoreState>: Send + Sync + 'static {
    /// Process `action`, usually by awaiting `next.run(action)`.
    async fn handle(
        &self,
        store: &Store<S>,
        action: ActionRef,
        next: Next<'_, S>,
    ) -> Result<ActionRef, StoreError>;

    /// Name used in logs and errors.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Called once when the owning store is destroyed.
    fn shutdown(&self) {}
}

/// The remainder of the middleware chain.
///
/// `Next` is `Copy`: calling [`Next::run`] consumes a copy, so a middleware
/// can invoke the remaining chain any number of times.
pub struct Next<'a, S: StoreState> {
    store: &'a Store<S>,
    chain: &'a [Arc<dyn Middleware<S>>],
}

impl<S: StoreState> Clone for Next<'_, S> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<S: StoreState> Copy for Next<'_, S> {}

impl<'a, S: StoreState> Next<'a, S> {
    pub(crate) fn new(store: &'a Store<S>, chain: &'a [Arc<dyn Middleware<S>>]) -> Self {
        Self { store, chain }
    }

    /// Run `action` through the rest of the chain and the terminal step.
    pub fn run(self, action: ActionRef) -> BoxFuture<'a, Result<ActionRef, StoreError>> {
        match self.chain.split_first() {
            Some((head, rest)) => head.handle(self.store, action, Next::new(self.store, rest)),
            None => Box::pin(self.store.apply(action)),
        }
    }

    /// Number of middleware still ahead of the terminal step.
    pub fn remaining(&self) -> usize {
        self.chain.len()
    }
}

/// Contains failures of the rest of the chain.
///
/// Errors and panics raised downstream are logged and processing for that
/// dispatch ends; the original action is returned. Fatal usage errors
/// ([`StoreError::is_fatal`]) are re-raised.
pub struct IsolationMiddleware {
    logger: Logger,
}

impl IsolationMiddleware {
    pub fn new() -> Self {
        Self::with_logger(Logger::tracing("statecraft::isolation"))
    }

    pub fn with_logger(logger: Logger) -> Self {
        Self { logger }
    }
}

impl Default for IsolationMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<S: StoreState> Middleware<S> for IsolationMiddleware {
    async fn handle(
        &self,
        _store: &Store<S>,
        action: ActionRef,
        next: Next<'_, S>,
    ) -> Result<ActionRef, StoreError> {
        let outcome = AssertUnwindSafe(next.run(action.clone()))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) if e.is_fatal() => Err(e),
            Ok(Err(e)) => {
                self.logger.error(
                    "processing {action} failed: {error}",
                    &[&action.type_name(), &e],
                );
                Ok(action)
            }
            Err(panic) => {
                self.logger.error(
                    "processing {action} panicked: {panic}",
                    &[&action.type_name(), &panic_message(panic.as_ref())],
                );
                Ok(action)
            }
        }
    }

    fn name(&self) -> &'static str {
        "IsolationMiddleware"
    }
}
