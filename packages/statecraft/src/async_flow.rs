//! Async workflow adapter.
//!
//! An [`AsyncAction`] knows how to compute its result asynchronously. The
//! adapter expands one such action into a short lifecycle sequence:
//!
//! ```text
//! AsyncStarted ─► AsyncSucceeded { output } ─► AsyncCompleted
//!            └──► AsyncFailed { error }   ──┘
//! ```
//!
//! Every item is sent down the rest of the chain and also dispatched into
//! the store directly, so subscribers see each step as soon as it exists.
//! Reducers therefore receive every lifecycle action twice. Once the
//! sequence is exhausted the middleware returns a single
//! [`AsyncFlowFinished`] listing everything it produced.
//!
//! A failing or panicking `execute` is data, not an error: it becomes
//! [`AsyncFailed`] and the sequence still ends with [`AsyncCompleted`].

use std::any::TypeId;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::{FutureExt, StreamExt};

use crate::core::{Action, ActionRef, ActionType, StoreState};
use crate::error::{panic_message, StoreError};
use crate::logger::Logger;
use crate::middleware::{Middleware, Next};
use crate::store::Store;

/// An action whose result is computed asynchronously.
///
/// # Example
///
/// ```ignore
/// #[derive(Debug, Clone, PartialEq, Eq, Hash)]
/// struct FetchUser { id: u32 }
/// impl Action for FetchUser {}
///
/// #[async_trait]
/// impl AsyncAction for FetchUser {
///     type Output = UserLoaded;
///
///     async fn execute(&self) -> anyhow::Result<UserLoaded> {
///         let user = api::get_user(self.id).await?;
///         Ok(UserLoaded { user })
///     }
/// }
/// ```
#[async_trait]
pub trait AsyncAction: Action {
    type Output: Action;

    async fn execute(&self) -> anyhow::Result<Self::Output>;
}

/// Execution of `source` has begun.
#[derive(Debug, Clone)]
pub struct AsyncStarted {
    pub source: ActionRef,
}
impl Action for AsyncStarted {}

/// Execution of `source` produced `output`.
#[derive(Debug, Clone)]
pub struct AsyncSucceeded {
    pub source: ActionRef,
    pub output: ActionRef,
}
impl Action for AsyncSucceeded {}

/// Execution of `source` failed or panicked.
#[derive(Debug, Clone)]
pub struct AsyncFailed {
    pub source: ActionRef,
    pub error: String,
}
impl Action for AsyncFailed {}

/// No further lifecycle actions will follow for `source`.
#[derive(Debug, Clone)]
pub struct AsyncCompleted {
    pub source: ActionRef,
}
impl Action for AsyncCompleted {}

/// Everything the adapter produced for `source`, in order.
#[derive(Debug, Clone)]
pub struct AsyncFlowFinished {
    pub source: ActionRef,
    pub actions: Vec<ActionRef>,
}
impl Action for AsyncFlowFinished {}

impl AsyncFlowFinished {
    /// The successful output, if there was one.
    pub fn output(&self) -> Option<&ActionRef> {
        self.actions
            .iter()
            .find_map(|a| a.downcast_ref::<AsyncSucceeded>().map(|s| &s.output))
    }

    /// The failure message, if there was one.
    pub fn error(&self) -> Option<&str> {
        self.actions
            .iter()
            .find_map(|a| a.downcast_ref::<AsyncFailed>().map(|f| f.error.as_str()))
    }
}

enum FlowStep {
    Start,
    Execute,
    Complete,
    Done,
}

/// Lazy lifecycle sequence for `action`.
///
/// Nothing runs until the stream is polled. Each call builds a fresh
/// sequence, so the same action can be executed again.
pub fn execute_flow<A: AsyncAction>(action: A) -> BoxStream<'static, ActionRef> {
    flow_for::<A>(ActionRef::new(action))
}

fn flow_for<A: AsyncAction>(source: ActionRef) -> BoxStream<'static, ActionRef> {
    stream::unfold(FlowStep::Start, move |step| {
        let source = source.clone();
        async move {
            match step {
                FlowStep::Start => Some((ActionRef::new(AsyncStarted { source }), FlowStep::Execute)),
                FlowStep::Execute => {
                    let outcome = run_execute::<A>(&source).await;
                    let item = match outcome {
                        Ok(output) => ActionRef::new(AsyncSucceeded { source, output }),
                        Err(error) => ActionRef::new(AsyncFailed { source, error }),
                    };
                    Some((item, FlowStep::Complete))
                }
                FlowStep::Complete => {
                    Some((ActionRef::new(AsyncCompleted { source }), FlowStep::Done))
                }
                FlowStep::Done => None,
            }
        }
    })
    .boxed()
}

async fn run_execute<A: AsyncAction>(source: &ActionRef) -> Result<ActionRef, String> {
    let Some(action) = source.downcast_ref::<A>() else {
        return Err(format!(
            "expected {} but got {}",
            std::any::type_name::<A>(),
            source.type_name()
        ));
    };

    match AssertUnwindSafe(action.execute()).catch_unwind().await {
        Ok(Ok(output)) => Ok(ActionRef::new(output)),
        Ok(Err(e)) => Err(format!("{:#}", e)),
        Err(panic) => Err(format!("panicked: {}", panic_message(panic.as_ref()))),
    }
}

type FlowFactory = fn(ActionRef) -> BoxStream<'static, ActionRef>;

/// Middleware that expands registered [`AsyncAction`]s.
pub struct AsyncFlowMiddleware {
    flows: HashMap<TypeId, FlowFactory>,
    logger: Logger,
}

impl AsyncFlowMiddleware {
    pub fn new() -> Self {
        Self {
            flows: HashMap::new(),
            logger: Logger::tracing("statecraft::async_flow"),
        }
    }

    pub fn with_logger(mut self, logger: Logger) -> Self {
        self.logger = logger;
        self
    }

    /// Expand actions of type `A`.
    pub fn register<A: AsyncAction>(mut self) -> Self {
        self.flows
            .insert(ActionType::of::<A>().id(), flow_for::<A> as FlowFactory);
        self
    }
}

impl Default for AsyncFlowMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<S: StoreState> Middleware<S> for AsyncFlowMiddleware {
    async fn handle(
        &self,
        store: &Store<S>,
        action: ActionRef,
        next: Next<'_, S>,
    ) -> Result<ActionRef, StoreError> {
        let Some(flow) = self.flows.get(&action.type_id()) else {
            return next.run(action).await;
        };

        let mut items = flow(action.clone());
        let mut produced = Vec::with_capacity(3);

        while let Some(item) = items.next().await {
            // Observers see the step before the rest of the chain has finished with it.
            store.dispatch_ref(item.clone());
            match next.run(item.clone()).await {
                Ok(_) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => self.logger.warn(
                    "{item} from {action} failed downstream: {error}",
                    &[&item.type_name(), &action.type_name(), &e],
                ),
            }
            produced.push(item);
        }

        Ok(ActionRef::new(AsyncFlowFinished {
            source: action,
            actions: produced,
        }))
    }

    fn name(&self) -> &'static str {
        "AsyncFlowMiddleware"
    }
}
