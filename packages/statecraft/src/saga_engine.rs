//! Saga engine: routes actions to saga instances and applies transitions.
//!
//! ```text
//! action ─► for each saga (independently)
//!             ├─ offer to every live instance (concurrently, one lock per instance)
//!             │     first matching handler ─► commit ─► persist ─► effects
//!             └─ nobody accepted? ─► first matching start handler ─► new instance
//! ```
//!
//! Transitions on the same instance id are serialized by that instance's
//! lock; different instances never wait on each other. Effects run on their
//! own task, so a `Delay` only holds up the transition that produced it.
//! Within one transition each `Dispatch` has gone through the store before
//! the next effect starts.
//!
//! # Usage
//!
//! ```ignore
//! let engine = SagaEngine::builder()
//!     .register(checkout_saga())
//!     .register(refund_saga())
//!     .build()?;
//!
//! engine.recover().await?;
//!
//! let store = Store::builder(state)
//!     .reducer(reducer)
//!     .with_middleware(SagaMiddleware::new(engine.clone()))
//!     .build()
//!     .await;
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use tokio::sync::Mutex;

use crate::core::{ActionRef, StoreState};
use crate::error::{panic_message, SagaError, StoreError};
use crate::logger::Logger;
use crate::middleware::{Middleware, Next};
use crate::saga::{SagaDefinition, SagaEffect, SagaInstance, SagaState, SagaTransition};
use crate::saga_persistence::SagaPersister;
use crate::store::{ActionSink, Store};

type Slot<T> = Arc<Mutex<Option<SagaInstance<T>>>>;

/// Type-erased saga runner.
#[async_trait]
trait AnySaga: Send + Sync {
    fn name(&self) -> &str;

    /// Offer `action` to live instances. One effect list per transition.
    async fn route(&self, action: &ActionRef) -> Vec<Vec<SagaEffect>>;

    /// Try to start a new instance from `action`.
    async fn start(&self, action: &ActionRef) -> Option<Vec<SagaEffect>>;

    async fn recover(&self) -> Result<usize, SagaError>;

    fn instance_ids(&self) -> Vec<String>;

    fn shutdown(&self);

    fn as_any(&self) -> &dyn Any;
}

struct SagaRunner<T: SagaState> {
    definition: SagaDefinition<T>,
    instances: DashMap<String, Slot<T>>,
    persister: Option<SagaPersister<T>>,
    logger: Logger,
}

impl<T: SagaState> SagaRunner<T> {
    fn new(mut definition: SagaDefinition<T>, logger: Logger) -> Self {
        let persister = definition.storage.take().map(|config| {
            SagaPersister::new(
                definition.name(),
                config.storage,
                config.policy,
                logger.clone(),
            )
        });
        Self {
            definition,
            instances: DashMap::new(),
            persister,
            logger,
        }
    }

    async fn route_to(&self, id: String, slot: Slot<T>, action: &ActionRef) -> Option<Vec<SagaEffect>> {
        let mut guard = slot.lock().await;
        // Completed while we waited for the lock.
        let instance = guard.as_ref()?;
        let handler = self.definition.find_handler(action, &instance.state)?;

        let transition = match catch_unwind(AssertUnwindSafe(|| handler.apply(action, instance))) {
            Ok(transition) => transition?,
            Err(panic) => {
                self.logger.error(
                    "handler for {action} panicked on instance {id}: {panic}",
                    &[&action.type_name(), &id, &panic_message(panic.as_ref())],
                );
                return None;
            }
        };

        match transition {
            SagaTransition::Continue { state, effects } => {
                let updated = instance.clone().advance(state);
                if let Some(persister) = &self.persister {
                    persister.on_continue(&updated).await;
                }
                *guard = Some(updated);
                self.logger.debug(
                    "instance {id} continued on {action}",
                    &[&id, &action.type_name()],
                );
                Some(effects)
            }
            SagaTransition::Complete { effects } => {
                *guard = None;
                self.instances.remove(&id);
                if let Some(persister) = &self.persister {
                    persister.on_complete(&id).await;
                }
                self.logger.info(
                    "instance {id} completed on {action}",
                    &[&id, &action.type_name()],
                );
                Some(effects)
            }
        }
    }

    async fn instance(&self, id: &str) -> Option<SagaInstance<T>> {
        let slot = self.instances.get(id).map(|entry| entry.value().clone())?;
        let guard = slot.lock().await;
        guard.clone()
    }
}

#[async_trait]
impl<T: SagaState> AnySaga for SagaRunner<T> {
    fn name(&self) -> &str {
        self.definition.name()
    }

    async fn route(&self, action: &ActionRef) -> Vec<Vec<SagaEffect>> {
        let slots: Vec<(String, Slot<T>)> = self
            .instances
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        if slots.is_empty() {
            return Vec::new();
        }

        join_all(
            slots
                .into_iter()
                .map(|(id, slot)| self.route_to(id, slot, action)),
        )
        .await
        .into_iter()
        .flatten()
        .collect()
    }

    async fn start(&self, action: &ActionRef) -> Option<Vec<SagaEffect>> {
        let handler = self.definition.find_start(action)?;

        let transition = match catch_unwind(AssertUnwindSafe(|| handler.apply(action))) {
            Ok(transition) => transition?,
            Err(panic) => {
                self.logger.error(
                    "start handler for {action} panicked: {panic}",
                    &[&action.type_name(), &panic_message(panic.as_ref())],
                );
                return None;
            }
        };

        match transition {
            SagaTransition::Continue { state, effects } => {
                let instance = SagaInstance::new(self.definition.name(), state);
                let id = instance.id.clone();

                let slot: Slot<T> = Arc::new(Mutex::new(None));
                let mut guard = slot.clone().lock_owned().await;
                self.instances.insert(id.clone(), slot);
                if let Some(persister) = &self.persister {
                    persister.on_continue(&instance).await;
                }
                *guard = Some(instance);
                drop(guard);

                self.logger.info(
                    "started instance {id} on {action}",
                    &[&id, &action.type_name()],
                );
                Some(effects)
            }
            // Finished on arrival; nothing to keep.
            SagaTransition::Complete { effects } => Some(effects),
        }
    }

    async fn recover(&self) -> Result<usize, SagaError> {
        let Some(persister) = &self.persister else {
            return Ok(0);
        };

        let instances = persister.load_all().await?;
        let count = instances.len();
        for instance in instances {
            self.instances
                .insert(instance.id.clone(), Arc::new(Mutex::new(Some(instance))));
        }
        self.logger
            .info("recovered {count} instances", &[&count]);
        Ok(count)
    }

    fn instance_ids(&self) -> Vec<String> {
        self.instances.iter().map(|e| e.key().clone()).collect()
    }

    fn shutdown(&self) {
        if let Some(persister) = &self.persister {
            persister.shutdown();
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct EngineInner {
    sagas: Vec<Arc<dyn AnySaga>>,
    by_name: HashMap<String, usize>,
    shut_down: AtomicBool,
    logger: Logger,
}

/// Registry of sagas. Cloning shares the same engine.
#[derive(Clone)]
pub struct SagaEngine {
    inner: Arc<EngineInner>,
}

impl SagaEngine {
    pub fn builder() -> SagaEngineBuilder {
        SagaEngineBuilder::new()
    }

    /// Feed `action` to every saga.
    ///
    /// Each saga decides independently: live instances get the first
    /// chance, and only if none of them accepted the action are that saga's
    /// start handlers consulted. Returns the number of transitions applied.
    pub async fn handle(&self, sink: Arc<dyn ActionSink>, action: &ActionRef) -> usize {
        if self.inner.shut_down.load(Ordering::Acquire) {
            return 0;
        }

        let mut applied = 0;
        for saga in &self.inner.sagas {
            let mut transitions = saga.route(action).await;
            if transitions.is_empty() {
                if let Some(effects) = saga.start(action).await {
                    transitions.push(effects);
                }
            }

            applied += transitions.len();
            for effects in transitions {
                self.spawn_effects(sink.clone(), effects);
            }
        }
        applied
    }

    /// Start saga `name` with `trigger`, bypassing live instances.
    ///
    /// Returns whether a start handler accepted the trigger.
    pub async fn start_saga(
        &self,
        name: &str,
        trigger: ActionRef,
        sink: Arc<dyn ActionSink>,
    ) -> Result<bool, SagaError> {
        let saga = self.saga(name)?;
        match saga.start(&trigger).await {
            Some(effects) => {
                self.spawn_effects(sink, effects);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Reload stored instances of every persistent saga.
    pub async fn recover(&self) -> Result<usize, SagaError> {
        let mut total = 0;
        for saga in &self.inner.sagas {
            total += saga.recover().await?;
        }
        Ok(total)
    }

    /// Ids of the live instances of `name`.
    pub fn instance_ids(&self, name: &str) -> Result<Vec<String>, SagaError> {
        Ok(self.saga(name)?.instance_ids())
    }

    pub fn instance_count(&self, name: &str) -> Result<usize, SagaError> {
        Ok(self.saga(name)?.instance_ids().len())
    }

    /// Snapshot of one instance. `None` if it does not exist or `T` is not
    /// the saga's state type.
    pub async fn instance<T: SagaState>(&self, name: &str, id: &str) -> Option<SagaInstance<T>> {
        let saga = self.saga(name).ok()?;
        let runner = saga.as_any().downcast_ref::<SagaRunner<T>>()?;
        runner.instance(id).await
    }

    pub fn saga_names(&self) -> Vec<&str> {
        self.inner.sagas.iter().map(|s| s.name()).collect()
    }

    /// Stop applying effects and cancel pending saga saves.
    pub fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        for saga in &self.inner.sagas {
            saga.shutdown();
        }
    }

    fn saga(&self, name: &str) -> Result<&Arc<dyn AnySaga>, SagaError> {
        self.inner
            .by_name
            .get(name)
            .map(|&index| &self.inner.sagas[index])
            .ok_or_else(|| SagaError::UnknownSaga {
                name: name.to_string(),
            })
    }

    fn spawn_effects(&self, sink: Arc<dyn ActionSink>, effects: Vec<SagaEffect>) {
        if effects.is_empty() {
            return;
        }
        tokio::spawn(run_effects(self.clone(), sink, effects));
    }
}

fn run_effects(
    engine: SagaEngine,
    sink: Arc<dyn ActionSink>,
    effects: Vec<SagaEffect>,
) -> BoxFuture<'static, ()> {
    async move {
        for effect in effects {
            if engine.inner.shut_down.load(Ordering::Acquire) {
                return;
            }
            match effect {
                SagaEffect::Dispatch(action) => {
                    let type_name = action.type_name();
                    if let Err(e) = sink.dispatch_in_order(action).await {
                        engine.inner.logger.warn(
                            "saga effect {action} failed: {error}",
                            &[&type_name, &e],
                        );
                    }
                }
                SagaEffect::Delay(duration) => tokio::time::sleep(duration).await,
                SagaEffect::StartSaga { name, trigger } => {
                    match engine.start_saga(&name, trigger, sink.clone()).await {
                        Ok(true) => {}
                        Ok(false) => engine.inner.logger.warn(
                            "saga {name} did not accept its start trigger",
                            &[&name],
                        ),
                        Err(e) => engine.inner.logger.error("{error}", &[&e]),
                    }
                }
            }
        }
    }
    .boxed()
}

impl std::fmt::Debug for SagaEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaEngine")
            .field("sagas", &self.saga_names())
            .finish()
    }
}

/// Builder for [`SagaEngine`].
pub struct SagaEngineBuilder {
    sagas: Vec<Arc<dyn AnySaga>>,
    by_name: HashMap<String, usize>,
    duplicate: Option<String>,
    logger: Logger,
}

impl SagaEngineBuilder {
    pub fn new() -> Self {
        Self {
            sagas: Vec::new(),
            by_name: HashMap::new(),
            duplicate: None,
            logger: Logger::tracing("statecraft::saga"),
        }
    }

    pub fn with_logger(mut self, logger: Logger) -> Self {
        self.logger = logger;
        self
    }

    /// Register a saga. Names must be unique.
    pub fn register<T: SagaState>(mut self, definition: SagaDefinition<T>) -> Self {
        let name = definition.name().to_string();
        if self.by_name.contains_key(&name) {
            self.duplicate.get_or_insert(name);
            return self;
        }

        let logger = self.logger.named(format!("statecraft::saga::{}", name));
        self.by_name.insert(name, self.sagas.len());
        self.sagas
            .push(Arc::new(SagaRunner::new(definition, logger)));
        self
    }

    pub fn build(self) -> Result<SagaEngine, SagaError> {
        if let Some(name) = self.duplicate {
            return Err(SagaError::DuplicateSaga { name });
        }
        Ok(SagaEngine {
            inner: Arc::new(EngineInner {
                sagas: self.sagas,
                by_name: self.by_name,
                shut_down: AtomicBool::new(false),
                logger: self.logger,
            }),
        })
    }
}

impl Default for SagaEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Feeds every processed action to a [`SagaEngine`].
///
/// The rest of the chain runs first, so saga handlers observe actions whose
/// state change has already been committed.
pub struct SagaMiddleware {
    engine: SagaEngine,
}

impl SagaMiddleware {
    pub fn new(engine: SagaEngine) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &SagaEngine {
        &self.engine
    }
}

#[async_trait]
impl<S: StoreState> Middleware<S> for SagaMiddleware {
    async fn handle(
        &self,
        store: &Store<S>,
        action: ActionRef,
        next: Next<'_, S>,
    ) -> Result<ActionRef, StoreError> {
        let result = next.run(action.clone()).await?;
        let sink: Arc<dyn ActionSink> = Arc::new(store.clone());
        self.engine.handle(sink, &action).await;
        Ok(result)
    }

    fn name(&self) -> &'static str {
        "SagaMiddleware"
    }

    fn shutdown(&self) {
        self.engine.shutdown();
    }
}
