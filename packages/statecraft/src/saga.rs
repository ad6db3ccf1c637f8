//! Saga definitions.
//!
//! A saga is a named, long-running workflow driven by actions. Each saga
//! may have many live [`SagaInstance`]s at once, each with its own state.
//!
//! ```text
//! {no instance} ──start handler──► {instance: state} ──handler──► Continue(state')
//!                                          │
//!                                          └──────handler──► Complete ──► removed
//! ```
//!
//! Handlers never perform IO. They return a [`SagaTransition`] carrying
//! [`SagaEffect`]s, which the engine applies in order after the new state
//! is committed.
//!
//! # Example
//!
//! ```ignore
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! enum Checkout {
//!     AwaitingPayment { order: u64 },
//!     AwaitingShipment { order: u64 },
//! }
//!
//! let saga = SagaDefinition::<Checkout>::new("checkout")
//!     .start_on(|placed: &OrderPlaced| {
//!         SagaTransition::continue_with(Checkout::AwaitingPayment { order: placed.id })
//!             .dispatch(RequestPayment { order: placed.id })
//!     })
//!     .on_when(
//!         |paid: &PaymentReceived, state: &Checkout| {
//!             matches!(state, Checkout::AwaitingPayment { order } if *order == paid.order)
//!         },
//!         |paid: &PaymentReceived, _instance| {
//!             SagaTransition::continue_with(Checkout::AwaitingShipment { order: paid.order })
//!                 .delay(Duration::from_secs(1))
//!                 .dispatch(ShipOrder { order: paid.order })
//!         },
//!     )
//!     .on(|_: &OrderShipped, _instance| SagaTransition::complete());
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::{Action, ActionRef, ActionType};
use crate::saga_persistence::{SagaPersistencePolicy, SagaStorage};

/// Bounds required of saga state.
pub trait SagaState: Clone + fmt::Debug + Send + Sync + 'static {}

impl<T: Clone + fmt::Debug + Send + Sync + 'static> SagaState for T {}

/// One live execution of a saga.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaInstance<T> {
    pub id: String,
    pub saga_name: String,
    pub state: T,
    pub started_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
}

impl<T> SagaInstance<T> {
    /// A fresh instance with a new unique id.
    pub fn new(saga_name: impl Into<String>, state: T) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            saga_name: saga_name.into(),
            state,
            started_at: now,
            last_updated_at: now,
        }
    }

    /// The same instance with `state` replaced and the update time bumped.
    pub fn advance(mut self, state: T) -> Self {
        self.state = state;
        self.last_updated_at = Utc::now();
        self
    }
}

/// Side instruction produced by a saga handler.
#[derive(Debug, Clone)]
pub enum SagaEffect {
    /// Dispatch an action into the store.
    Dispatch(ActionRef),
    /// Pause the remaining effects of this transition.
    Delay(Duration),
    /// Start another saga by name with a synthetic trigger.
    StartSaga { name: String, trigger: ActionRef },
}

impl SagaEffect {
    pub fn dispatch(action: impl Into<ActionRef>) -> Self {
        Self::Dispatch(action.into())
    }

    pub fn delay(duration: Duration) -> Self {
        Self::Delay(duration)
    }

    pub fn start_saga(name: impl Into<String>, trigger: impl Into<ActionRef>) -> Self {
        Self::StartSaga {
            name: name.into(),
            trigger: trigger.into(),
        }
    }
}

/// Outcome of a handler.
#[derive(Debug, Clone)]
pub enum SagaTransition<T> {
    /// Keep the instance alive with a new state.
    Continue { state: T, effects: Vec<SagaEffect> },
    /// Remove the instance.
    Complete { effects: Vec<SagaEffect> },
}

impl<T> SagaTransition<T> {
    pub fn continue_with(state: T) -> Self {
        Self::Continue {
            state,
            effects: Vec::new(),
        }
    }

    pub fn complete() -> Self {
        Self::Complete {
            effects: Vec::new(),
        }
    }

    /// Append an effect.
    pub fn with_effect(mut self, effect: SagaEffect) -> Self {
        match &mut self {
            Self::Continue { effects, .. } | Self::Complete { effects } => effects.push(effect),
        }
        self
    }

    pub fn dispatch(self, action: impl Into<ActionRef>) -> Self {
        self.with_effect(SagaEffect::dispatch(action))
    }

    pub fn delay(self, duration: Duration) -> Self {
        self.with_effect(SagaEffect::delay(duration))
    }

    pub fn start_saga(self, name: impl Into<String>, trigger: impl Into<ActionRef>) -> Self {
        self.with_effect(SagaEffect::start_saga(name, trigger))
    }

    pub fn effects(&self) -> &[SagaEffect] {
        match self {
            Self::Continue { effects, .. } | Self::Complete { effects } => effects,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete { .. })
    }
}

type ActionPredicate = Arc<dyn Fn(&ActionRef) -> bool + Send + Sync>;
type StatePredicate<T> = Arc<dyn Fn(&ActionRef, &T) -> bool + Send + Sync>;
type StartFn<T> = Arc<dyn Fn(&ActionRef) -> Option<SagaTransition<T>> + Send + Sync>;
type OngoingFn<T> = Arc<dyn Fn(&ActionRef, &SagaInstance<T>) -> Option<SagaTransition<T>> + Send + Sync>;

/// How a handler recognises its action.
enum Matcher<P> {
    /// Registered action type, plus an optional value predicate.
    Typed {
        action_type: ActionType,
        predicate: Option<P>,
    },
    /// Arbitrary predicate.
    Predicate(P),
}

pub(crate) struct StartHandler<T> {
    matcher: Matcher<ActionPredicate>,
    handle: StartFn<T>,
}

impl<T> StartHandler<T> {
    fn matches(&self, action: &ActionRef) -> bool {
        match &self.matcher {
            Matcher::Typed {
                action_type,
                predicate,
            } => {
                action.type_id() == action_type.id()
                    && predicate.as_ref().map_or(true, |p| p(action))
            }
            Matcher::Predicate(p) => p(action),
        }
    }

    pub(crate) fn apply(&self, action: &ActionRef) -> Option<SagaTransition<T>> {
        (self.handle)(action)
    }
}

pub(crate) struct OngoingHandler<T> {
    matcher: Matcher<StatePredicate<T>>,
    handle: OngoingFn<T>,
}

impl<T> OngoingHandler<T> {
    fn matches(&self, action: &ActionRef, state: &T) -> bool {
        match &self.matcher {
            Matcher::Typed {
                action_type,
                predicate,
            } => {
                action.type_id() == action_type.id()
                    && predicate.as_ref().map_or(true, |p| p(action, state))
            }
            Matcher::Predicate(p) => p(action, state),
        }
    }

    pub(crate) fn apply(
        &self,
        action: &ActionRef,
        instance: &SagaInstance<T>,
    ) -> Option<SagaTransition<T>> {
        (self.handle)(action, instance)
    }
}

/// Storage wiring for a saga.
pub(crate) struct SagaStorageConfig<T> {
    pub(crate) storage: Arc<dyn SagaStorage<T>>,
    pub(crate) policy: SagaPersistencePolicy<T>,
}

/// A named saga: start handlers, ongoing handlers and optional storage.
///
/// Handlers are consulted in registration order; the first match wins.
pub struct SagaDefinition<T> {
    name: String,
    start_handlers: Vec<StartHandler<T>>,
    handlers: Vec<OngoingHandler<T>>,
    pub(crate) storage: Option<SagaStorageConfig<T>>,
}

impl<T: SagaState> SagaDefinition<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            start_handlers: Vec::new(),
            handlers: Vec::new(),
            storage: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Start a new instance on every `A`.
    pub fn start_on<A, F>(self, handler: F) -> Self
    where
        A: Action,
        F: Fn(&A) -> SagaTransition<T> + Send + Sync + 'static,
    {
        self.push_start::<A, _>(None, handler)
    }

    /// Start a new instance on an `A` satisfying `predicate`.
    pub fn start_on_when<A, P, F>(self, predicate: P, handler: F) -> Self
    where
        A: Action,
        P: Fn(&A) -> bool + Send + Sync + 'static,
        F: Fn(&A) -> SagaTransition<T> + Send + Sync + 'static,
    {
        let predicate: ActionPredicate =
            Arc::new(move |action: &ActionRef| action.downcast_ref::<A>().is_some_and(&predicate));
        self.push_start::<A, _>(Some(predicate), handler)
    }

    /// Start a new instance on any action satisfying `predicate`.
    pub fn start_when<P, F>(mut self, predicate: P, handler: F) -> Self
    where
        P: Fn(&ActionRef) -> bool + Send + Sync + 'static,
        F: Fn(&ActionRef) -> SagaTransition<T> + Send + Sync + 'static,
    {
        self.start_handlers.push(StartHandler {
            matcher: Matcher::Predicate(Arc::new(predicate)),
            handle: Arc::new(move |action: &ActionRef| Some(handler(action))),
        });
        self
    }

    fn push_start<A, F>(mut self, predicate: Option<ActionPredicate>, handler: F) -> Self
    where
        A: Action,
        F: Fn(&A) -> SagaTransition<T> + Send + Sync + 'static,
    {
        self.start_handlers.push(StartHandler {
            matcher: Matcher::Typed {
                action_type: ActionType::of::<A>(),
                predicate,
            },
            handle: Arc::new(move |action: &ActionRef| action.downcast_ref::<A>().map(&handler)),
        });
        self
    }

    /// Handle every `A` reaching a live instance.
    pub fn on<A, F>(self, handler: F) -> Self
    where
        A: Action,
        F: Fn(&A, &SagaInstance<T>) -> SagaTransition<T> + Send + Sync + 'static,
    {
        self.push_ongoing::<A, _>(None, handler)
    }

    /// Handle an `A` when `predicate(action, state)` holds.
    pub fn on_when<A, P, F>(self, predicate: P, handler: F) -> Self
    where
        A: Action,
        P: Fn(&A, &T) -> bool + Send + Sync + 'static,
        F: Fn(&A, &SagaInstance<T>) -> SagaTransition<T> + Send + Sync + 'static,
    {
        let predicate: StatePredicate<T> = Arc::new(move |action: &ActionRef, state: &T| {
            action
                .downcast_ref::<A>()
                .is_some_and(|a| predicate(a, state))
        });
        self.push_ongoing::<A, _>(Some(predicate), handler)
    }

    /// Handle any action for which `predicate(action, state)` holds.
    pub fn on_matching<P, F>(mut self, predicate: P, handler: F) -> Self
    where
        P: Fn(&ActionRef, &T) -> bool + Send + Sync + 'static,
        F: Fn(&ActionRef, &SagaInstance<T>) -> SagaTransition<T> + Send + Sync + 'static,
    {
        self.handlers.push(OngoingHandler {
            matcher: Matcher::Predicate(Arc::new(predicate)),
            handle: Arc::new(move |action: &ActionRef, instance: &SagaInstance<T>| {
                Some(handler(action, instance))
            }),
        });
        self
    }

    fn push_ongoing<A, F>(mut self, predicate: Option<StatePredicate<T>>, handler: F) -> Self
    where
        A: Action,
        F: Fn(&A, &SagaInstance<T>) -> SagaTransition<T> + Send + Sync + 'static,
    {
        self.handlers.push(OngoingHandler {
            matcher: Matcher::Typed {
                action_type: ActionType::of::<A>(),
                predicate,
            },
            handle: Arc::new(move |action: &ActionRef, instance: &SagaInstance<T>| {
                action.downcast_ref::<A>().map(|a| handler(a, instance))
            }),
        });
        self
    }

    /// Persist instances to `storage` according to `policy`.
    pub fn with_storage(
        mut self,
        storage: Arc<dyn SagaStorage<T>>,
        policy: SagaPersistencePolicy<T>,
    ) -> Self {
        self.storage = Some(SagaStorageConfig { storage, policy });
        self
    }

    /// First start handler accepting `action`.
    pub(crate) fn find_start(&self, action: &ActionRef) -> Option<&StartHandler<T>> {
        self.start_handlers.iter().find(|h| h.matches(action))
    }

    /// First ongoing handler accepting `action` in `state`.
    pub(crate) fn find_handler(&self, action: &ActionRef, state: &T) -> Option<&OngoingHandler<T>> {
        self.handlers.iter().find(|h| h.matches(action, state))
    }
}

impl<T> fmt::Debug for SagaDefinition<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SagaDefinition")
            .field("name", &self.name)
            .field("start_handlers", &self.start_handlers.len())
            .field("handlers", &self.handlers.len())
            .field("persistent", &self.storage.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct OrderPlaced {
        id: u64,
        total: u64,
    }
    impl Action for OrderPlaced {}

    #[derive(Debug, Clone, PartialEq)]
    struct PaymentReceived {
        order: u64,
    }
    impl Action for PaymentReceived {}

    #[derive(Debug, Clone, PartialEq)]
    struct Cancel;
    impl Action for Cancel {}

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    enum Checkout {
        AwaitingPayment { order: u64 },
        Paid { order: u64 },
    }

    fn checkout() -> SagaDefinition<Checkout> {
        SagaDefinition::new("checkout")
            .start_on_when(
                |placed: &OrderPlaced| placed.total > 100,
                |_: &OrderPlaced| SagaTransition::complete(),
            )
            .start_on(|placed: &OrderPlaced| {
                SagaTransition::continue_with(Checkout::AwaitingPayment { order: placed.id })
            })
            .on_when(
                |paid: &PaymentReceived, state: &Checkout| {
                    matches!(state, Checkout::AwaitingPayment { order } if *order == paid.order)
                },
                |paid: &PaymentReceived, _| {
                    SagaTransition::continue_with(Checkout::Paid { order: paid.order })
                },
            )
            .on_matching(
                |action, _| action.is::<Cancel>(),
                |_, _| SagaTransition::complete(),
            )
    }

    #[test]
    fn test_start_handlers_first_match_wins() {
        let saga = checkout();

        let big = ActionRef::new(OrderPlaced { id: 1, total: 500 });
        let transition = saga.find_start(&big).unwrap().apply(&big).unwrap();
        assert!(transition.is_complete());

        let small = ActionRef::new(OrderPlaced { id: 2, total: 10 });
        let transition = saga.find_start(&small).unwrap().apply(&small).unwrap();
        assert!(matches!(
            transition,
            SagaTransition::Continue {
                state: Checkout::AwaitingPayment { order: 2 },
                ..
            }
        ));

        assert!(saga.find_start(&ActionRef::new(Cancel)).is_none());
    }

    #[test]
    fn test_ongoing_handlers_filter_on_state() {
        let saga = checkout();
        let instance = SagaInstance::new("checkout", Checkout::AwaitingPayment { order: 7 });

        let matching = ActionRef::new(PaymentReceived { order: 7 });
        let other = ActionRef::new(PaymentReceived { order: 8 });

        let handler = saga.find_handler(&matching, &instance.state).unwrap();
        let transition = handler.apply(&matching, &instance).unwrap();
        assert!(matches!(
            transition,
            SagaTransition::Continue {
                state: Checkout::Paid { order: 7 },
                ..
            }
        ));

        assert!(saga.find_handler(&other, &instance.state).is_none());

        let paid = instance.clone().advance(Checkout::Paid { order: 7 });
        assert!(saga.find_handler(&matching, &paid.state).is_none());
        assert!(saga
            .find_handler(&ActionRef::new(Cancel), &paid.state)
            .is_some());
    }

    #[test]
    fn test_transition_effects_keep_order() {
        let transition = SagaTransition::continue_with(1_u8)
            .dispatch(Cancel)
            .delay(Duration::from_millis(5))
            .start_saga("refund", PaymentReceived { order: 1 });

        let effects = transition.effects();
        assert_eq!(effects.len(), 3);
        assert!(matches!(&effects[0], SagaEffect::Dispatch(a) if a.is::<Cancel>()));
        assert!(matches!(effects[1], SagaEffect::Delay(d) if d == Duration::from_millis(5)));
        assert!(matches!(&effects[2], SagaEffect::StartSaga { name, .. } if name == "refund"));
    }

    #[test]
    fn test_instance_ids_are_unique_and_advance_bumps_time() {
        let a = SagaInstance::new("checkout", 0_u8);
        let b = SagaInstance::new("checkout", 0_u8);
        assert_ne!(a.id, b.id);

        let started = a.started_at;
        let advanced = a.advance(1);
        assert_eq!(advanced.state, 1);
        assert_eq!(advanced.started_at, started);
        assert!(advanced.last_updated_at >= started);
    }

    #[test]
    fn test_instance_serializes() {
        let instance = SagaInstance::new("checkout", Checkout::Paid { order: 3 });
        let json = serde_json::to_string(&instance).unwrap();
        let back: SagaInstance<Checkout> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, instance);
    }

    #[test]
    fn test_definition_debug() {
        let debug = format!("{:?}", checkout());
        assert!(debug.contains("checkout"));
        assert!(debug.contains("start_handlers: 2"));
    }
}
