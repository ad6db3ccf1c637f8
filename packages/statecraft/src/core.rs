//! Core traits for the statecraft store.
//!
//! # Overview
//!
//! Statecraft separates **what happened** from **what it means**:
//! - [`Action`] = an immutable value describing a requested change
//! - [`Reducer`] = a pure function turning `(state, action)` into the next state
//!
//! Actions travel through the middleware chain type-erased as [`ActionRef`].
//! Places that need to recognise a particular action (cache registration,
//! saga handlers, persistence triggers) are given an explicit [`ActionType`]
//! at registration time instead of probing values at runtime.

use std::any::{Any, TypeId};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Downcasting support for type-erased actions.
///
/// Implemented automatically for every `'static` type.
pub trait AsAny: Any {
    /// Borrow as `&dyn Any` for downcasting.
    fn as_any(&self) -> &dyn Any;

    /// Fully qualified type name of the concrete value.
    fn type_name(&self) -> &'static str;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

/// An immutable value dispatched into a [`Store`](crate::Store).
///
/// Actions describe a requested change. They carry data, never behaviour;
/// reducers, sagas and middleware decide what they mean.
///
/// # Example
///
/// ```ignore
/// #[derive(Debug, Clone, PartialEq, Eq, Hash)]
/// struct AddTodo {
///     title: String,
/// }
/// impl Action for AddTodo {}
/// ```
pub trait Action: AsAny + fmt::Debug + Send + Sync + 'static {}

/// Explicit type discriminator for an action type.
///
/// Equality and hashing use the `TypeId` only; the name is kept for logs.
#[derive(Clone, Copy)]
pub struct ActionType {
    id: TypeId,
    name: &'static str,
}

impl ActionType {
    /// The discriminator for action type `A`.
    pub fn of<A: Action>() -> Self {
        Self {
            id: TypeId::of::<A>(),
            name: std::any::type_name::<A>(),
        }
    }

    /// The underlying `TypeId`.
    pub fn id(&self) -> TypeId {
        self.id
    }

    /// Human-readable type name.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for ActionType {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ActionType {}

impl Hash for ActionType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ActionType").field(&self.name).finish()
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Shared, type-erased handle to a dispatched action.
///
/// Cloning is cheap (reference counted). Use [`ActionRef::downcast_ref`]
/// to recover the concrete type.
#[derive(Clone)]
pub struct ActionRef(Arc<dyn Action>);

impl ActionRef {
    /// Wrap an action.
    pub fn new<A: Action>(action: A) -> Self {
        Self(Arc::new(action))
    }

    /// Borrow the payload as `&dyn Any`.
    pub fn as_any(&self) -> &dyn Any {
        // Must go through the trait object so the concrete payload is
        // returned rather than the Arc itself.
        <dyn Action as AsAny>::as_any(&*self.0)
    }

    /// Downcast to a concrete action type.
    pub fn downcast_ref<A: Action>(&self) -> Option<&A> {
        self.as_any().downcast_ref::<A>()
    }

    /// Check whether the payload is an `A`.
    pub fn is<A: Action>(&self) -> bool {
        self.as_any().is::<A>()
    }

    /// `TypeId` of the payload.
    pub fn type_id(&self) -> TypeId {
        self.as_any().type_id()
    }

    /// Type name of the payload.
    pub fn type_name(&self) -> &'static str {
        <dyn Action as AsAny>::type_name(&*self.0)
    }

    /// Type discriminator of the payload.
    pub fn action_type(&self) -> ActionType {
        ActionType {
            id: self.type_id(),
            name: self.type_name(),
        }
    }

    /// Whether two handles point at the same allocation.
    pub fn ptr_eq(&self, other: &ActionRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl<A: Action> From<A> for ActionRef {
    fn from(action: A) -> Self {
        Self::new(action)
    }
}

impl fmt::Debug for ActionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

/// Bounds required of a store's state type.
///
/// Automatically implemented. Equality drives change detection: the store
/// only publishes a new snapshot when it differs from the current one.
pub trait StoreState: PartialEq + Send + Sync + 'static {}

impl<T: PartialEq + Send + Sync + 'static> StoreState for T {}

/// Pure state transition function.
///
/// Closures of the shape `Fn(&S, &ActionRef) -> S` implement this trait.
///
/// # Example
///
/// ```ignore
/// let reducer = |state: &Counter, action: &ActionRef| {
///     match action.downcast_ref::<Increment>() {
///         Some(inc) => Counter { value: state.value + inc.by },
///         None => state.clone(),
///     }
/// };
/// ```
pub trait Reducer<S>: Send + Sync + 'static {
    /// Produce the next state. Must not perform IO.
    fn reduce(&self, state: &S, action: &ActionRef) -> S;
}

impl<S, F> Reducer<S> for F
where
    F: Fn(&S, &ActionRef) -> S + Send + Sync + 'static,
{
    fn reduce(&self, state: &S, action: &ActionRef) -> S {
        self(state, action)
    }
}

/// Reducers folded left-to-right into one.
pub struct CombinedReducer<S> {
    reducers: Vec<Box<dyn Reducer<S>>>,
}

impl<S> CombinedReducer<S> {
    /// Append another reducer to the fold.
    pub fn and<R: Reducer<S>>(mut self, reducer: R) -> Self {
        self.reducers.push(Box::new(reducer));
        self
    }

    /// Number of folded reducers.
    pub fn len(&self) -> usize {
        self.reducers.len()
    }

    /// Whether the fold is empty (acts as identity).
    pub fn is_empty(&self) -> bool {
        self.reducers.is_empty()
    }
}

impl<S: Clone + Send + Sync + 'static> Reducer<S> for CombinedReducer<S> {
    fn reduce(&self, state: &S, action: &ActionRef) -> S {
        self.reducers
            .iter()
            .fold(state.clone(), |acc, reducer| reducer.reduce(&acc, action))
    }
}

/// Fold several reducers into one, applied in the given order.
pub fn combine_reducers<S>(reducers: Vec<Box<dyn Reducer<S>>>) -> CombinedReducer<S> {
    CombinedReducer { reducers }
}

/// Replaces the store's snapshot wholesale.
///
/// The terminal step recognises this action and swaps the carried state in
/// without consulting the reducer, so restoration works even when
/// application reducers never mention it.
pub struct RestoreState<S> {
    state: Arc<S>,
}

impl<S> RestoreState<S> {
    /// Create a restore action for a loaded snapshot.
    pub fn new(state: Arc<S>) -> Self {
        Self { state }
    }

    /// The snapshot being restored.
    pub fn state(&self) -> &Arc<S> {
        &self.state
    }
}

impl<S> fmt::Debug for RestoreState<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestoreState").finish_non_exhaustive()
    }
}

impl<S: StoreState> Action for RestoreState<S> {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[derive(Debug, Clone, PartialEq)]
    struct Increment {
        by: i64,
    }
    impl Action for Increment {}

    #[derive(Debug, Clone, PartialEq)]
    struct Reset;
    impl Action for Reset {}

    #[derive(Debug, Clone, PartialEq)]
    struct Counter {
        value: i64,
    }

    #[test]
    fn test_action_ref_downcast() {
        let action = ActionRef::new(Increment { by: 3 });

        assert!(action.is::<Increment>());
        assert!(!action.is::<Reset>());
        assert_eq!(action.downcast_ref::<Increment>(), Some(&Increment { by: 3 }));
        assert!(action.downcast_ref::<Reset>().is_none());
    }

    #[test]
    fn test_action_ref_reports_payload_type_not_arc() {
        let action = ActionRef::new(Reset);

        assert_eq!(action.type_id(), TypeId::of::<Reset>());
        assert!(action.type_name().ends_with("Reset"));
        assert_eq!(action.action_type(), ActionType::of::<Reset>());
    }

    #[test]
    fn test_action_type_equality_ignores_name() {
        let a = ActionType::of::<Increment>();
        let b = ActionType::of::<Increment>();
        let c = ActionType::of::<Reset>();

        assert_eq!(a, b);
        assert_ne!(a, c);

        let mut set = HashSet::new();
        set.insert(a);
        set.insert(b);
        set.insert(c);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_action_ref_debug_shows_payload() {
        let action = ActionRef::new(Increment { by: 7 });
        let debug = format!("{:?}", action);
        assert!(debug.contains("Increment"));
        assert!(debug.contains('7'));
    }

    #[test]
    fn test_action_ref_clone_shares_allocation() {
        let a = ActionRef::new(Reset);
        let b = a.clone();
        let c = ActionRef::new(Reset);

        assert!(a.ptr_eq(&b));
        assert!(!a.ptr_eq(&c));
    }

    #[test]
    fn test_closure_reducer() {
        let reducer = |state: &Counter, action: &ActionRef| match action.downcast_ref::<Increment>() {
            Some(inc) => Counter {
                value: state.value + inc.by,
            },
            None => state.clone(),
        };

        let next = reducer.reduce(&Counter { value: 1 }, &ActionRef::new(Increment { by: 2 }));
        assert_eq!(next, Counter { value: 3 });

        let same = reducer.reduce(&next, &ActionRef::new(Reset));
        assert_eq!(same, next);
    }

    #[test]
    fn test_combined_reducer_folds_left_to_right() {
        let add = |state: &Counter, action: &ActionRef| match action.downcast_ref::<Increment>() {
            Some(inc) => Counter {
                value: state.value + inc.by,
            },
            None => state.clone(),
        };
        let double = |state: &Counter, _: &ActionRef| Counter {
            value: state.value * 2,
        };

        let add_then_double = combine_reducers(vec![Box::new(add), Box::new(double)]);
        let double_then_add = combine_reducers::<Counter>(Vec::new())
            .and(double)
            .and(add);

        let action = ActionRef::new(Increment { by: 1 });
        assert_eq!(
            add_then_double.reduce(&Counter { value: 1 }, &action),
            Counter { value: 4 }
        );
        assert_eq!(
            double_then_add.reduce(&Counter { value: 1 }, &action),
            Counter { value: 3 }
        );
        assert_eq!(add_then_double.len(), 2);
    }

    #[test]
    fn test_empty_combined_reducer_is_identity() {
        let reducer = combine_reducers::<Counter>(Vec::new());
        assert!(reducer.is_empty());
        assert_eq!(
            reducer.reduce(&Counter { value: 5 }, &ActionRef::new(Reset)),
            Counter { value: 5 }
        );
    }

    #[test]
    fn test_restore_state_is_an_action() {
        let restore = ActionRef::new(RestoreState::new(Arc::new(Counter { value: 9 })));

        let inner = restore.downcast_ref::<RestoreState<Counter>>().unwrap();
        assert_eq!(inner.state().value, 9);
        assert!(format!("{:?}", restore).contains("RestoreState"));
    }
}
