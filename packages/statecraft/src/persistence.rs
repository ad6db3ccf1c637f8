//! State persistence policy.
//!
//! # Overview
//!
//! A [`Storage`] collaborator saves and loads whole snapshots. A
//! [`PersistenceStrategy`] decides *when* the
//! [`PersistenceScheduler`](crate::PersistenceScheduler) calls it.
//!
//! # The Contract
//!
//! 1. **Restore before observe.** A stored snapshot is applied before any
//!    change is considered for saving.
//!
//! 2. **Restoration is not a change.** Nothing is saved until a real action
//!    has been processed after restoration.
//!
//! 3. **Failures are reported, not thrown.** Storage errors go to the
//!    configured handler and the baseline stays where it was, so the next
//!    qualifying change retries naturally.
//!
//! # What This Does NOT Guarantee
//!
//! - No save at teardown. Pending debounced saves are dropped.
//! - No queueing. Throttled changes inside the window are skipped.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::core::{Action, ActionType};

/// Snapshot storage collaborator.
///
/// Implementations choose the encoding and medium (file, key-value store,
/// database row). Every operation may fail.
#[async_trait]
pub trait Storage<S>: Send + Sync + 'static {
    async fn save(&self, state: &S) -> anyhow::Result<()>;

    /// The stored snapshot, or `None` when nothing has been saved.
    async fn load(&self) -> anyhow::Result<Option<S>>;

    async fn clear(&self) -> anyhow::Result<()>;

    async fn exists(&self) -> anyhow::Result<bool>;
}

/// `(current, previous)` predicate for [`PersistenceStrategy::Conditional`].
pub type ChangePredicate<S> = Arc<dyn Fn(&S, &S) -> bool + Send + Sync>;

/// When to save.
pub enum PersistenceStrategy<S> {
    /// Every distinct state.
    OnEveryChange,

    /// The last state of each burst, once the store has been quiet this long.
    Debounced(Duration),

    /// At most one save per interval. Changes inside the window are dropped.
    Throttled(Duration),

    /// The current state, right after one of these actions is processed,
    /// whether or not it changed anything.
    OnAction(Vec<ActionType>),

    /// Whenever `predicate(current, previous)` holds.
    Conditional(ChangePredicate<S>),

    /// The first member that fires wins; exactly one save per transition.
    Combined(Vec<PersistenceStrategy<S>>),
}

impl<S> PersistenceStrategy<S> {
    /// Build a [`PersistenceStrategy::Conditional`] from a closure.
    pub fn conditional<F>(predicate: F) -> Self
    where
        F: Fn(&S, &S) -> bool + Send + Sync + 'static,
    {
        Self::Conditional(Arc::new(predicate))
    }

    /// Save after every `A`.
    pub fn on_action<A: Action>() -> Self {
        Self::OnAction(vec![ActionType::of::<A>()])
    }

    /// Whether processing an action of `action_type` forces a save.
    pub fn triggers_on(&self, action_type: ActionType) -> bool {
        match self {
            Self::OnAction(types) => types.contains(&action_type),
            Self::Combined(members) => members.iter().any(|m| m.triggers_on(action_type)),
            _ => false,
        }
    }

    /// Whether any part of this strategy reacts to state changes.
    pub fn observes_changes(&self) -> bool {
        match self {
            Self::OnAction(_) => false,
            Self::Combined(members) => members.iter().any(|m| m.observes_changes()),
            _ => true,
        }
    }
}

impl<S> Clone for PersistenceStrategy<S> {
    fn clone(&self) -> Self {
        match self {
            Self::OnEveryChange => Self::OnEveryChange,
            Self::Debounced(d) => Self::Debounced(*d),
            Self::Throttled(i) => Self::Throttled(*i),
            Self::OnAction(types) => Self::OnAction(types.clone()),
            Self::Conditional(p) => Self::Conditional(p.clone()),
            Self::Combined(members) => Self::Combined(members.clone()),
        }
    }
}

impl<S> fmt::Debug for PersistenceStrategy<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OnEveryChange => f.write_str("OnEveryChange"),
            Self::Debounced(d) => f.debug_tuple("Debounced").field(d).finish(),
            Self::Throttled(i) => f.debug_tuple("Throttled").field(i).finish(),
            Self::OnAction(types) => f.debug_tuple("OnAction").field(types).finish(),
            Self::Conditional(_) => f.write_str("Conditional(..)"),
            Self::Combined(members) => f.debug_tuple("Combined").field(members).finish(),
        }
    }
}

/// Textual form of the change-driven strategies, for configuration.
///
/// Accepted forms: `every_change`, `debounced:<ms>`, `throttled:<ms>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategySpec {
    EveryChange,
    Debounced(Duration),
    Throttled(Duration),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StrategySpecError {
    #[error("unknown persistence strategy {0:?}")]
    Unknown(String),

    #[error("invalid milliseconds in persistence strategy {0:?}")]
    InvalidMillis(String),
}

impl FromStr for StrategySpec {
    type Err = StrategySpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (kind, arg) = match s.split_once(':') {
            Some((kind, arg)) => (kind.trim(), Some(arg.trim())),
            None => (s, None),
        };

        let millis = |arg: Option<&str>| -> Result<Duration, StrategySpecError> {
            arg.and_then(|a| a.parse::<u64>().ok())
                .map(Duration::from_millis)
                .ok_or_else(|| StrategySpecError::InvalidMillis(s.to_string()))
        };

        match kind.to_ascii_lowercase().as_str() {
            "every_change" if arg.is_none() => Ok(Self::EveryChange),
            "debounced" => millis(arg).map(Self::Debounced),
            "throttled" => millis(arg).map(Self::Throttled),
            _ => Err(StrategySpecError::Unknown(s.to_string())),
        }
    }
}

impl fmt::Display for StrategySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EveryChange => f.write_str("every_change"),
            Self::Debounced(d) => write!(f, "debounced:{}", d.as_millis()),
            Self::Throttled(i) => write!(f, "throttled:{}", i.as_millis()),
        }
    }
}

impl<S> From<StrategySpec> for PersistenceStrategy<S> {
    fn from(spec: StrategySpec) -> Self {
        match spec {
            StrategySpec::EveryChange => Self::OnEveryChange,
            StrategySpec::Debounced(d) => Self::Debounced(d),
            StrategySpec::Throttled(i) => Self::Throttled(i),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Checkout;
    impl Action for Checkout {}

    #[derive(Debug)]
    struct Browse;
    impl Action for Browse {}

    #[test]
    fn test_triggers_on_matches_configured_types() {
        let strategy = PersistenceStrategy::<u32>::on_action::<Checkout>();

        assert!(strategy.triggers_on(ActionType::of::<Checkout>()));
        assert!(!strategy.triggers_on(ActionType::of::<Browse>()));
        assert!(!strategy.observes_changes());
    }

    #[test]
    fn test_combined_triggers_on_nested_on_action() {
        let strategy = PersistenceStrategy::<u32>::Combined(vec![
            PersistenceStrategy::Debounced(Duration::from_millis(100)),
            PersistenceStrategy::on_action::<Checkout>(),
        ]);

        assert!(strategy.triggers_on(ActionType::of::<Checkout>()));
        assert!(strategy.observes_changes());
        assert!(!PersistenceStrategy::<u32>::OnEveryChange.triggers_on(ActionType::of::<Checkout>()));
    }

    #[test]
    fn test_parse_strategy_spec() {
        assert_eq!("every_change".parse::<StrategySpec>(), Ok(StrategySpec::EveryChange));
        assert_eq!(
            " debounced: 250 ".parse::<StrategySpec>(),
            Ok(StrategySpec::Debounced(Duration::from_millis(250)))
        );
        assert_eq!(
            "THROTTLED:1000".parse::<StrategySpec>(),
            Ok(StrategySpec::Throttled(Duration::from_secs(1)))
        );
    }

    #[test]
    fn test_parse_strategy_spec_errors() {
        assert!(matches!(
            "sometimes".parse::<StrategySpec>(),
            Err(StrategySpecError::Unknown(_))
        ));
        assert!(matches!(
            "debounced".parse::<StrategySpec>(),
            Err(StrategySpecError::InvalidMillis(_))
        ));
        assert!(matches!(
            "throttled:soon".parse::<StrategySpec>(),
            Err(StrategySpecError::InvalidMillis(_))
        ));
        assert!(matches!(
            "every_change:5".parse::<StrategySpec>(),
            Err(StrategySpecError::Unknown(_))
        ));
    }

    #[test]
    fn test_spec_display_parses_back() {
        let spec = StrategySpec::Debounced(Duration::from_millis(75));
        assert_eq!(spec.to_string().parse::<StrategySpec>(), Ok(spec));
    }

    #[test]
    fn test_spec_converts_to_strategy() {
        let strategy: PersistenceStrategy<u32> =
            StrategySpec::Throttled(Duration::from_millis(10)).into();
        assert!(matches!(strategy, PersistenceStrategy::Throttled(d) if d == Duration::from_millis(10)));
    }

    #[test]
    fn test_conditional_debug_hides_closure() {
        let strategy = PersistenceStrategy::<u32>::conditional(|a, b| a > b);
        assert_eq!(format!("{:?}", strategy), "Conditional(..)");
        assert!(strategy.clone().observes_changes());
    }
}
