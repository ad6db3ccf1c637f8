//! Store lifecycle notifications.
//!
//! Listeners are notified in registration order. Notification is
//! best-effort: a listener that returns `Err` or panics is logged and the
//! remaining listeners still run.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::error::panic_message;
use crate::logger::Logger;

/// Observer of store lifecycle transitions.
///
/// Every method defaults to a no-op, so implementors override only what
/// they care about.
///
/// # Example
///
/// ```ignore
/// struct Splash;
///
/// impl LifecycleListener for Splash {
///     fn on_restoration_completed(&self, restored: bool) -> anyhow::Result<()> {
///         if !restored {
///             show_onboarding()?;
///         }
///         Ok(())
///     }
/// }
/// ```
pub trait LifecycleListener: Send + Sync + 'static {
    fn on_store_created(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_store_destroyed(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_restoration_started(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// `restored` is true when a stored snapshot was loaded and applied.
    fn on_restoration_completed(&self, restored: bool) -> anyhow::Result<()> {
        let _ = restored;
        Ok(())
    }
}

/// Lifecycle transition being announced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    StoreCreated,
    StoreDestroyed,
    RestorationStarted,
    RestorationCompleted { restored: bool },
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleEvent::StoreCreated => f.write_str("store created"),
            LifecycleEvent::StoreDestroyed => f.write_str("store destroyed"),
            LifecycleEvent::RestorationStarted => f.write_str("restoration started"),
            LifecycleEvent::RestorationCompleted { restored } => {
                write!(f, "restoration completed (restored: {})", restored)
            }
        }
    }
}

/// Ordered set of lifecycle listeners.
#[derive(Clone)]
pub(crate) struct Lifecycle {
    listeners: Arc<[Arc<dyn LifecycleListener>]>,
    logger: Logger,
}

impl Lifecycle {
    pub(crate) fn new(listeners: Vec<Arc<dyn LifecycleListener>>, logger: Logger) -> Self {
        Self {
            listeners: listeners.into(),
            logger,
        }
    }

    /// Notify every listener of `event`, isolating failures.
    pub(crate) fn notify(&self, event: LifecycleEvent) {
        for (index, listener) in self.listeners.iter().enumerate() {
            let result = catch_unwind(AssertUnwindSafe(|| match event {
                LifecycleEvent::StoreCreated => listener.on_store_created(),
                LifecycleEvent::StoreDestroyed => listener.on_store_destroyed(),
                LifecycleEvent::RestorationStarted => listener.on_restoration_started(),
                LifecycleEvent::RestorationCompleted { restored } => {
                    listener.on_restoration_completed(restored)
                }
            }));

            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => self.logger.warn(
                    "lifecycle listener {index} failed on {event}: {error}",
                    &[&index, &event, &format!("{:#}", e)],
                ),
                Err(panic) => self.logger.error(
                    "lifecycle listener {index} panicked on {event}: {panic}",
                    &[&index, &event, &panic_message(panic.as_ref())],
                ),
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.listeners.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        tag: &'static str,
        seen: Arc<Mutex<Vec<String>>>,
    }

    impl LifecycleListener for Recorder {
        fn on_store_created(&self) -> anyhow::Result<()> {
            self.seen.lock().unwrap().push(format!("{}:created", self.tag));
            Ok(())
        }

        fn on_restoration_completed(&self, restored: bool) -> anyhow::Result<()> {
            self.seen
                .lock()
                .unwrap()
                .push(format!("{}:restored={}", self.tag, restored));
            Ok(())
        }
    }

    struct Failing;

    impl LifecycleListener for Failing {
        fn on_store_created(&self) -> anyhow::Result<()> {
            anyhow::bail!("listener refused")
        }
    }

    struct Panicking;

    impl LifecycleListener for Panicking {
        fn on_store_created(&self) -> anyhow::Result<()> {
            panic!("listener exploded")
        }
    }

    struct Silent;
    impl LifecycleListener for Silent {}

    #[test]
    fn test_listeners_notified_in_registration_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let lifecycle = Lifecycle::new(
            vec![
                Arc::new(Recorder {
                    tag: "a",
                    seen: seen.clone(),
                }),
                Arc::new(Recorder {
                    tag: "b",
                    seen: seen.clone(),
                }),
            ],
            Logger::default(),
        );

        lifecycle.notify(LifecycleEvent::StoreCreated);
        lifecycle.notify(LifecycleEvent::RestorationCompleted { restored: true });

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["a:created", "b:created", "a:restored=true", "b:restored=true"]
        );
    }

    #[test]
    fn test_failing_and_panicking_listeners_do_not_stop_others() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let lifecycle = Lifecycle::new(
            vec![
                Arc::new(Failing),
                Arc::new(Panicking),
                Arc::new(Recorder {
                    tag: "last",
                    seen: seen.clone(),
                }),
            ],
            Logger::default(),
        );

        lifecycle.notify(LifecycleEvent::StoreCreated);

        assert_eq!(*seen.lock().unwrap(), vec!["last:created"]);
        assert_eq!(lifecycle.len(), 3);
    }

    #[test]
    fn test_default_methods_are_noops() {
        let lifecycle = Lifecycle::new(vec![Arc::new(Silent)], Logger::default());
        lifecycle.notify(LifecycleEvent::StoreDestroyed);
        lifecycle.notify(LifecycleEvent::RestorationStarted);
    }

    #[test]
    fn test_event_display() {
        assert_eq!(LifecycleEvent::StoreCreated.to_string(), "store created");
        assert!(LifecycleEvent::RestorationCompleted { restored: false }
            .to_string()
            .contains("false"));
    }
}
