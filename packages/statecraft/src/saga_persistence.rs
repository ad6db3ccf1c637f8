//! Saga instance storage.
//!
//! Persistence for sagas is keyed by lifecycle rather than by state stream:
//! every committed `Continue` is offered to the [`SagaPersistencePolicy`],
//! and every `Complete` removes the stored instance (cancelling any save
//! still waiting on a debounce).
//!
//! Writes for one instance id are serialized: a save that has already
//! started finishes before the removal runs, so a completed instance is
//! never written back.
//!
//! At startup all stored ids can be listed and loaded individually, which
//! is how [`SagaEngine::recover`](crate::SagaEngine::recover) rebuilds live
//! instances.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::error::SagaError;
use crate::logger::Logger;
use crate::saga::{SagaInstance, SagaState};

/// Storage collaborator for saga instances.
#[async_trait]
pub trait SagaStorage<T>: Send + Sync + 'static {
    async fn save(&self, id: &str, instance: &SagaInstance<T>) -> anyhow::Result<()>;

    async fn load(&self, id: &str) -> anyhow::Result<Option<SagaInstance<T>>>;

    async fn remove(&self, id: &str) -> anyhow::Result<()>;

    async fn list_all_ids(&self) -> anyhow::Result<HashSet<String>>;
}

/// When to write a live instance.
pub enum SagaPersistencePolicy<T> {
    /// After every committed `Continue`.
    EveryChange,
    /// After an instance has been quiet this long.
    Debounced(Duration),
    /// When the new state satisfies the predicate.
    OnCheckpoint(Arc<dyn Fn(&T) -> bool + Send + Sync>),
    /// Never while running; completion still removes the stored copy.
    OnCompletion,
    /// First member that fires wins.
    Combined(Vec<SagaPersistencePolicy<T>>),
}

impl<T> SagaPersistencePolicy<T> {
    pub fn on_checkpoint<F>(predicate: F) -> Self
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        Self::OnCheckpoint(Arc::new(predicate))
    }

    fn decide(&self, state: &T) -> Option<Duration> {
        match self {
            Self::EveryChange => Some(Duration::ZERO),
            Self::Debounced(delay) => Some(*delay),
            Self::OnCheckpoint(predicate) => predicate(state).then_some(Duration::ZERO),
            Self::OnCompletion => None,
            Self::Combined(members) => members.iter().find_map(|m| m.decide(state)),
        }
    }
}

impl<T> fmt::Debug for SagaPersistencePolicy<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EveryChange => f.write_str("EveryChange"),
            Self::Debounced(d) => f.debug_tuple("Debounced").field(d).finish(),
            Self::OnCheckpoint(_) => f.write_str("OnCheckpoint(..)"),
            Self::OnCompletion => f.write_str("OnCompletion"),
            Self::Combined(members) => f.debug_tuple("Combined").field(members).finish(),
        }
    }
}

/// Applies a policy to one saga's instances.
pub(crate) struct SagaPersister<T: SagaState> {
    saga: String,
    storage: Arc<dyn SagaStorage<T>>,
    policy: SagaPersistencePolicy<T>,
    pending: Arc<DashMap<String, (u64, JoinHandle<()>)>>,
    writes: DashMap<String, Arc<Mutex<()>>>,
    generation: AtomicU64,
    logger: Logger,
}

impl<T: SagaState> SagaPersister<T> {
    pub(crate) fn new(
        saga: impl Into<String>,
        storage: Arc<dyn SagaStorage<T>>,
        policy: SagaPersistencePolicy<T>,
        logger: Logger,
    ) -> Self {
        Self {
            saga: saga.into(),
            storage,
            policy,
            pending: Arc::new(DashMap::new()),
            writes: DashMap::new(),
            generation: AtomicU64::new(0),
            logger,
        }
    }

    /// An instance was created or continued.
    pub(crate) async fn on_continue(&self, instance: &SagaInstance<T>) {
        match self.policy.decide(&instance.state) {
            None => {}
            Some(delay) if delay.is_zero() => {
                self.cancel(&instance.id);
                self.save(instance).await;
            }
            Some(delay) => self.schedule(instance.clone(), delay),
        }
    }

    /// An instance completed.
    pub(crate) async fn on_complete(&self, id: &str) {
        self.cancel(id);
        let lock = self.write_lock(id);
        let _write = lock.lock().await;
        if let Err(e) = self.storage.remove(id).await {
            self.report(e);
        }
        self.writes.remove(id);
    }

    /// Every stored instance. Ids that fail to load are logged and skipped.
    pub(crate) async fn load_all(&self) -> Result<Vec<SagaInstance<T>>, SagaError> {
        let ids = self.storage.list_all_ids().await.map_err(|cause| SagaError::Storage {
            saga: self.saga.clone(),
            cause,
        })?;

        let mut instances = Vec::with_capacity(ids.len());
        for id in ids {
            match self.storage.load(&id).await {
                Ok(Some(instance)) => instances.push(instance),
                Ok(None) => self
                    .logger
                    .warn("listed instance {id} has vanished", &[&id]),
                Err(e) => self.report(e),
            }
        }
        Ok(instances)
    }

    pub(crate) fn shutdown(&self) {
        self.pending.retain(|_, (_, handle)| {
            handle.abort();
            false
        });
    }

    async fn save(&self, instance: &SagaInstance<T>) {
        let lock = self.write_lock(&instance.id);
        let _write = lock.lock().await;
        match self.storage.save(&instance.id, instance).await {
            Ok(()) => self
                .logger
                .trace("saved instance {id}", &[&instance.id]),
            Err(e) => self.report(e),
        }
    }

    fn schedule(&self, instance: SagaInstance<T>, delay: Duration) {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let id = instance.id.clone();
        let storage = self.storage.clone();
        let pending = self.pending.clone();
        let logger = self.logger.clone();
        let saga = self.saga.clone();
        let lock = self.write_lock(&id);

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _write = lock.lock().await;
            // Once claimed, nothing aborts this task; completion waits on the lock.
            if pending
                .remove_if(&instance.id, |_, (scheduled, _)| *scheduled == generation)
                .is_none()
            {
                return;
            }
            if let Err(cause) = storage.save(&instance.id, &instance).await {
                let error = SagaError::Storage { saga, cause };
                logger.error("{error}", &[&error]);
            }
        });

        if let Some((_, previous)) = self.pending.insert(id, (generation, handle)) {
            previous.abort();
        }
    }

    fn write_lock(&self, id: &str) -> Arc<Mutex<()>> {
        self.writes.entry(id.to_string()).or_default().clone()
    }

    fn cancel(&self, id: &str) {
        if let Some((_, (_, handle))) = self.pending.remove(id) {
            handle.abort();
        }
    }

    fn report(&self, cause: anyhow::Error) {
        let error = SagaError::Storage {
            saga: self.saga.clone(),
            cause,
        };
        self.logger.error("{error}", &[&error]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::InMemorySagaStorage;

    #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Progress {
        step: u32,
    }

    fn persister(
        storage: Arc<InMemorySagaStorage<Progress>>,
        policy: SagaPersistencePolicy<Progress>,
    ) -> SagaPersister<Progress> {
        SagaPersister::new("progress", storage, policy, Logger::default())
    }

    #[test]
    fn test_policy_decisions() {
        let p = Progress { step: 3 };

        assert_eq!(
            SagaPersistencePolicy::<Progress>::EveryChange.decide(&p),
            Some(Duration::ZERO)
        );
        assert_eq!(SagaPersistencePolicy::<Progress>::OnCompletion.decide(&p), None);
        assert_eq!(
            SagaPersistencePolicy::on_checkpoint(|p: &Progress| p.step % 2 == 0).decide(&p),
            None
        );

        let combined = SagaPersistencePolicy::Combined(vec![
            SagaPersistencePolicy::on_checkpoint(|p: &Progress| p.step == 3),
            SagaPersistencePolicy::Debounced(Duration::from_secs(1)),
        ]);
        assert_eq!(combined.decide(&p), Some(Duration::ZERO));
        assert_eq!(
            combined.decide(&Progress { step: 4 }),
            Some(Duration::from_secs(1))
        );
    }

    #[tokio::test]
    async fn test_every_change_saves_and_complete_removes() {
        let storage = Arc::new(InMemorySagaStorage::new());
        let persister = persister(storage.clone(), SagaPersistencePolicy::EveryChange);
        let instance = SagaInstance::new("progress", Progress { step: 1 });

        persister.on_continue(&instance).await;
        assert_eq!(storage.get(&instance.id).unwrap().state.step, 1);

        persister.on_complete(&instance.id).await;
        assert!(storage.get(&instance.id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounced_saves_last_state_per_instance() {
        let storage = Arc::new(InMemorySagaStorage::new());
        let persister = persister(
            storage.clone(),
            SagaPersistencePolicy::Debounced(Duration::from_millis(100)),
        );
        let first = SagaInstance::new("progress", Progress { step: 1 });
        let other = SagaInstance::new("progress", Progress { step: 10 });

        persister.on_continue(&first).await;
        persister.on_continue(&other).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        persister
            .on_continue(&first.clone().advance(Progress { step: 2 }))
            .await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(storage.get(&first.id).unwrap().state.step, 2);
        assert_eq!(storage.get(&other.id).unwrap().state.step, 10);
        assert_eq!(storage.save_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_complete_cancels_pending_debounce() {
        let storage = Arc::new(InMemorySagaStorage::new());
        let persister = persister(
            storage.clone(),
            SagaPersistencePolicy::Debounced(Duration::from_millis(100)),
        );
        let instance = SagaInstance::new("progress", Progress { step: 1 });

        persister.on_continue(&instance).await;
        persister.on_complete(&instance.id).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(storage.get(&instance.id).is_none());
        assert_eq!(storage.save_count(), 0);
    }

    /// Storage whose saves take a while to land.
    struct SlowSaves {
        inner: Arc<InMemorySagaStorage<Progress>>,
        delay: Duration,
    }

    #[async_trait]
    impl SagaStorage<Progress> for SlowSaves {
        async fn save(&self, id: &str, instance: &SagaInstance<Progress>) -> anyhow::Result<()> {
            tokio::time::sleep(self.delay).await;
            self.inner.save(id, instance).await
        }

        async fn load(&self, id: &str) -> anyhow::Result<Option<SagaInstance<Progress>>> {
            self.inner.load(id).await
        }

        async fn remove(&self, id: &str) -> anyhow::Result<()> {
            self.inner.remove(id).await
        }

        async fn list_all_ids(&self) -> anyhow::Result<HashSet<String>> {
            self.inner.list_all_ids().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_complete_waits_for_save_in_flight() {
        let storage = Arc::new(InMemorySagaStorage::new());
        let slow = Arc::new(SlowSaves {
            inner: storage.clone(),
            delay: Duration::from_millis(50),
        });
        let persister = SagaPersister::new(
            "progress",
            slow,
            SagaPersistencePolicy::Debounced(Duration::from_millis(100)),
            Logger::default(),
        );
        let instance = SagaInstance::new("progress", Progress { step: 1 });

        persister.on_continue(&instance).await;
        // The debounce has fired and the save is still being written.
        tokio::time::sleep(Duration::from_millis(120)).await;
        persister.on_complete(&instance.id).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(storage.save_count(), 1);
        assert!(storage.get(&instance.id).is_none());
        assert!(persister.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_on_completion_never_writes_live_state() {
        let storage = Arc::new(InMemorySagaStorage::new());
        let persister = persister(storage.clone(), SagaPersistencePolicy::OnCompletion);
        let instance = SagaInstance::new("progress", Progress { step: 1 });

        persister.on_continue(&instance).await;
        assert_eq!(storage.save_count(), 0);
    }

    #[tokio::test]
    async fn test_load_all_returns_every_stored_instance() {
        let storage = Arc::new(InMemorySagaStorage::new());
        let a = SagaInstance::new("progress", Progress { step: 1 });
        let b = SagaInstance::new("progress", Progress { step: 2 });
        storage.save(&a.id, &a).await.unwrap();
        storage.save(&b.id, &b).await.unwrap();

        let persister = persister(storage.clone(), SagaPersistencePolicy::EveryChange);
        let mut loaded = persister.load_all().await.unwrap();
        loaded.sort_by_key(|i| i.state.step);

        assert_eq!(loaded, vec![a, b]);
    }

    #[tokio::test]
    async fn test_load_all_reports_listing_failure() {
        let storage = Arc::new(InMemorySagaStorage::<Progress>::new());
        storage.fail(true);

        let persister = persister(storage, SagaPersistencePolicy::EveryChange);
        let err = persister.load_all().await.unwrap_err();

        assert!(matches!(err, SagaError::Storage { ref saga, .. } if saga == "progress"));
    }
}
