//! JSON file storage for the shop snapshot and checkout sagas.

use std::collections::HashSet;
use std::io::ErrorKind;
use std::marker::PhantomData;
use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use statecraft::{SagaInstance, SagaStorage, Storage};

/// One snapshot per file, written via a temp file and rename.
pub struct JsonFileStorage<S> {
    path: PathBuf,
    _state: PhantomData<fn() -> S>,
}

impl<S> JsonFileStorage<S> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _state: PhantomData,
        }
    }
}

#[async_trait]
impl<S> Storage<S> for JsonFileStorage<S>
where
    S: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn save(&self, state: &S) -> Result<()> {
        let json = serde_json::to_vec_pretty(state)?;
        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    async fn load(&self) -> Result<Option<S>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(
                serde_json::from_slice(&bytes)
                    .with_context(|| format!("decoding {}", self.path.display()))?,
            )),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn clear(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    async fn exists(&self) -> Result<bool> {
        Ok(tokio::fs::try_exists(&self.path).await?)
    }
}

/// Saga instances as `<dir>/<id>.json`.
pub struct JsonDirSagaStorage<T> {
    dir: PathBuf,
    _state: PhantomData<fn() -> T>,
}

impl<T> JsonDirSagaStorage<T> {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            _state: PhantomData,
        }
    }

    fn path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }
}

#[async_trait]
impl<T> SagaStorage<T> for JsonDirSagaStorage<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn save(&self, id: &str, instance: &SagaInstance<T>) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let json = serde_json::to_vec_pretty(instance)?;
        tokio::fs::write(self.path(id), json).await?;
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<SagaInstance<T>>> {
        match tokio::fs::read(self.path(id)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove(&self, id: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path(id)).await {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    async fn list_all_ids(&self) -> Result<HashSet<String>> {
        let mut ids = HashSet::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    ids.insert(stem.to_string());
                }
            }
        }
        Ok(ids)
    }
}
