use std::{collections::HashMap, io, path::PathBuf, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shared::domain::SessionPersistence;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

const PREFERENCES_FILE: &str = "preferences.toml";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("session storage I/O failed at '{path}': {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("failed to encode preferences: {0}")]
    Encode(String),
}

#[async_trait]
pub trait SessionStorage: Send + Sync {
    async fn get_item(&self, key: &str) -> Result<Option<String>, StorageError>;
    async fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError>;
    async fn remove_item(&self, key: &str) -> Result<(), StorageError>;
}

#[derive(Default)]
pub struct MemorySessionStorage {
    items: Mutex<HashMap<String, String>>,
}

impl MemorySessionStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStorage for MemorySessionStorage {
    async fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.items.lock().await.get(key).cloned())
    }

    async fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.items
            .lock()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        self.items.lock().await.remove(key);
        Ok(())
    }
}

pub struct FileSessionStorage {
    root: PathBuf,
}

impl FileSessionStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let file_name: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.root.join(format!("{file_name}.json"))
    }
}

#[async_trait]
impl SessionStorage for FileSessionStorage {
    async fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        let path = self.path_for(key);
        match tokio::fs::read_to_string(&path).await {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StorageError::Io { path, source }),
        }
    }

    async fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|source| StorageError::Io {
                path: self.root.clone(),
                source,
            })?;
        let path = self.path_for(key);
        tokio::fs::write(&path, value)
            .await
            .map_err(|source| StorageError::Io { path, source })
    }

    async fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        let path = self.path_for(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StorageError::Io { path, source }),
        }
    }
}

#[derive(Clone)]
pub struct SessionStore {
    persistence: SessionPersistence,
    persistent: Arc<dyn SessionStorage>,
    ephemeral: Arc<dyn SessionStorage>,
}

impl SessionStore {
    pub fn new(
        persistence: SessionPersistence,
        persistent: Arc<dyn SessionStorage>,
        ephemeral: Arc<dyn SessionStorage>,
    ) -> Self {
        Self {
            persistence,
            persistent,
            ephemeral,
        }
    }

    pub fn in_memory(persistence: SessionPersistence) -> Self {
        Self::new(
            persistence,
            Arc::new(MemorySessionStorage::new()),
            Arc::new(MemorySessionStorage::new()),
        )
    }

    pub fn persistence(&self) -> SessionPersistence {
        self.persistence
    }

    fn active(&self) -> &dyn SessionStorage {
        match self.persistence {
            SessionPersistence::Persistent => self.persistent.as_ref(),
            SessionPersistence::Ephemeral => self.ephemeral.as_ref(),
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.active().get_item(key).await
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        debug!(persistence = ?self.persistence, key, "session store: write");
        if self.persistence == SessionPersistence::Ephemeral {
            self.persistent.remove_item(key).await?;
        }
        self.active().set_item(key, value).await
    }

    pub async fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.persistent.remove_item(key).await?;
        self.ephemeral.remove_item(key).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct Preferences {
    #[serde(default = "default_remember_me")]
    remember_me: bool,
}

fn default_remember_me() -> bool {
    true
}

pub struct PreferenceStore {
    path: PathBuf,
}

impl PreferenceStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            path: data_dir.into().join(PREFERENCES_FILE),
        }
    }

    /// Anything but an explicit `false` means remember.
    pub async fn persistence(&self) -> Result<SessionPersistence, StorageError> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(SessionPersistence::Persistent)
            }
            Err(source) => {
                return Err(StorageError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        let remember_me = toml::from_str::<Preferences>(&raw)
            .map(|prefs| prefs.remember_me)
            .unwrap_or(true);
        Ok(SessionPersistence::from_remember_me(remember_me))
    }

    pub async fn set_persistence(
        &self,
        persistence: SessionPersistence,
    ) -> Result<(), StorageError> {
        let raw = toml::to_string(&Preferences {
            remember_me: persistence.remember_me(),
        })
        .map_err(|err| StorageError::Encode(err.to_string()))?;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| StorageError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }
        tokio::fs::write(&self.path, raw)
            .await
            .map_err(|source| StorageError::Io {
                path: self.path.clone(),
                source,
            })
    }
}

#[cfg(test)]
#[path = "tests/session_storage_tests.rs"]
mod tests;
