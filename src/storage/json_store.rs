use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::storage::KeyValueStore;

/// File-backed store. All entries live in one JSON object, rewritten atomically
/// (write to a temp file, then rename) on every mutation.
pub struct JsonFileStore {
    path: PathBuf,
    lock: RwLock<()>,
}

impl JsonFileStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: RwLock::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_entries(&self) -> Result<BTreeMap<String, String>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let data = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read store file: {}", self.path.display()))?;
        if data.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&data)
            .with_context(|| format!("Failed to parse store file: {}", self.path.display()))
    }

    async fn write_entries(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp_path = self.path.with_extension("json.tmp");
        let data = serde_json::to_string_pretty(entries)?;
        tokio::fs::write(&tmp_path, &data).await?;
        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .with_context(|| format!("Failed to write store file: {}", self.path.display()))?;

        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for JsonFileStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let _lock = self.lock.read().await;
        Ok(self.read_entries().await?.remove(key))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let _lock = self.lock.write().await;
        let mut entries = self.read_entries().await?;
        entries.insert(key.to_string(), value.to_string());
        self.write_entries(&entries).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let _lock = self.lock.write().await;
        let mut entries = self.read_entries().await?;
        if entries.remove(key).is_none() {
            return Ok(false);
        }
        self.write_entries(&entries).await?;
        Ok(true)
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let _lock = self.lock.read().await;
        Ok(self
            .read_entries()
            .await?
            .into_keys()
            .filter(|k| k.starts_with(prefix))
            .collect())
    }
}
