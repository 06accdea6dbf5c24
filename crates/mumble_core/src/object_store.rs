/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::change_journal::ChangeJournal;
use crate::error::{StageError, StageResult};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use mumble_protocol::{ObjectCreated, ObjectKey};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Durable blob storage partitioned into zones by key prefix.
///
/// A `put` only succeeds once its [`ObjectCreated`] is in the change journal.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &ObjectKey, bytes: &[u8]) -> Result<()>;
    async fn get(&self, key: &ObjectKey) -> Result<Option<Vec<u8>>>;
}

async fn journal_put(journal: &ChangeJournal, key: &ObjectKey, size: usize) -> Result<()> {
    journal
        .append(&ObjectCreated {
            zone: Some(key.zone),
            key: key.key.clone(),
            size: size as u64,
        })
        .await
        .with_context(|| format!("journal write of {key}"))?;
    Ok(())
}

fn check_zone(key: &ObjectKey) -> Result<()> {
    if !key.key.starts_with(key.zone.prefix()) {
        return Err(anyhow!("key {} is outside zone {}", key.key, key.zone));
    }
    Ok(())
}

/// Object store rooted at a local directory; keys map to relative paths.
pub struct FsObjectStore {
    root: PathBuf,
    journal: Arc<ChangeJournal>,
}

impl FsObjectStore {
    pub fn open(root: impl AsRef<Path>, journal: Arc<ChangeJournal>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("create objects dir: {}", root.display()))?;
        Ok(Self { root, journal })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let rel = Path::new(key);
        if rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(anyhow!("invalid object key: {key}"));
        }
        Ok(self.root.join(rel))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, key: &ObjectKey, bytes: &[u8]) -> Result<()> {
        check_zone(key)?;
        let path = self.path_for(&key.key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create dir {}", parent.display()))?;
        }
        // Write then rename so readers never see a torn object.
        let mut tmp = path.clone().into_os_string();
        tmp.push(".partial");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, bytes)
            .await
            .with_context(|| format!("write object {}", key))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("commit object {}", key))?;
        journal_put(&self.journal, key, bytes.len()).await
    }

    async fn get(&self, key: &ObjectKey) -> Result<Option<Vec<u8>>> {
        check_zone(key)?;
        let path = self.path_for(&key.key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("read object {}", key)),
        }
    }
}

/// Process-local object store, used for embedding and tests.
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    journal: Arc<ChangeJournal>,
}

impl MemoryObjectStore {
    pub fn new(journal: Arc<ChangeJournal>) -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            journal,
        }
    }

    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        let mut keys: Vec<String> = objects
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &ObjectKey, bytes: &[u8]) -> Result<()> {
        check_zone(key)?;
        self.objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.key.clone(), bytes.to_vec());
        journal_put(&self.journal, key, bytes.len()).await
    }

    async fn get(&self, key: &ObjectKey) -> Result<Option<Vec<u8>>> {
        check_zone(key)?;
        Ok(self
            .objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key.key)
            .cloned())
    }
}

pub async fn load_json(store: &dyn ObjectStore, key: &ObjectKey) -> StageResult<Value> {
    let bytes = store
        .get(key)
        .await
        .map_err(StageError::from_anyhow)?
        .ok_or_else(|| StageError::NotFound(format!("no such object: {key}")))?;
    Ok(serde_json::from_slice(&bytes)?)
}

pub async fn save_json(store: &dyn ObjectStore, key: &ObjectKey, value: &Value) -> StageResult<()> {
    let bytes = serde_json::to_vec(value)?;
    store.put(key, &bytes).await.map_err(StageError::from_anyhow)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mumble_protocol::Zone;

    fn journal(dir: &tempfile::TempDir) -> Arc<ChangeJournal> {
        Arc::new(ChangeJournal::open(dir.path().join("journal.sqlite")).unwrap())
    }

    #[tokio::test]
    async fn fs_store_roundtrip_and_journal() {
        let dir = tempfile::tempdir().unwrap();
        let j = journal(&dir);
        let store = FsObjectStore::open(dir.path().join("objects"), j.clone()).unwrap();
        let key = ObjectKey::new(Zone::Outbox, "outbox/users/alice/a.json");
        assert!(store.get(&key).await.unwrap().is_none());
        store.put(&key, b"{\"x\":1}").await.unwrap();
        assert_eq!(store.get(&key).await.unwrap().unwrap(), b"{\"x\":1}");
        let entries = j.pending(0, 10).await.unwrap();
        assert_eq!(entries.len(), 1);
        let n = &entries[0].created;
        assert_eq!(n.key, "outbox/users/alice/a.json");
        assert_eq!(n.zone, Some(Zone::Outbox));
        assert_eq!(n.size, 7);
    }

    #[tokio::test]
    async fn writes_through_another_handle_reach_the_journal() {
        let dir = tempfile::tempdir().unwrap();
        let reader_journal = journal(&dir);
        let _reader = FsObjectStore::open(dir.path().join("objects"), reader_journal.clone()).unwrap();
        let writer = FsObjectStore::open(dir.path().join("objects"), journal(&dir)).unwrap();

        let key = ObjectKey::new(Zone::StagingOutbox, "staging/users/alice/raw1");
        writer.put(&key, b"{}").await.unwrap();

        let entries = reader_journal.pending(0, 10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].created.key, "staging/users/alice/raw1");
    }

    #[tokio::test]
    async fn rejects_keys_outside_zone_or_escaping_root() {
        let dir = tempfile::tempdir().unwrap();
        let j = journal(&dir);
        let store = FsObjectStore::open(dir.path().join("objects"), j.clone()).unwrap();
        let wrong_zone = ObjectKey::new(Zone::Inbox, "outbox/users/alice/a.json");
        assert!(store.put(&wrong_zone, b"{}").await.is_err());
        let escaping = ObjectKey::new(Zone::Inbox, "inbox/../../etc/passwd");
        assert!(store.put(&escaping, b"{}").await.is_err());
        assert_eq!(j.backlog().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn missing_object_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryObjectStore::new(journal(&dir));
        let key = ObjectKey::new(Zone::Objects, "objects/users/alice/posts/x.json");
        let err = load_json(&store, &key).await.unwrap_err();
        assert!(matches!(err, StageError::NotFound(_)));
        store.put(&key, b"not json").await.unwrap();
        let err = load_json(&store, &key).await.unwrap_err();
        assert!(matches!(err, StageError::MalformedInput(_)));
    }
}
