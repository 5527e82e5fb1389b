//! Filesystem-backed object store.
//!
//! Stands in for the cloud bucket: keys are paths under a root directory,
//! object metadata lives in a `<key>.meta.json` sidecar. Two well-known
//! keys matter to the OTA engine: `firmware/app-vN.bin` (new session
//! trigger) and `firmware/baseline.bin` (delta reference, replaced on a
//! successful COMPLETE).

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("io error on {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
}

/// Object metadata sidecar. Only the `signed` flag is contractual.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObjectMetadata {
    #[serde(default)]
    pub signed: bool,
}

#[derive(Clone)]
pub struct ObjectStore {
    root: PathBuf,
}

impl ObjectStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn object_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.meta.json"))
    }

    pub async fn get(&self, key: &str) -> Result<Vec<u8>, ObjectStoreError> {
        match fs::read(self.object_path(key)).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ObjectStoreError::NotFound(key.to_string()))
            }
            Err(e) => Err(ObjectStoreError::Io {
                key: key.to_string(),
                source: e,
            }),
        }
    }

    pub async fn put(
        &self,
        key: &str,
        data: &[u8],
        metadata: Option<&ObjectMetadata>,
    ) -> Result<(), ObjectStoreError> {
        let path = self.object_path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| ObjectStoreError::Io {
                key: key.to_string(),
                source: e,
            })?;
        }
        fs::write(&path, data).await.map_err(|e| ObjectStoreError::Io {
            key: key.to_string(),
            source: e,
        })?;
        if let Some(meta) = metadata {
            let json = serde_json::to_string(meta).unwrap_or_else(|_| "{}".into());
            if let Err(e) = fs::write(self.meta_path(key), json).await {
                warn!("Metadata write failed for {key}: {e}");
            }
        }
        Ok(())
    }

    /// Copy an object (and its metadata sidecar) to another key.
    pub async fn copy(&self, src_key: &str, dst_key: &str) -> Result<(), ObjectStoreError> {
        let data = self.get(src_key).await?;
        let meta = self.metadata(src_key).await;
        self.put(dst_key, &data, meta.as_ref()).await
    }

    pub async fn metadata(&self, key: &str) -> Option<ObjectMetadata> {
        let raw = fs::read_to_string(self.meta_path(key)).await.ok()?;
        serde_json::from_str(&raw).ok()
    }

    /// List keys under a prefix with their modification times. Sidecars are
    /// not objects.
    pub async fn list(&self, prefix: &str) -> Vec<(String, SystemTime)> {
        let dir = self.root.join(prefix);
        let mut out = Vec::new();
        let Ok(mut entries) = fs::read_dir(&dir).await else {
            return out;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(".meta.json") {
                continue;
            }
            let Ok(meta) = entry.metadata().await else { continue };
            if !meta.is_file() {
                continue;
            }
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            out.push((format!("{prefix}/{name}"), modified));
        }
        out.sort();
        out
    }
}

// ── New-image watcher ─────────────────────────────────────────────────────────

/// Tracks which firmware objects have been seen so the poll loop only fires
/// on genuinely new uploads. The first scan primes the set without firing,
/// so a process restart never replays old images.
pub struct FirmwareWatcher {
    prefix: String,
    seen: HashMap<String, SystemTime>,
    primed: bool,
}

impl FirmwareWatcher {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            seen: HashMap::new(),
            primed: false,
        }
    }

    /// Poll once; returns keys uploaded (or rewritten) since the last call.
    pub async fn poll(&mut self, objects: &ObjectStore) -> Vec<String> {
        let listing = objects.list(&self.prefix).await;
        let mut fresh = Vec::new();
        for (key, modified) in listing {
            if !key.ends_with(".bin") || key.ends_with("baseline.bin") {
                continue;
            }
            let is_new = match self.seen.get(&key) {
                Some(prev) => modified > *prev,
                None => true,
            };
            self.seen.insert(key.clone(), modified);
            if is_new && self.primed {
                fresh.push(key);
            }
        }
        self.primed = true;
        fresh
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> (tempfile::TempDir, ObjectStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ObjectStore::new(dir.path().to_path_buf());
        (dir, store)
    }

    #[tokio::test]
    async fn put_get_round_trip() {
        let (_dir, store) = store().await;
        store.put("firmware/app-v2.bin", b"abc", None).await.unwrap();
        assert_eq!(store.get("firmware/app-v2.bin").await.unwrap(), b"abc");
    }

    #[tokio::test]
    async fn missing_object_is_not_found() {
        let (_dir, store) = store().await;
        assert!(matches!(
            store.get("firmware/baseline.bin").await,
            Err(ObjectStoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn metadata_sidecar() {
        let (_dir, store) = store().await;
        store
            .put("firmware/app-v2.bin", b"abc", Some(&ObjectMetadata { signed: true }))
            .await
            .unwrap();
        assert!(store.metadata("firmware/app-v2.bin").await.unwrap().signed);
        assert!(store.metadata("firmware/app-v3.bin").await.is_none());
    }

    #[tokio::test]
    async fn copy_promotes_baseline() {
        let (_dir, store) = store().await;
        store.put("firmware/app-v2.bin", b"abc", None).await.unwrap();
        store
            .copy("firmware/app-v2.bin", "firmware/baseline.bin")
            .await
            .unwrap();
        assert_eq!(store.get("firmware/baseline.bin").await.unwrap(), b"abc");
    }

    #[tokio::test]
    async fn list_skips_sidecars() {
        let (_dir, store) = store().await;
        store
            .put("firmware/app-v2.bin", b"abc", Some(&ObjectMetadata { signed: true }))
            .await
            .unwrap();
        let keys: Vec<String> = store.list("firmware").await.into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["firmware/app-v2.bin".to_string()]);
    }

    #[tokio::test]
    async fn watcher_primes_then_fires() {
        let (_dir, store) = store().await;
        store.put("firmware/app-v1.bin", b"old", None).await.unwrap();

        let mut watcher = FirmwareWatcher::new("firmware");
        // priming scan: existing objects are not replayed
        assert!(watcher.poll(&store).await.is_empty());

        store.put("firmware/app-v2.bin", b"new", None).await.unwrap();
        assert_eq!(watcher.poll(&store).await, vec!["firmware/app-v2.bin".to_string()]);
        // no re-fire without a change
        assert!(watcher.poll(&store).await.is_empty());
    }

    #[tokio::test]
    async fn watcher_ignores_baseline_writes() {
        let (_dir, store) = store().await;
        let mut watcher = FirmwareWatcher::new("firmware");
        watcher.poll(&store).await;
        store.put("firmware/baseline.bin", b"base", None).await.unwrap();
        assert!(watcher.poll(&store).await.is_empty());
    }
}
