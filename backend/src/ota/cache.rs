//! Firmware image cache.
//!
//! ACKs arrive every few seconds during a transfer; refetching a 256 KB
//! image from the object store for every 15-byte chunk would dominate the
//! handler. Images are cached in-process keyed by (bucket, key) with a
//! bounded LRU, backed by a tmp-dir file that survives process restarts.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

use crate::objectstore::{ObjectStore, ObjectStoreError};

/// Images held in memory at once.
pub const DEFAULT_CACHE_CAPACITY: usize = 8;

#[derive(Default)]
struct CacheInner {
    map: HashMap<String, Arc<Vec<u8>>>,
    order: VecDeque<String>,
}

pub struct FirmwareCache {
    capacity: usize,
    tmp_dir: PathBuf,
    inner: Mutex<CacheInner>,
}

impl FirmwareCache {
    pub fn new(tmp_dir: PathBuf, capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            tmp_dir,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    /// Fetch an image through the cache layers: memory, tmp file, store.
    pub async fn load(
        &self,
        objects: &ObjectStore,
        bucket: &str,
        key: &str,
    ) -> Result<Arc<Vec<u8>>, ObjectStoreError> {
        let cache_key = format!("{bucket}/{key}");

        {
            let mut inner = self.inner.lock().await;
            if let Some(data) = inner.map.get(&cache_key).cloned() {
                inner.order.retain(|k| k != &cache_key);
                inner.order.push_back(cache_key);
                return Ok(data);
            }
        }

        let tmp_path = self.tmp_dir.join(sanitize(&cache_key));
        if let Ok(data) = fs::read(&tmp_path).await {
            debug!("Firmware from tmp: {} ({}B)", tmp_path.display(), data.len());
            let data = Arc::new(data);
            self.insert(cache_key, data.clone()).await;
            return Ok(data);
        }

        let data = Arc::new(objects.get(key).await?);
        debug!("Firmware fetched: {key} ({}B)", data.len());

        let _ = fs::create_dir_all(&self.tmp_dir).await;
        if let Err(e) = fs::write(&tmp_path, data.as_slice()).await {
            debug!("Firmware tmp write failed ({}): {e}", tmp_path.display());
        }
        self.insert(cache_key, data.clone()).await;
        Ok(data)
    }

    /// Drop a key from memory (e.g. after the object was overwritten).
    pub async fn invalidate(&self, bucket: &str, key: &str) {
        let cache_key = format!("{bucket}/{key}");
        let mut inner = self.inner.lock().await;
        inner.map.remove(&cache_key);
        inner.order.retain(|k| k != &cache_key);
        let tmp_path = self.tmp_dir.join(sanitize(&cache_key));
        let _ = std::fs::remove_file(tmp_path);
    }

    async fn insert(&self, cache_key: String, data: Arc<Vec<u8>>) {
        let mut inner = self.inner.lock().await;
        if inner.map.len() >= self.capacity {
            if let Some(evicted) = inner.order.pop_front() {
                inner.map.remove(&evicted);
            }
        }
        inner.map.insert(cache_key.clone(), data);
        inner.order.push_back(cache_key);
    }
}

fn sanitize(key: &str) -> String {
    key.replace(['/', '\\'], "_")
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup() -> (tempfile::TempDir, ObjectStore, FirmwareCache) {
        let dir = tempfile::tempdir().unwrap();
        let objects = ObjectStore::new(dir.path().join("bucket"));
        let cache = FirmwareCache::new(dir.path().join("tmp"), 2);
        (dir, objects, cache)
    }

    #[tokio::test]
    async fn caches_after_first_fetch() {
        let (_dir, objects, cache) = setup().await;
        objects.put("firmware/app-v1.bin", b"image", None).await.unwrap();

        let a = cache.load(&objects, "ota", "firmware/app-v1.bin").await.unwrap();
        // delete the object; cache must still serve it
        let b = cache.load(&objects, "ota", "firmware/app-v1.bin").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_slice(), b"image");
    }

    #[tokio::test]
    async fn missing_image_propagates_not_found() {
        let (_dir, objects, cache) = setup().await;
        assert!(cache.load(&objects, "ota", "firmware/nope.bin").await.is_err());
    }

    #[tokio::test]
    async fn lru_eviction_is_bounded() {
        let (_dir, objects, cache) = setup().await;
        for i in 0..4 {
            let key = format!("firmware/app-v{i}.bin");
            objects.put(&key, format!("img{i}").as_bytes(), None).await.unwrap();
            cache.load(&objects, "ota", &key).await.unwrap();
        }
        let inner = cache.inner.lock().await;
        assert!(inner.map.len() <= 2);
    }

    #[tokio::test]
    async fn invalidate_forces_refetch() {
        let (_dir, objects, cache) = setup().await;
        objects.put("firmware/app-v1.bin", b"old", None).await.unwrap();
        cache.load(&objects, "ota", "firmware/app-v1.bin").await.unwrap();

        objects.put("firmware/app-v1.bin", b"new!", None).await.unwrap();
        cache.invalidate("ota", "firmware/app-v1.bin").await;
        let data = cache.load(&objects, "ota", "firmware/app-v1.bin").await.unwrap();
        assert_eq!(data.as_slice(), b"new!");
    }
}
