//! State store: devices, per-device state snapshots, and the event log.
//!
//! One JSON snapshot on disk, loaded at startup and persisted after every
//! mutation. The access methods are the store contract the rest of the
//! backend codes against:
//!
//! - per-device atomic partial updates (`update_state` takes a closure over
//!   the single row; the store lock serialises writers),
//! - read-modify-write for the OTA session through the same row,
//! - a bounded scan over active devices for fan-out,
//! - TTL pruning on the event log (90 days),
//! - strictly monotonic per-device event sort keys.
//!
//! A missing or corrupt snapshot degrades to an empty store with a warning —
//! the fleet re-registers itself on the next uplinks.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs;
use tokio::sync::RwLock;
use tracing::{info, warn};

use serde::{Deserialize, Serialize};

use crate::clock::{now_unix, unix_ms_to_mt};
use crate::state::{DeviceRecord, DeviceState, DeviceStatus, EventRecord};

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreData {
    devices: BTreeMap<String, DeviceRecord>,
    device_state: BTreeMap<String, DeviceState>,
    /// device_id → sort key → event
    events: BTreeMap<String, BTreeMap<String, EventRecord>>,
}

/// Thread-safe store handle. Clones share the same data.
#[derive(Clone)]
pub struct Store {
    data: Arc<RwLock<StoreData>>,
    path: Option<PathBuf>,
}

impl Store {
    /// Volatile store for tests and local experiments.
    pub fn in_memory() -> Self {
        Self {
            data: Arc::new(RwLock::new(StoreData::default())),
            path: None,
        }
    }

    /// Open (or create) the snapshot at `path`.
    pub async fn open(path: &Path) -> Self {
        let data = match fs::read_to_string(path).await {
            Ok(raw) => match serde_json::from_str::<StoreData>(&raw) {
                Ok(data) => {
                    info!(
                        "Loaded store from {} ({} devices, {} state rows)",
                        path.display(),
                        data.devices.len(),
                        data.device_state.len()
                    );
                    data
                }
                Err(e) => {
                    warn!("Failed to parse {}: {e}, starting empty", path.display());
                    StoreData::default()
                }
            },
            Err(_) => {
                info!("No store snapshot at {}, starting empty", path.display());
                StoreData::default()
            }
        };
        Self {
            data: Arc::new(RwLock::new(data)),
            path: Some(path.to_path_buf()),
        }
    }

    /// Persist the snapshot. Failures are logged, never fatal — the next
    /// mutation retries.
    async fn persist(&self) {
        let Some(path) = &self.path else { return };
        let json = {
            let data = self.data.read().await;
            match serde_json::to_string_pretty(&*data) {
                Ok(j) => j,
                Err(e) => {
                    warn!("Store serialize failed: {e}");
                    return;
                }
            }
        };
        if let Some(parent) = path.parent() {
            let _ = fs::create_dir_all(parent).await;
        }
        if let Err(e) = fs::write(path, json).await {
            warn!("Store persist failed: {e}");
        }
    }

    // ── Devices ───────────────────────────────────────────────────────────────

    pub async fn get_device(&self, device_id: &str) -> Option<DeviceRecord> {
        self.data.read().await.devices.get(device_id).cloned()
    }

    pub async fn put_device(&self, record: DeviceRecord) {
        self.data
            .write()
            .await
            .devices
            .insert(record.device_id.clone(), record);
        self.persist().await;
    }

    /// Partial update of a registry row. No-op when the device is unknown.
    pub async fn update_device<F>(&self, device_id: &str, apply: F)
    where
        F: FnOnce(&mut DeviceRecord),
    {
        {
            let mut data = self.data.write().await;
            match data.devices.get_mut(device_id) {
                Some(record) => apply(record),
                None => return,
            }
        }
        self.persist().await;
    }

    /// Bounded scan over active devices, ordered by short ID.
    pub async fn active_devices(&self, limit: usize) -> Vec<DeviceRecord> {
        self.data
            .read()
            .await
            .devices
            .values()
            .filter(|d| d.status == DeviceStatus::Active)
            .take(limit)
            .cloned()
            .collect()
    }

    // ── Device state ──────────────────────────────────────────────────────────

    pub async fn get_state(&self, device_id: &str) -> DeviceState {
        self.data
            .read()
            .await
            .device_state
            .get(device_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Read-modify-write of the device's state row. Returns the row as
    /// written. The store lock makes the closure atomic per device.
    pub async fn update_state<F>(&self, device_id: &str, apply: F) -> DeviceState
    where
        F: FnOnce(&mut DeviceState),
    {
        let updated = {
            let mut data = self.data.write().await;
            let row = data.device_state.entry(device_id.to_string()).or_default();
            apply(row);
            row.clone()
        };
        self.persist().await;
        updated
    }

    /// Devices that currently have a live OTA session (retry-timer scan).
    pub async fn devices_with_ota_session(&self) -> Vec<String> {
        self.data
            .read()
            .await
            .device_state
            .iter()
            .filter(|(_, s)| s.ota.is_some())
            .map(|(id, _)| id.clone())
            .collect()
    }

    // ── Event log ─────────────────────────────────────────────────────────────

    /// Append an event, pruning expired rows and enforcing strictly
    /// monotonic per-device sort keys (+1 ms bumps on collision).
    /// Returns the sort key actually written.
    pub async fn append_event(&self, mut event: EventRecord) -> String {
        let key = {
            let mut data = self.data.write().await;
            let now = now_unix();
            let log = data.events.entry(event.device_id.clone()).or_default();
            log.retain(|_, ev| ev.ttl > now);

            if let Some((last_key, last)) = log.iter().next_back() {
                if event.timestamp_mt <= *last_key {
                    let bumped_ms = last.effective_unix_ms + 1;
                    event.effective_unix_ms = bumped_ms;
                    event.timestamp_mt = unix_ms_to_mt(bumped_ms);
                }
            }
            let key = event.timestamp_mt.clone();
            log.insert(key.clone(), event);
            key
        };
        self.persist().await;
        key
    }

    /// All live events for one device, oldest first.
    pub async fn events_for(&self, device_id: &str) -> Vec<EventRecord> {
        self.data
            .read()
            .await
            .events
            .get(device_id)
            .map(|log| log.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Fleet-wide query by event type (the secondary-index read path).
    pub async fn events_by_type(&self, event_type: &str) -> Vec<EventRecord> {
        let data = self.data.read().await;
        let mut out: Vec<EventRecord> = data
            .events
            .values()
            .flat_map(|log| log.values())
            .filter(|ev| ev.event_type == event_type)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.timestamp_mt.cmp(&b.timestamp_mt));
        out
    }
}
