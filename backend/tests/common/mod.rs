//! Shared fixtures for integration tests.
#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use sidecharge_backend::config::Config;
use sidecharge_backend::downlink::{Downlink, RecordingTransport};
use sidecharge_backend::locks::DeviceLocks;
use sidecharge_backend::registry;
use sidecharge_backend::state::DeviceRecord;
use sidecharge_backend::store::Store;

pub const DEVICE_UUID: &str = "b319d001-6b08-4d88-b4ca-4d2d98a6d43c";

/// Config with test-friendly defaults rooted at `dir`.
pub fn test_config(dir: &Path) -> Config {
    Config {
        data_dir: dir.to_path_buf(),
        ota_bucket: "evse-ota-firmware".into(),
        uplink_udp_port: 0,
        downlink_addr: "127.0.0.1:0".into(),
        http_port: 0,
        scheduler_interval_secs: 300,
        ota_retry_interval_secs: 60,
        firmware_poll_secs: 5,
        ota_max_retries: 5,
        ota_chunk_size: 15,
        moer_threshold: 70,
        watttime_username: String::new(),
        watttime_password: String::new(),
        watttime_region: "PSCO".into(),
        watttime_base_url: "http://127.0.0.1:0".into(),
        cmd_auth_key: None,
        device_scan_limit: 256,
    }
}

pub struct Wiring {
    pub store: Store,
    pub transport: Arc<RecordingTransport>,
    pub downlink: Arc<Downlink>,
    pub locks: DeviceLocks,
}

pub fn wiring() -> Wiring {
    let transport = RecordingTransport::new();
    Wiring {
        store: Store::in_memory(),
        downlink: Arc::new(Downlink::new(transport.clone(), None)),
        transport,
        locks: DeviceLocks::new(),
    }
}

pub async fn provision(store: &Store) -> DeviceRecord {
    registry::get_or_create(store, DEVICE_UUID, "sid-001").await
}
