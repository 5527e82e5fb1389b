//! Environment-variable configuration with working defaults for local runs.

use std::path::PathBuf;

use evse_wire::CommandAuthKey;
use tracing::warn;

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_string(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

#[derive(Clone)]
pub struct Config {
    /// Root for the store snapshot, the object-store bucket, and the
    /// firmware tmp cache.
    pub data_dir: PathBuf,
    /// Bucket directory name under `data_dir`.
    pub ota_bucket: String,
    pub uplink_udp_port: u16,
    /// Where downlink envelopes go (the wireless gateway, or the simulator
    /// in local runs).
    pub downlink_addr: String,
    pub http_port: u16,
    pub scheduler_interval_secs: u64,
    pub ota_retry_interval_secs: u64,
    pub firmware_poll_secs: u64,
    pub ota_max_retries: u32,
    pub ota_chunk_size: u16,
    pub moer_threshold: u8,
    pub watttime_username: String,
    pub watttime_password: String,
    pub watttime_region: String,
    pub watttime_base_url: String,
    /// Optional command-auth pre-shared key (32 bytes, hex).
    pub cmd_auth_key: Option<CommandAuthKey>,
    /// Bound on fan-out scans over the registry.
    pub device_scan_limit: usize,
}

impl Config {
    pub fn from_env() -> Self {
        let cmd_auth_key = match std::env::var("CMD_AUTH_KEY") {
            Ok(hex_key) if !hex_key.is_empty() => match CommandAuthKey::from_hex(&hex_key) {
                Ok(key) => Some(key),
                Err(e) => {
                    warn!("CMD_AUTH_KEY rejected ({e}), command auth disabled");
                    None
                }
            },
            _ => None,
        };

        Self {
            data_dir: PathBuf::from(env_string("SIDECHARGE_DATA_DIR", "./data")),
            ota_bucket: env_string("SIDECHARGE_BUCKET", "evse-ota-firmware"),
            uplink_udp_port: env_or("UPLINK_UDP_PORT", 5880),
            downlink_addr: env_string("DOWNLINK_GATEWAY_ADDR", "127.0.0.1:5881"),
            http_port: env_or("HTTP_PORT", 3010),
            scheduler_interval_secs: env_or("SCHEDULER_INTERVAL_SECS", 300),
            ota_retry_interval_secs: env_or("OTA_RETRY_INTERVAL_SECS", 60),
            firmware_poll_secs: env_or("FIRMWARE_POLL_SECS", 5),
            ota_max_retries: env_or("OTA_MAX_RETRIES", 5),
            ota_chunk_size: env_or("OTA_CHUNK_SIZE", 15),
            moer_threshold: env_or("MOER_THRESHOLD", 70),
            watttime_username: env_string("WATTTIME_USERNAME", ""),
            watttime_password: env_string("WATTTIME_PASSWORD", ""),
            watttime_region: env_string("WATTTIME_REGION", "PSCO"),
            watttime_base_url: env_string("WATTTIME_BASE_URL", "https://api.watttime.org"),
            cmd_auth_key,
            device_scan_limit: env_or("DEVICE_SCAN_LIMIT", 256),
        }
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("store.json")
    }

    pub fn bucket_root(&self) -> PathBuf {
        self.data_dir.join(&self.ota_bucket)
    }

    pub fn firmware_tmp_dir(&self) -> PathBuf {
        self.data_dir.join("tmp")
    }
}
