//! Typed rows for the three store tables: device registry, per-device state
//! snapshot, and the append-only event log.
//!
//! The state row is one record per device with optional tagged substructures
//! (scheduler intent, OTA session, time sync, divergence). Handlers update
//! the substructure they own with a targeted partial write; nothing ever
//! rewrites a whole row it did not read.

use serde::{Deserialize, Serialize};

use evse_wire::TelemetryFrame;

use crate::clock::{unix_ms_to_mt, EVENT_TTL_SECS};

// ── Device registry ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Active,
    Retired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// SC-XXXXXXXX short ID (primary key).
    pub device_id: String,
    /// Transport-layer UUID.
    pub wireless_device_id: String,
    /// Wireless network ID (e.g. the Sidewalk ID), stored on create.
    pub network_id: String,
    pub status: DeviceStatus,
    /// ISO-8601 UTC, touched on every uplink.
    pub last_seen: String,
    /// Latest reported application build.
    pub app_version: u32,
    pub created_at: String,
    /// Owner metadata is set out-of-band and never touched by uplink
    /// processing. Absent fields keep unowned devices out of owner queries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_email: Option<String>,
}

// ── Scheduler intent ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerCommand {
    Allow,
    OffPeak,
    DelayWindow,
    ChargeNowOptout,
}

impl SchedulerCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::OffPeak => "off_peak",
            Self::DelayWindow => "delay_window",
            Self::ChargeNowOptout => "charge_now_optout",
        }
    }
}

/// What the scheduler last decided for this device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerIntent {
    pub last_command: SchedulerCommand,
    pub reason: String,
    pub moer_percent: Option<u8>,
    pub tou_peak: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window_start_sc: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window_end_sc: Option<u32>,
    /// Unix seconds of the last emitted downlink for this intent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sent_unix: Option<i64>,
    pub updated_unix: i64,
}

// ── OTA session ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OtaSessionStatus {
    Starting,
    Sending,
    Retrying,
    Validating,
    Restarting,
}

impl OtaSessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Sending => "sending",
            Self::Retrying => "retrying",
            Self::Validating => "validating",
            Self::Restarting => "restarting",
        }
    }
}

/// Durable OTA transfer session. Exists only while a transfer is live; the
/// row is the sole synchronisation point between the ACK-driven path and
/// the retry timer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OtaSession {
    pub bucket: String,
    pub key: String,
    pub fw_size: u32,
    pub fw_crc32: u32,
    /// Chunks the device will accept for this session: the delta count in
    /// delta mode, the full count otherwise. Matches what START announced.
    pub total_chunks: u16,
    pub chunk_size: u16,
    pub version: u32,
    /// Last chunk handed to the transport (absolute index in full mode).
    pub next_chunk: u16,
    pub highest_acked: u16,
    pub retries: u32,
    pub restarts: u32,
    pub status: OtaSessionStatus,
    pub started_unix: i64,
    pub updated_unix: i64,
    /// Delta mode: sorted absolute indices of chunks that differ from the
    /// baseline image.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta_chunks: Option<Vec<u16>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta_cursor: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub baseline_crc32: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub baseline_size: Option<u32>,
    /// Image carries an appended ED25519 signature (START flag bit 0).
    #[serde(default)]
    pub signed: bool,
}

impl OtaSession {
    pub fn is_delta(&self) -> bool {
        self.delta_chunks.is_some()
    }
}

// ── Time sync / divergence ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimeSyncState {
    pub last_sync_unix: i64,
    pub last_sync_epoch: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DivergenceTracker {
    pub retry_count: u32,
    pub last_unix: i64,
    pub scheduler_cmd: String,
    pub device_allowed: bool,
}

// ── Telemetry snapshot ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub frame: TelemetryFrame,
    pub received_unix: i64,
}

// ── Device state row ──────────────────────────────────────────────────────────

/// One mutable row per device. Every field is optional so partial updates
/// stay partial: a handler touches only the substructure it owns.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub telemetry: Option<TelemetrySnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduler: Option<SchedulerIntent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ota: Option<OtaSession>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_sync: Option<TimeSyncState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub divergence: Option<DivergenceTracker>,
    /// Live charge-now override, Unix seconds. Stale values are ignored and
    /// dropped by the scheduler on its next write.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charge_now_override_until: Option<i64>,
}

// ── Event log ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampSource {
    /// Sort key derives from the device-reported epoch.
    Device,
    /// Cloud-originated event (scheduler command, OTA lifecycle).
    Cloud,
    /// Telemetry from a device that has not synced its clock yet; sort key
    /// falls back to cloud receive time.
    CloudPresync,
}

impl TimestampSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Device => "device",
            Self::Cloud => "cloud",
            Self::CloudPresync => "cloud_presync",
        }
    }
}

/// Append-only event row. Composite key (device_id, timestamp_mt).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub device_id: String,
    /// Sort key, local-time string. The store may bump this by +1 ms steps
    /// to keep per-device keys strictly monotonic.
    pub timestamp_mt: String,
    /// Millisecond timestamp the sort key was derived from.
    pub effective_unix_ms: i64,
    pub event_type: String,
    pub timestamp_source: TimestampSource,
    pub cloud_received_mt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wireless_device_id: Option<String>,
    /// Unix seconds after which the row expires (90-day retention).
    pub ttl: i64,
    pub data: serde_json::Value,
}

impl EventRecord {
    /// Build an event at an explicit effective time.
    pub fn new(
        device_id: &str,
        effective_unix_ms: i64,
        event_type: &str,
        source: TimestampSource,
        data: serde_json::Value,
    ) -> Self {
        let now_ms = crate::clock::now_unix_ms();
        Self {
            device_id: device_id.to_string(),
            timestamp_mt: unix_ms_to_mt(effective_unix_ms),
            effective_unix_ms,
            event_type: event_type.to_string(),
            timestamp_source: source,
            cloud_received_mt: unix_ms_to_mt(now_ms),
            wireless_device_id: None,
            ttl: now_ms / 1000 + EVENT_TTL_SECS,
            data,
        }
    }

    /// Cloud-originated event stamped "now".
    pub fn now(device_id: &str, event_type: &str, data: serde_json::Value) -> Self {
        Self::new(
            device_id,
            crate::clock::now_unix_ms(),
            event_type,
            TimestampSource::Cloud,
            data,
        )
    }

    pub fn with_wireless_id(mut self, wireless_device_id: &str) -> Self {
        self.wireless_device_id = Some(wireless_device_id.to_string());
        self
    }
}
