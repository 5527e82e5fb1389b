//! Uplink ingest: UDP envelope listener + the decode pipeline.
//!
//! ## Architecture
//! Runs as its own tokio task alongside the scheduler and OTA timers. It:
//!   1. binds a UDP socket (port from `UPLINK_UDP_PORT`),
//!   2. receives JSON envelopes from the wireless gateway
//!      `{wireless_device_id, payload_data (base64), link_type, rssi, seq,
//!      network_id}`,
//!   3. decodes the payload, auto-provisions the device, writes the event
//!      row, and runs the convergence + OTA follow-ups.
//!
//! Uplinks for one device are processed in receive order under the device
//! lock; the event log still orders by device time when the frame carries
//! one. Malformed datagrams are logged and dropped — ingest never crashes.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use serde::Deserialize;
use serde_json::json;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use evse_wire::{decode_payload, DiagnosticsFrame, LegacyTelemetry, TelemetryFrame, Uplink};

use crate::clock::now_unix_ms;
use crate::convergence::Convergence;
use crate::locks::DeviceLocks;
use crate::ota::OtaEngine;
use crate::registry;
use crate::state::{DeviceRecord, EventRecord, TelemetrySnapshot, TimestampSource};
use crate::store::Store;

/// One uplink as delivered by the transport.
#[derive(Debug, Clone, Deserialize)]
pub struct UplinkEnvelope {
    pub wireless_device_id: String,
    /// Base64 payload, exactly as the wireless API hands it over.
    #[serde(default)]
    pub payload_data: String,
    #[serde(default)]
    pub link_type: String,
    #[serde(default)]
    pub rssi: i32,
    #[serde(default)]
    pub seq: u32,
    /// Wireless network ID (stored on first provision).
    #[serde(default)]
    pub network_id: String,
}

pub struct UplinkPipeline {
    store: Store,
    convergence: Convergence,
    ota: Arc<OtaEngine>,
    locks: DeviceLocks,
}

impl UplinkPipeline {
    pub fn new(
        store: Store,
        convergence: Convergence,
        ota: Arc<OtaEngine>,
        locks: DeviceLocks,
    ) -> Self {
        Self {
            store,
            convergence,
            ota,
            locks,
        }
    }

    /// Process one envelope end to end.
    pub async fn process(&self, envelope: UplinkEnvelope) {
        let device = registry::get_or_create(
            &self.store,
            &envelope.wireless_device_id,
            &envelope.network_id,
        )
        .await;

        let decoded = match B64.decode(envelope.payload_data.as_bytes()) {
            Ok(raw) => decode_payload(&raw),
            Err(e) => {
                debug!("{}: bad base64 payload: {e}", device.device_id);
                Uplink::Unknown {
                    raw: envelope.payload_data.clone().into_bytes(),
                }
            }
        };
        debug!("{}: uplink kind={}", device.device_id, decoded.kind());

        let app_version = match &decoded {
            Uplink::Telemetry(t) => t.app_build.map(u32::from),
            Uplink::Diagnostics(d) => Some(u32::from(d.app_version)),
            _ => None,
        };
        registry::update_last_seen(&self.store, &envelope.wireless_device_id, app_version).await;

        match decoded {
            Uplink::Telemetry(frame) => self.process_telemetry(&device, &envelope, frame).await,
            Uplink::Diagnostics(frame) => self.process_diagnostics(&device, &envelope, frame).await,
            Uplink::Ota(msg) => {
                self.append(
                    &device,
                    &envelope,
                    EventRecord::now(
                        &device.device_id,
                        "ota_uplink",
                        json!({ "ota": msg }),
                    ),
                )
                .await;
                // engine takes the device lock itself
                self.ota.handle_uplink(&device, &msg).await;
            }
            Uplink::Legacy(frame) => self.process_legacy(&device, &envelope, frame).await,
            Uplink::Unknown { raw } => {
                info!("{}: unknown payload ({} B)", device.device_id, raw.len());
                self.append(
                    &device,
                    &envelope,
                    EventRecord::now(
                        &device.device_id,
                        "evse_telemetry",
                        json!({ "decode_result": {
                            "payload_type": "unknown",
                            "raw_hex": hex::encode(&raw),
                            "raw_length": raw.len(),
                        }}),
                    ),
                )
                .await;
            }
        }
    }

    async fn process_telemetry(
        &self,
        device: &DeviceRecord,
        envelope: &UplinkEnvelope,
        frame: TelemetryFrame,
    ) {
        let _guard = self.locks.lock(&device.device_id).await;

        // sort by device time when the device has a clock; otherwise by
        // receive time, with the source recorded either way
        let (effective_ms, source) = match frame.device_unix() {
            Some(unix) => (unix * 1000, TimestampSource::Device),
            None => (now_unix_ms(), TimestampSource::CloudPresync),
        };

        let mut evse = json!({
            "format": format!("raw_v{}", frame.version),
            "pilot_state": frame.state.letter(),
            "pilot_state_code": frame.state.code(),
            "pilot_voltage_mv": frame.pilot_mv,
            "current_draw_ma": frame.current_ma,
            "thermostat_bits": frame.thermostat_bits,
            "thermostat_cool_active": frame.thermostat_cool,
            "fault_sensor": frame.fault_sensor,
            "fault_clamp_mismatch": frame.fault_clamp_mismatch,
            "fault_interlock": frame.fault_interlock,
            "fault_selftest_fail": frame.fault_selftest_fail,
        });
        if let Some(obj) = evse.as_object_mut() {
            if let Some(heat) = frame.thermostat_heat {
                obj.insert("thermostat_heat_active".into(), json!(heat));
            }
            if let Some(allowed) = frame.charge_allowed {
                obj.insert("charge_allowed".into(), json!(allowed));
            }
            if let Some(charge_now) = frame.charge_now {
                obj.insert("charge_now".into(), json!(charge_now));
            }
            if let Some(epoch) = frame.device_epoch {
                obj.insert("device_timestamp_epoch".into(), json!(epoch));
                obj.insert("device_timestamp_unix".into(), json!(frame.device_unix()));
            }
            if let Some(reason) = frame.transition_reason {
                obj.insert("transition_reason".into(), json!(reason.name()));
            }
            if let Some(build) = frame.app_build {
                obj.insert("app_build".into(), json!(build));
                obj.insert("platform_build".into(), json!(frame.platform_build));
            }
        }

        self.append(
            device,
            envelope,
            EventRecord::new(
                &device.device_id,
                effective_ms,
                "evse_telemetry",
                source,
                json!({ "evse": evse }),
            ),
        )
        .await;

        self.store
            .update_state(&device.device_id, |state| {
                state.telemetry = Some(TelemetrySnapshot {
                    frame: frame.clone(),
                    received_unix: now_unix_ms() / 1000,
                });
            })
            .await;

        self.convergence
            .on_telemetry(device, &frame, effective_ms, source)
            .await;
    }

    async fn process_diagnostics(
        &self,
        device: &DeviceRecord,
        envelope: &UplinkEnvelope,
        frame: DiagnosticsFrame,
    ) {
        let _guard = self.locks.lock(&device.device_id).await;
        self.append(
            device,
            envelope,
            EventRecord::now(
                &device.device_id,
                "device_diagnostics",
                json!({ "diagnostics": {
                    "diag_version": frame.diag_version,
                    "app_version": frame.app_version,
                    "uptime_seconds": frame.uptime_seconds,
                    "boot_count": frame.boot_count,
                    "last_error_code": frame.last_error_code,
                    "last_error_name": frame.last_error_name(),
                    "event_buffer_pending": frame.event_buffer_pending,
                    "app_build": frame.app_build,
                    "platform_build": frame.platform_build,
                    "sidewalk_ready": frame.sidewalk_ready,
                    "charge_allowed": frame.charge_allowed,
                    "charge_now": frame.charge_now,
                    "interlock_active": frame.interlock_active,
                    "selftest_pass": frame.selftest_pass,
                    "ota_in_progress": frame.ota_in_progress,
                    "time_synced": frame.time_synced,
                }}),
            ),
        )
        .await;
    }

    async fn process_legacy(
        &self,
        device: &DeviceRecord,
        envelope: &UplinkEnvelope,
        frame: LegacyTelemetry,
    ) {
        let _guard = self.locks.lock(&device.device_id).await;
        self.append(
            device,
            envelope,
            EventRecord::now(
                &device.device_id,
                "evse_telemetry",
                json!({ "evse": {
                    "format": "sid_demo_legacy",
                    "pilot_state": frame.state.letter(),
                    "pilot_state_code": frame.state.code(),
                    "pilot_voltage_mv": frame.pilot_mv,
                    "current_draw_ma": frame.current_ma,
                    "thermostat_bits": frame.thermostat_bits,
                    "thermostat_heat_active": frame.thermostat_heat,
                    "thermostat_cool_active": frame.thermostat_cool,
                }}),
            ),
        )
        .await;
    }

    async fn append(&self, device: &DeviceRecord, envelope: &UplinkEnvelope, mut event: EventRecord) {
        event.wireless_device_id = Some(device.wireless_device_id.clone());
        if let Some(data) = event.data.as_object_mut() {
            data.insert("link_type".into(), json!(envelope.link_type));
            data.insert("rssi".into(), json!(envelope.rssi));
            data.insert("seq".into(), json!(envelope.seq));
        }
        self.store.append_event(event).await;
    }
}

// ── UDP listener task ─────────────────────────────────────────────────────────

/// Bind the uplink socket and process envelopes forever. Errors never kill
/// the task.
pub async fn run_uplink_hub(port: u16, pipeline: Arc<UplinkPipeline>) {
    let addr = format!("0.0.0.0:{port}");
    let socket = match UdpSocket::bind(&addr).await {
        Ok(s) => {
            info!("Uplink hub listening on UDP {addr}");
            s
        }
        Err(e) => {
            warn!("Uplink hub: could not bind UDP {addr}: {e}");
            return;
        }
    };

    let mut buf = vec![0u8; 2048];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, src)) => {
                let envelope: UplinkEnvelope = match serde_json::from_slice(&buf[..len]) {
                    Ok(env) => env,
                    Err(e) => {
                        debug!("Uplink hub: malformed envelope from {src}: {e}");
                        continue;
                    }
                };
                pipeline.process(envelope).await;
            }
            Err(e) => {
                warn!("Uplink hub: UDP recv error: {e}");
            }
        }
    }
}
