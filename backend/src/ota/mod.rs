//! Delta OTA engine.
//!
//! Drives a firmware image (60 KB–256 KB) across a 19-byte-MTU link with
//! device-initiated ACKs. Three event sources feed one state machine per
//! device:
//!
//! - a new firmware object in the bucket (session start),
//! - OTA uplinks forwarded by the decoder (ACK / COMPLETE / STATUS),
//! - the periodic retry tick (stale-session recovery).
//!
//! The durable session row in the device-state table is the only
//! synchronisation point between those paths; every handler re-reads it
//! under the device lock before acting.
//!
//! When a `baseline.bin` snapshot of the fleet's current image exists, the
//! session runs in delta mode: only the chunks that differ ship, and the
//! device's sequential received-counter is mapped through the delta list to
//! absolute chunk indices. The device never sees absolute indices in its
//! ACKs — the cloud's mapping is authoritative.

pub mod cache;
pub mod delta;

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info, warn};

use evse_wire::ota::OTA_START_FLAG_SIGNED;
use evse_wire::{
    build_ota_abort, build_ota_chunk, build_ota_start, OtaAck, OtaComplete, OtaStartParams,
    OtaStatusCode, OtaStatusReport, OtaUplink,
};

use crate::clock::now_unix;
use crate::config::Config;
use crate::downlink::{Downlink, TRANSMIT_RELIABLE};
use crate::locks::DeviceLocks;
use crate::objectstore::{ObjectStore, ObjectStoreError};
use crate::state::{DeviceRecord, EventRecord, OtaSession, OtaSessionStatus};
use crate::store::Store;

use cache::FirmwareCache;
use delta::{chunk_count, compute_delta_chunks, crc32_ieee, version_from_key};

/// Re-send when a session has been quiet this long.
pub const SESSION_STALE_SECS: i64 = 30;
/// NO_SESSION restarts before giving up.
pub const NO_SESSION_MAX_RESTARTS: u32 = 3;
/// The delta reference image.
pub const BASELINE_KEY: &str = "firmware/baseline.bin";

pub struct OtaEngine {
    store: Store,
    downlink: Arc<Downlink>,
    objects: ObjectStore,
    cache: FirmwareCache,
    locks: DeviceLocks,
    bucket: String,
    chunk_size: u16,
    max_retries: u32,
    scan_limit: usize,
}

impl OtaEngine {
    pub fn new(
        store: Store,
        downlink: Arc<Downlink>,
        objects: ObjectStore,
        cache: FirmwareCache,
        locks: DeviceLocks,
        cfg: &Config,
    ) -> Self {
        Self {
            store,
            downlink,
            objects,
            cache,
            locks,
            bucket: cfg.ota_bucket.clone(),
            chunk_size: cfg.ota_chunk_size,
            max_retries: cfg.ota_max_retries,
            scan_limit: cfg.device_scan_limit,
        }
    }

    // ── Session start ─────────────────────────────────────────────────────────

    /// New firmware object: start (or restart) a session on every active
    /// device.
    pub async fn handle_new_image(&self, key: &str) {
        self.cache.invalidate(&self.bucket, key).await;
        let devices = self.store.active_devices(self.scan_limit).await;
        if devices.is_empty() {
            info!("New image {key}, but no active devices");
            return;
        }
        for device in devices {
            if let Err(e) = self.start_session(&device, key).await {
                warn!("OTA start failed for {}: {e}", device.device_id);
            }
        }
    }

    pub async fn start_session(
        &self,
        device: &DeviceRecord,
        key: &str,
    ) -> Result<(), ObjectStoreError> {
        let _guard = self.locks.lock(&device.device_id).await;
        let sc_id = &device.device_id;

        let firmware = self.cache.load(&self.objects, &self.bucket, key).await?;
        let fw_size = firmware.len();
        let fw_crc = crc32_ieee(&firmware);
        let full_chunks = chunk_count(fw_size, self.chunk_size as usize);
        let version = version_from_key(key);
        let signed = self
            .objects
            .metadata(key)
            .await
            .map(|m| m.signed)
            .unwrap_or(false);

        // delta mode when a baseline exists and actually saves chunks
        let mut baseline_crc32 = None;
        let mut baseline_size = None;
        let mut delta_list: Option<Vec<u16>> = None;
        match self.cache.load(&self.objects, &self.bucket, BASELINE_KEY).await {
            Ok(baseline) => {
                baseline_crc32 = Some(crc32_ieee(&baseline));
                baseline_size = Some(baseline.len() as u32);
                let changed = compute_delta_chunks(&baseline, &firmware, self.chunk_size as usize);
                info!(
                    "{sc_id}: delta candidate {}/{} chunks changed",
                    changed.len(),
                    full_chunks
                );
                if changed.len() < full_chunks {
                    delta_list = Some(changed);
                }
            }
            Err(ObjectStoreError::NotFound(_)) => {
                info!("{sc_id}: no baseline, full OTA");
            }
            Err(e) => {
                warn!("{sc_id}: baseline read failed ({e}), full OTA");
            }
        }

        let (total_chunks, mode) = match &delta_list {
            Some(list) => (list.len() as u16, "delta"),
            None => (full_chunks as u16, "full"),
        };

        let prior = self.store.get_state(sc_id).await.ota;
        if let Some(old) = prior {
            warn!(
                "{sc_id}: replacing active OTA session for {} (status {})",
                old.key,
                old.status.as_str()
            );
            self.log_event(
                device,
                "ota_aborted",
                json!({ "reason": "superseded_by_new_image", "s3_key": old.key }),
            )
            .await;
        }

        let now = now_unix();
        let session = OtaSession {
            bucket: self.bucket.clone(),
            key: key.to_string(),
            fw_size: fw_size as u32,
            fw_crc32: fw_crc,
            total_chunks,
            chunk_size: self.chunk_size,
            version,
            next_chunk: 0,
            highest_acked: 0,
            retries: 0,
            restarts: 0,
            status: OtaSessionStatus::Starting,
            started_unix: now,
            updated_unix: now,
            delta_cursor: delta_list.as_ref().map(|_| 0),
            delta_chunks: delta_list.clone(),
            baseline_crc32,
            baseline_size,
            signed,
        };

        info!(
            "{sc_id}: OTA START size={fw_size} chunks={total_chunks}/{full_chunks} \
             chunk_size={} crc=0x{fw_crc:08x} ver={version} mode={mode}",
            self.chunk_size
        );
        self.write_session(sc_id, session.clone()).await;
        self.log_event(
            device,
            "ota_start",
            json!({
                "s3_key": key,
                "fw_size": fw_size,
                "fw_crc32": format!("0x{fw_crc:08x}"),
                "total_chunks": total_chunks,
                "full_chunks": full_chunks,
                "version": version,
                "mode": mode,
                "delta_chunks": delta_list,
                "signed": signed,
            }),
        )
        .await;
        self.send_start(device, &session).await;
        Ok(())
    }

    // ── Uplink dispatch ───────────────────────────────────────────────────────

    pub async fn handle_uplink(&self, device: &DeviceRecord, msg: &OtaUplink) {
        match msg {
            OtaUplink::Ack(ack) => self.handle_ack(device, ack).await,
            OtaUplink::Complete(complete) => self.handle_complete(device, complete).await,
            OtaUplink::Status(status) => self.handle_status(device, status).await,
        }
    }

    // ── ACK path ──────────────────────────────────────────────────────────────

    pub async fn handle_ack(&self, device: &DeviceRecord, ack: &OtaAck) {
        let _guard = self.locks.lock(&device.device_id).await;
        let sc_id = &device.device_id;

        let Some(session) = self.store.get_state(sc_id).await.ota else {
            debug!("{sc_id}: ACK with no active OTA session, ignoring");
            return;
        };

        debug!(
            "{sc_id}: ACK status={} next={} received={}",
            ack.status.name(),
            ack.next_chunk,
            ack.chunks_received
        );

        if ack.status != OtaStatusCode::Ok {
            self.handle_error_ack(device, session, ack).await;
            return;
        }

        // stale: the device already reported more progress than this
        if ack.chunks_received < session.highest_acked {
            debug!(
                "{sc_id}: stale ACK ({} < {}), ignoring",
                ack.chunks_received, session.highest_acked
            );
            return;
        }

        if session.is_delta() {
            self.advance_delta(device, session, ack).await;
        } else {
            self.advance_full(device, session, ack).await;
        }
    }

    async fn advance_delta(&self, device: &DeviceRecord, mut session: OtaSession, ack: &OtaAck) {
        let sc_id = &device.device_id;
        let delta_list = session.delta_chunks.clone().unwrap_or_default();
        // the device counts received chunks 0,1,2,…; that counter is the
        // cursor into the delta list
        let cursor = ack.chunks_received;

        if cursor as usize >= delta_list.len() {
            info!("{sc_id}: all delta chunks acknowledged, awaiting COMPLETE");
            session.status = OtaSessionStatus::Validating;
            session.delta_cursor = Some(cursor);
            session.highest_acked = ack.chunks_received;
            session.updated_unix = now_unix();
            self.write_session(sc_id, session).await;
            return;
        }

        let abs_idx = delta_list[cursor as usize];
        session.delta_cursor = Some(cursor);
        session.retries = 0;
        session.status = OtaSessionStatus::Sending;
        session.highest_acked = ack.chunks_received;
        session.updated_unix = now_unix();
        info!(
            "{sc_id}: delta chunk {}/{} (abs idx {abs_idx})",
            cursor,
            delta_list.len()
        );
        self.write_session(sc_id, session.clone()).await;
        self.send_chunk(device, &session, abs_idx).await;
    }

    async fn advance_full(&self, device: &DeviceRecord, mut session: OtaSession, ack: &OtaAck) {
        let sc_id = &device.device_id;
        let chunk_idx = ack.next_chunk;

        // duplicate: no new progress and the requested chunk was already
        // handed to the transport. A fresh session has sent nothing yet, so
        // ACK(0,0) against `starting` is the real first request.
        if ack.chunks_received == session.highest_acked
            && session.status != OtaSessionStatus::Starting
            && chunk_idx <= session.next_chunk
        {
            debug!("{sc_id}: duplicate ACK for chunk {chunk_idx}, ignoring");
            return;
        }

        if chunk_idx >= session.total_chunks {
            info!("{sc_id}: all chunks acknowledged, awaiting COMPLETE");
            session.status = OtaSessionStatus::Validating;
            session.next_chunk = chunk_idx;
            session.highest_acked = ack.chunks_received;
            session.updated_unix = now_unix();
            self.write_session(sc_id, session).await;
            return;
        }

        session.next_chunk = chunk_idx;
        session.retries = 0;
        session.status = OtaSessionStatus::Sending;
        session.highest_acked = ack.chunks_received;
        session.updated_unix = now_unix();
        self.write_session(sc_id, session.clone()).await;
        self.send_chunk(device, &session, chunk_idx).await;
    }

    async fn handle_error_ack(&self, device: &DeviceRecord, mut session: OtaSession, ack: &OtaAck) {
        let sc_id = &device.device_id;

        if ack.status == OtaStatusCode::NoSession {
            // device lost its session (reboot, storage wipe): re-announce.
            // It either starts fresh or replies COMPLETE if already applied.
            session.restarts += 1;
            if session.restarts > NO_SESSION_MAX_RESTARTS {
                warn!("{sc_id}: NO_SESSION restart limit exceeded, aborting");
                self.log_event(
                    device,
                    "ota_aborted",
                    json!({ "reason": "no_session_max_restarts" }),
                )
                .await;
                self.clear_session(sc_id).await;
                return;
            }
            info!(
                "{sc_id}: NO_SESSION, re-sending START (restart {}/{})",
                session.restarts, NO_SESSION_MAX_RESTARTS
            );
            session.status = OtaSessionStatus::Restarting;
            session.updated_unix = now_unix();
            self.write_session(sc_id, session.clone()).await;
            self.send_start(device, &session).await;
            return;
        }

        session.retries += 1;
        if session.retries > self.max_retries {
            warn!("{sc_id}: max retries exceeded, aborting OTA");
            self.log_event(
                device,
                "ota_aborted",
                json!({ "reason": "max_retries", "last_status": ack.status.name() }),
            )
            .await;
            self.clear_session(sc_id).await;
            self.send_abort(device).await;
            return;
        }

        // re-send the chunk the device was expecting. In delta mode the
        // ACK's next_chunk is a sequence counter — the absolute index comes
        // from the delta list.
        let retry_idx = match (&session.delta_chunks, session.delta_cursor) {
            (Some(list), Some(cursor)) if (cursor as usize) < list.len() => list[cursor as usize],
            _ => ack.next_chunk,
        };
        info!(
            "{sc_id}: device reported {}, retrying chunk {retry_idx} (attempt {})",
            ack.status.name(),
            session.retries
        );
        session.next_chunk = ack.next_chunk;
        session.status = OtaSessionStatus::Retrying;
        session.updated_unix = now_unix();
        self.write_session(sc_id, session.clone()).await;
        self.send_chunk(device, &session, retry_idx).await;
    }

    // ── COMPLETE / STATUS ─────────────────────────────────────────────────────

    pub async fn handle_complete(&self, device: &DeviceRecord, complete: &OtaComplete) {
        let _guard = self.locks.lock(&device.device_id).await;
        let sc_id = &device.device_id;
        let session = self.store.get_state(sc_id).await.ota;
        let success = complete.result == OtaStatusCode::Ok;

        self.log_event(
            device,
            "ota_complete",
            json!({
                "result": complete.result.raw(),
                "crc32_calc": format!("0x{:08x}", complete.crc32_calc),
                "success": success,
            }),
        )
        .await;

        match (&session, success) {
            (Some(session), true) => {
                // promote this image to the delta baseline for next time
                match self.objects.copy(&session.key, BASELINE_KEY).await {
                    Ok(()) => {
                        self.cache.invalidate(&self.bucket, BASELINE_KEY).await;
                        info!("{sc_id}: baseline updated from {}", session.key);
                    }
                    Err(e) => warn!("{sc_id}: baseline save failed: {e}"),
                }
                info!("{sc_id}: OTA v{} successful, device will reboot", session.version);
            }
            (Some(_), false) => {
                warn!("{sc_id}: OTA failed with {}", complete.result.name());
            }
            (None, _) => {
                // invariant violation per the error taxonomy: log, no downlink
                warn!("{sc_id}: COMPLETE with no active session");
            }
        }

        // unconditional: a bad result must not wedge the device
        self.clear_session(sc_id).await;
    }

    pub async fn handle_status(&self, device: &DeviceRecord, status: &OtaStatusReport) {
        debug!(
            "{}: device STATUS phase={} received={}/{} app_version={}",
            device.device_id, status.phase, status.chunks_received, status.total_chunks,
            status.app_version
        );
        self.log_event(
            device,
            "ota_device_status",
            json!({
                "phase": status.phase,
                "chunks_received": status.chunks_received,
                "total_chunks": status.total_chunks,
                "app_version": status.app_version,
            }),
        )
        .await;
    }

    // ── Retry timer ───────────────────────────────────────────────────────────

    /// Periodic stale-session sweep.
    pub async fn retry_tick(&self) {
        for sc_id in self.store.devices_with_ota_session().await {
            let Some(device) = self.store.get_device(&sc_id).await else {
                continue;
            };
            self.retry_device(&device).await;
        }
    }

    pub async fn retry_device(&self, device: &DeviceRecord) {
        let _guard = self.locks.lock(&device.device_id).await;
        let sc_id = &device.device_id;
        let Some(mut session) = self.store.get_state(sc_id).await.ota else {
            return;
        };

        let elapsed = now_unix() - session.updated_unix;
        if elapsed < SESSION_STALE_SECS {
            debug!("{sc_id}: session active ({elapsed}s ago), no retry needed");
            return;
        }

        session.retries += 1;
        if session.retries > self.max_retries {
            warn!("{sc_id}: session stale and max retries exceeded, aborting");
            self.log_event(device, "ota_aborted", json!({ "reason": "stale_max_retries" }))
                .await;
            self.clear_session(sc_id).await;
            self.send_abort(device).await;
            return;
        }

        let resend_start = matches!(
            session.status,
            OtaSessionStatus::Starting | OtaSessionStatus::Validating | OtaSessionStatus::Restarting
        );
        info!(
            "{sc_id}: session stale ({elapsed}s, status {}), retry {} — re-sending {}",
            session.status.as_str(),
            session.retries,
            if resend_start { "START" } else { "chunk" }
        );

        // keep the START-resend states; a stale `validating` must keep
        // answering lost COMPLETEs with START, never with a chunk
        if !resend_start {
            session.status = OtaSessionStatus::Retrying;
        }
        session.updated_unix = now_unix();
        self.write_session(sc_id, session.clone()).await;

        if resend_start {
            self.send_start(device, &session).await;
        } else {
            let idx = match (&session.delta_chunks, session.delta_cursor) {
                (Some(list), Some(cursor)) => {
                    if (cursor as usize) < list.len() {
                        list[cursor as usize]
                    } else {
                        debug!("{sc_id}: delta cursor past end, nothing to retry");
                        return;
                    }
                }
                _ => session.next_chunk,
            };
            self.send_chunk(device, &session, idx).await;
        }
    }

    // ── Downlink helpers ──────────────────────────────────────────────────────

    async fn send_start(&self, device: &DeviceRecord, session: &OtaSession) {
        let params = OtaStartParams {
            size: session.fw_size,
            total_chunks: session.total_chunks,
            chunk_size: session.chunk_size,
            crc32: session.fw_crc32,
            version: session.version,
            flags: session.signed.then_some(OTA_START_FLAG_SIGNED),
        };
        if let Err(e) = self
            .downlink
            .send(&device.wireless_device_id, build_ota_start(&params), TRANSMIT_RELIABLE)
            .await
        {
            warn!("{}: START send failed: {e}", device.device_id);
        }
    }

    async fn send_chunk(&self, device: &DeviceRecord, session: &OtaSession, abs_idx: u16) {
        let firmware = match self
            .cache
            .load(&self.objects, &session.bucket, &session.key)
            .await
        {
            Ok(fw) => fw,
            Err(e) => {
                warn!("{}: firmware load failed: {e}", device.device_id);
                return;
            }
        };
        let offset = abs_idx as usize * session.chunk_size as usize;
        if offset >= firmware.len() {
            warn!(
                "{}: chunk {abs_idx} is empty (offset {offset}, fw size {})",
                device.device_id,
                firmware.len()
            );
            return;
        }
        let end = (offset + session.chunk_size as usize).min(firmware.len());
        let data = &firmware[offset..end];
        if let Err(e) = self
            .downlink
            .send(&device.wireless_device_id, build_ota_chunk(abs_idx, data), TRANSMIT_RELIABLE)
            .await
        {
            warn!("{}: chunk send failed: {e}", device.device_id);
            return;
        }
        debug!(
            "{}: sent chunk {abs_idx} ({}B at offset {offset})",
            device.device_id,
            end - offset
        );
    }

    async fn send_abort(&self, device: &DeviceRecord) {
        if let Err(e) = self
            .downlink
            .send(&device.wireless_device_id, build_ota_abort(), TRANSMIT_RELIABLE)
            .await
        {
            warn!("{}: ABORT send failed: {e}", device.device_id);
        }
    }

    // ── Session persistence ───────────────────────────────────────────────────

    async fn write_session(&self, sc_id: &str, session: OtaSession) {
        self.store
            .update_state(sc_id, |state| state.ota = Some(session))
            .await;
    }

    async fn clear_session(&self, sc_id: &str) {
        self.store.update_state(sc_id, |state| state.ota = None).await;
    }

    async fn log_event(&self, device: &DeviceRecord, event_type: &str, data: serde_json::Value) {
        let event = EventRecord::now(&device.device_id, event_type, data)
            .with_wireless_id(&device.wireless_device_id);
        self.store.append_event(event).await;
    }
}
