//! Closed-loop convergence: make the device's observed state agree with
//! scheduler intent, and fold device-initiated signals back into it.
//!
//! Runs on every telemetry uplink:
//!
//! - **Divergence** — compare reported `charge_allowed` against the last
//!   command (after a 60 s grace for in-flight downlinks). Mismatch →
//!   bounded force-resend through the scheduler channel.
//! - **Charge-now** — a pressed override button suppresses the scheduler
//!   until the end of the current peak (or 4 h when off-peak).
//! - **Time sync** — unsynced or stale devices get a TIME_SYNC downlink
//!   carrying the epoch and an ack watermark.
//! - **Interlock transitions** — a non-none transition reason becomes its
//!   own event row at +1 ms, separating "state observed" from "why it
//!   changed".

use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use evse_wire::{build_time_sync, unix_to_sc, TelemetryFrame, TransitionReason};

use crate::clock::{is_tou_peak, now_mt, now_unix, tou_peak_end_unix};
use crate::downlink::{Downlink, TRANSMIT_BEST_EFFORT};
use crate::state::{
    DeviceRecord, DivergenceTracker, EventRecord, SchedulerCommand, TimeSyncState, TimestampSource,
};
use crate::store::Store;

/// Ignore mismatches younger than this — the downlink may still be in the air.
pub const DIVERGENCE_GRACE_SECS: i64 = 60;
/// Forced re-sends per divergence episode.
pub const DIVERGENCE_MAX_RETRIES: u32 = 3;
/// Off-peak charge-now override length.
pub const CHARGE_NOW_DEFAULT_OVERRIDE_SECS: i64 = 14_400;
/// Re-sync devices whose last sync is older than this.
pub const TIME_SYNC_MAX_AGE_SECS: i64 = 86_400;

pub struct Convergence {
    store: Store,
    downlink: std::sync::Arc<Downlink>,
    force_resend_tx: mpsc::Sender<String>,
}

impl Convergence {
    pub fn new(
        store: Store,
        downlink: std::sync::Arc<Downlink>,
        force_resend_tx: mpsc::Sender<String>,
    ) -> Self {
        Self {
            store,
            downlink,
            force_resend_tx,
        }
    }

    /// All per-telemetry closed-loop work. `effective_ms` is the event's
    /// sort-key time (device time when synced).
    pub async fn on_telemetry(
        &self,
        device: &DeviceRecord,
        frame: &TelemetryFrame,
        effective_ms: i64,
        source: TimestampSource,
    ) {
        self.check_divergence(device, frame).await;
        if frame.charge_now == Some(true) {
            self.apply_charge_now(device).await;
        }
        self.maybe_time_sync(device, frame.device_epoch).await;
        self.log_interlock_transition(device, frame, effective_ms, source).await;
    }

    // ── Divergence ────────────────────────────────────────────────────────────

    async fn check_divergence(&self, device: &DeviceRecord, frame: &TelemetryFrame) {
        let Some(device_allowed) = frame.charge_allowed else {
            return; // pre-v0x07 frames don't report it
        };
        let sc_id = &device.device_id;
        let state = self.store.get_state(sc_id).await;
        let Some(intent) = &state.scheduler else { return };

        let expected = match intent.last_command {
            SchedulerCommand::Allow => true,
            SchedulerCommand::DelayWindow => false,
            // off_peak sends nothing; charge_now_optout is device-driven
            _ => return,
        };
        let Some(sent_unix) = intent.sent_unix else { return };
        let now = now_unix();
        if now - sent_unix < DIVERGENCE_GRACE_SECS {
            return;
        }

        if device_allowed == expected {
            if state.divergence.as_ref().is_some_and(|d| d.retry_count > 0) {
                debug!("{sc_id}: device converged, resetting divergence counter");
                self.store
                    .update_state(sc_id, |s| s.divergence = None)
                    .await;
            }
            return;
        }

        let retry_count = state.divergence.as_ref().map(|d| d.retry_count).unwrap_or(0) + 1;
        let cmd = intent.last_command.as_str().to_string();
        self.store
            .update_state(sc_id, |s| {
                s.divergence = Some(DivergenceTracker {
                    retry_count,
                    last_unix: now,
                    scheduler_cmd: cmd.clone(),
                    device_allowed,
                })
            })
            .await;

        if retry_count > DIVERGENCE_MAX_RETRIES {
            if retry_count == DIVERGENCE_MAX_RETRIES + 1 {
                warn!("{sc_id}: divergence retries exhausted, giving up until state matches");
                self.log_event(
                    device,
                    "charge_divergence_exhausted",
                    json!({
                        "scheduler_cmd": intent.last_command.as_str(),
                        "device_allowed": device_allowed,
                        "retries": DIVERGENCE_MAX_RETRIES,
                    }),
                )
                .await;
            }
            return;
        }

        info!(
            "{sc_id}: device reports charge_allowed={device_allowed}, expected {expected} \
             (retry {retry_count}/{DIVERGENCE_MAX_RETRIES}) — forcing scheduler re-send"
        );
        self.log_event(
            device,
            "charge_divergence",
            json!({
                "scheduler_cmd": intent.last_command.as_str(),
                "device_allowed": device_allowed,
                "retry_count": retry_count,
            }),
        )
        .await;
        // fire-and-forget; the scheduler task owns the re-send
        if let Err(e) = self.force_resend_tx.send(sc_id.clone()).await {
            warn!("{sc_id}: force-resend channel closed: {e}");
        }
    }

    // ── Charge-now override ───────────────────────────────────────────────────

    async fn apply_charge_now(&self, device: &DeviceRecord) {
        let now = now_mt();
        let override_until = if is_tou_peak(&now) {
            tou_peak_end_unix(&now)
        } else {
            now.timestamp() + CHARGE_NOW_DEFAULT_OVERRIDE_SECS
        };
        let sc_id = &device.device_id;
        info!("{sc_id}: charge-now pressed, override until {override_until}");
        self.store
            .update_state(sc_id, |s| s.charge_now_override_until = Some(override_until))
            .await;
    }

    // ── Time sync ─────────────────────────────────────────────────────────────

    async fn maybe_time_sync(&self, device: &DeviceRecord, device_epoch: Option<u32>) {
        let sc_id = &device.device_id;
        let now = now_unix();

        // epoch 0 is a device telling us it rebooted without a clock
        let unsynced_device = device_epoch == Some(0);
        let state_wants_sync = match self.store.get_state(sc_id).await.time_sync {
            None => true,
            Some(sync) => now - sync.last_sync_unix > TIME_SYNC_MAX_AGE_SECS,
        };
        if !unsynced_device && !state_wants_sync {
            return;
        }

        let epoch_sc = unix_to_sc(now);
        // watermark == epoch: everything through now is safely stored
        let payload = build_time_sync(epoch_sc, epoch_sc);
        if let Err(e) = self
            .downlink
            .send(&device.wireless_device_id, payload, TRANSMIT_BEST_EFFORT)
            .await
        {
            warn!("{sc_id}: TIME_SYNC send failed: {e}");
            return;
        }
        info!("{sc_id}: TIME_SYNC sent (epoch_sc={epoch_sc})");
        self.store
            .update_state(sc_id, |s| {
                s.time_sync = Some(TimeSyncState {
                    last_sync_unix: now,
                    last_sync_epoch: epoch_sc,
                })
            })
            .await;
    }

    // ── Interlock transitions ─────────────────────────────────────────────────

    async fn log_interlock_transition(
        &self,
        device: &DeviceRecord,
        frame: &TelemetryFrame,
        effective_ms: i64,
        source: TimestampSource,
    ) {
        let Some(reason) = frame.transition_reason else { return };
        if reason == TransitionReason::None {
            return;
        }
        // +1 ms keeps the transition row after the telemetry row it explains
        let event = EventRecord::new(
            &device.device_id,
            effective_ms + 1,
            "interlock_transition",
            source,
            json!({
                "charge_allowed": frame.charge_allowed,
                "reason": reason.name(),
            }),
        )
        .with_wireless_id(&device.wireless_device_id);
        self.store.append_event(event).await;
    }

    async fn log_event(&self, device: &DeviceRecord, event_type: &str, data: serde_json::Value) {
        let event = EventRecord::now(&device.device_id, event_type, data)
            .with_wireless_id(&device.wireless_device_id);
        self.store.append_event(event).await;
    }
}
