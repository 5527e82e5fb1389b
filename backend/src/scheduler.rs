//! Demand-response charge scheduler.
//!
//! Runs on a periodic tick (5 min operating point) and decides, per device,
//! whether charging should pause: Xcel Colorado on-peak hours or a dirty
//! grid (MOER percentile above threshold) → a delay-window downlink; clear
//! conditions with a window in flight → an early legacy-allow cancel.
//!
//! Commands are at-most-once per window: a heartbeat re-send only goes out
//! when the same window has been quiet for 30 minutes, so a device that
//! missed the original eventually hears it without the airtime cost of
//! repeating every tick. A live charge-now override suppresses pause
//! decisions entirely (`charge_now_optout`).
//!
//! The out-of-band path (`force_resend`) bypasses the dedup gate; the
//! divergence detector uses it when a device visibly disagrees with intent.

use std::sync::Arc;

use chrono::DateTime;
use chrono_tz::Tz;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{info, warn};

use evse_wire::{build_charge_allow, build_delay_window, unix_to_sc};

use crate::carbon::CarbonClient;
use crate::clock::{is_tou_peak, now_mt, tou_peak_end_sc};
use crate::config::Config;
use crate::downlink::{Downlink, TRANSMIT_RELIABLE};
use crate::locks::DeviceLocks;
use crate::state::{DeviceRecord, EventRecord, SchedulerCommand, SchedulerIntent};
use crate::store::Store;

/// Re-send an unchanged window only after this much quiet time.
pub const HEARTBEAT_RESEND_SECS: i64 = 1800;
/// Pause window length when MOER alone is the trigger.
pub const MOER_WINDOW_SECS: i64 = 1800;

// ── Decision ──────────────────────────────────────────────────────────────────

/// The pause/allow decision for one tick, before device state is consulted.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub tou_peak: bool,
    pub moer_percent: Option<u8>,
    pub moer_high: bool,
    pub should_pause: bool,
    pub reason: String,
}

/// Pure decision from the inputs. The reason string names every
/// contributing trigger, or `off_peak` when charging may proceed.
pub fn decide(now: &DateTime<Tz>, moer_percent: Option<u8>, moer_threshold: u8) -> Decision {
    let tou_peak = is_tou_peak(now);
    let moer_high = moer_percent.is_some_and(|m| m > moer_threshold);
    let should_pause = tou_peak || moer_high;

    let mut parts = Vec::new();
    if tou_peak {
        parts.push("tou_peak".to_string());
    }
    if moer_high {
        parts.push(format!("moer>{moer_threshold}"));
    }
    let reason = if parts.is_empty() {
        "off_peak".to_string()
    } else {
        parts.join(", ")
    };

    Decision {
        tou_peak,
        moer_percent,
        moer_high,
        should_pause,
        reason,
    }
}

/// What one evaluation did, for logs and tests.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerOutcome {
    /// Heartbeat dedup suppressed an unchanged window.
    NoChange,
    /// Off-peak, nothing in flight — nothing to send.
    OffPeak,
    /// Legacy allow emitted (window cancel or forced re-send).
    Allow,
    DelayWindow { start_sc: u32, end_sc: u32 },
    /// Pause suppressed by a live charge-now override.
    ChargeNowOptout,
}

// ── Scheduler ─────────────────────────────────────────────────────────────────

pub struct Scheduler {
    store: Store,
    downlink: Arc<Downlink>,
    carbon: Arc<CarbonClient>,
    locks: DeviceLocks,
    moer_threshold: u8,
    scan_limit: usize,
}

impl Scheduler {
    pub fn new(
        store: Store,
        downlink: Arc<Downlink>,
        carbon: Arc<CarbonClient>,
        locks: DeviceLocks,
        cfg: &Config,
    ) -> Self {
        Self {
            store,
            downlink,
            carbon,
            locks,
            moer_threshold: cfg.moer_threshold,
            scan_limit: cfg.device_scan_limit,
        }
    }

    /// Tick + force-resend loop. `force_rx` carries SC short IDs.
    pub async fn run(self: Arc<Self>, mut force_rx: mpsc::Receiver<String>, interval_secs: u64) {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!("Charge scheduler started (tick every {interval_secs}s)");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick_all().await;
                }
                Some(sc_id) = force_rx.recv() => {
                    if let Some(device) = self.store.get_device(&sc_id).await {
                        if let Err(e) = self.evaluate(&device, true).await {
                            warn!("Forced scheduler run failed for {sc_id}: {e}");
                        }
                    }
                }
            }
        }
    }

    /// One scheduled tick across the active fleet.
    pub async fn tick_all(&self) {
        let devices = self.store.active_devices(self.scan_limit).await;
        if devices.is_empty() {
            return;
        }
        // one signal fetch per tick, shared across the fleet
        let moer = self.carbon.moer_percent().await;
        let now = now_mt();
        for device in devices {
            if let Err(e) = self.evaluate_at(&device, false, &now, moer).await {
                warn!("Scheduler failed for {}: {e}", device.device_id);
            }
        }
    }

    /// Out-of-band evaluation (fetches its own inputs).
    pub async fn evaluate(
        &self,
        device: &DeviceRecord,
        force_resend: bool,
    ) -> anyhow::Result<SchedulerOutcome> {
        let moer = self.carbon.moer_percent().await;
        let now = now_mt();
        self.evaluate_at(device, force_resend, &now, moer).await
    }

    /// Full §4.4 evaluation for one device at an explicit time. The device
    /// lock covers the read-modify-write and the downlink.
    pub async fn evaluate_at(
        &self,
        device: &DeviceRecord,
        force_resend: bool,
        now: &DateTime<Tz>,
        moer_percent: Option<u8>,
    ) -> anyhow::Result<SchedulerOutcome> {
        let _guard = self.locks.lock(&device.device_id).await;

        let sc_id = &device.device_id;
        let now_unix = now.timestamp();
        let decision = decide(now, moer_percent, self.moer_threshold);

        let state = self.store.get_state(sc_id).await;
        let prior = state.scheduler.clone();
        let override_until = state.charge_now_override_until;
        let override_live = override_until.is_some_and(|until| until > now_unix);
        // live overrides survive the write; expired ones are dropped
        let carried_override = if override_live { override_until } else { None };

        if decision.should_pause && override_live {
            self.write_intent(
                sc_id,
                SchedulerCommand::ChargeNowOptout,
                &decision,
                None,
                None,
                prior.as_ref().and_then(|p| p.sent_unix),
                carried_override,
                now_unix,
            )
            .await;
            self.log_command(device, SchedulerCommand::ChargeNowOptout, &decision)
                .await;
            info!("{sc_id}: pause suppressed by charge-now override");
            return Ok(SchedulerOutcome::ChargeNowOptout);
        }

        if !decision.should_pause {
            let prior_cmd = prior.as_ref().map(|p| p.last_command);
            let cancel_in_flight = prior_cmd == Some(SchedulerCommand::DelayWindow);
            let forced_allow = force_resend
                && matches!(
                    prior_cmd,
                    Some(SchedulerCommand::Allow) | Some(SchedulerCommand::DelayWindow)
                );
            if cancel_in_flight || forced_allow {
                let sent = self
                    .downlink
                    .send(&device.wireless_device_id, build_charge_allow(true), TRANSMIT_RELIABLE)
                    .await;
                // state is written even when the send failed, so the next
                // tick re-derives and divergence detection can recover
                self.write_intent(
                    sc_id,
                    SchedulerCommand::Allow,
                    &decision,
                    None,
                    None,
                    Some(now_unix),
                    carried_override,
                    now_unix,
                )
                .await;
                sent?;
                self.log_command(device, SchedulerCommand::Allow, &decision).await;
                info!("{sc_id}: allow sent ({})", decision.reason);
                return Ok(SchedulerOutcome::Allow);
            }

            self.write_intent(
                sc_id,
                SchedulerCommand::OffPeak,
                &decision,
                None,
                None,
                prior.as_ref().and_then(|p| p.sent_unix),
                carried_override,
                now_unix,
            )
            .await;
            return Ok(SchedulerOutcome::OffPeak);
        }

        // pause: build the window
        let now_sc = unix_to_sc(now_unix);
        let mut end_sc = now_sc;
        if decision.tou_peak {
            end_sc = end_sc.max(tou_peak_end_sc(now));
        }
        if decision.moer_high {
            end_sc = end_sc.max(unix_to_sc(now_unix + MOER_WINDOW_SECS));
        }

        // heartbeat dedup: same window, sent recently → the device already
        // has it (and will expire it on its own if we stay quiet)
        if !force_resend {
            if let Some(p) = &prior {
                let same_window =
                    p.last_command == SchedulerCommand::DelayWindow && p.window_end_sc == Some(end_sc);
                let recently_sent = p
                    .sent_unix
                    .is_some_and(|sent| now_unix - sent < HEARTBEAT_RESEND_SECS);
                if same_window && recently_sent {
                    self.write_intent(
                        sc_id,
                        SchedulerCommand::DelayWindow,
                        &decision,
                        p.window_start_sc,
                        p.window_end_sc,
                        p.sent_unix,
                        carried_override,
                        now_unix,
                    )
                    .await;
                    return Ok(SchedulerOutcome::NoChange);
                }
            }
        }

        let sent = self
            .downlink
            .send(
                &device.wireless_device_id,
                build_delay_window(now_sc, end_sc),
                TRANSMIT_RELIABLE,
            )
            .await;
        self.write_intent(
            sc_id,
            SchedulerCommand::DelayWindow,
            &decision,
            Some(now_sc),
            Some(end_sc),
            Some(now_unix),
            carried_override,
            now_unix,
        )
        .await;
        sent?;
        self.log_command(device, SchedulerCommand::DelayWindow, &decision).await;
        info!(
            "{sc_id}: delay window {now_sc}..{end_sc} sent ({})",
            decision.reason
        );
        Ok(SchedulerOutcome::DelayWindow {
            start_sc: now_sc,
            end_sc,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn write_intent(
        &self,
        sc_id: &str,
        command: SchedulerCommand,
        decision: &Decision,
        window_start_sc: Option<u32>,
        window_end_sc: Option<u32>,
        sent_unix: Option<i64>,
        override_until: Option<i64>,
        now_unix: i64,
    ) {
        self.store
            .update_state(sc_id, |state| {
                state.scheduler = Some(SchedulerIntent {
                    last_command: command,
                    reason: decision.reason.clone(),
                    moer_percent: decision.moer_percent,
                    tou_peak: decision.tou_peak,
                    window_start_sc,
                    window_end_sc,
                    sent_unix,
                    updated_unix: now_unix,
                });
                state.charge_now_override_until = override_until;
            })
            .await;
    }

    async fn log_command(&self, device: &DeviceRecord, command: SchedulerCommand, decision: &Decision) {
        let moer_json = match decision.moer_percent {
            Some(m) => json!(m),
            None => json!("N/A"),
        };
        let event = EventRecord::now(
            &device.device_id,
            "charge_scheduler_command",
            json!({
                "command": command.as_str(),
                "reason": decision.reason,
                "moer_percent": moer_json,
                "tou_peak": decision.tou_peak,
            }),
        )
        .with_wireless_id(&device.wireless_device_id);
        self.store.append_event(event).await;
    }
}
