//! Scheduler behavior against the store and a recording transport:
//! TOU/MOER decisions, delay windows, heartbeat dedup, charge-now opt-out,
//! and forced re-sends.

mod common;

use std::sync::Arc;

use chrono::{DateTime, TimeZone};
use chrono_tz::Tz;
use tempfile::tempdir;

use common::{provision, test_config, wiring};
use sidecharge_backend::carbon::CarbonClient;
use sidecharge_backend::clock::{tou_peak_end_sc, MT};
use sidecharge_backend::scheduler::{Scheduler, SchedulerOutcome};
use sidecharge_backend::state::{SchedulerCommand, SchedulerIntent};
use evse_wire::unix_to_sc;

fn mt(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Tz> {
    MT.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
}

struct Rig {
    _dir: tempfile::TempDir,
    wiring: common::Wiring,
    scheduler: Scheduler,
}

fn rig() -> Rig {
    let dir = tempdir().unwrap();
    let cfg = test_config(dir.path());
    let wiring = wiring();
    let scheduler = Scheduler::new(
        wiring.store.clone(),
        wiring.downlink.clone(),
        Arc::new(CarbonClient::new(&cfg)),
        wiring.locks.clone(),
        &cfg,
    );
    Rig {
        _dir: dir,
        wiring,
        scheduler,
    }
}

fn intent(cmd: SchedulerCommand) -> SchedulerIntent {
    SchedulerIntent {
        last_command: cmd,
        reason: String::new(),
        moer_percent: None,
        tou_peak: false,
        window_start_sc: None,
        window_end_sc: None,
        sent_unix: None,
        updated_unix: 0,
    }
}

#[tokio::test]
async fn on_peak_sends_delay_window_to_9pm() {
    let rig = rig();
    let device = provision(&rig.wiring.store).await;
    let now = mt(2026, 2, 16, 18, 0); // Monday 6 PM

    let outcome = rig
        .scheduler
        .evaluate_at(&device, false, &now, None)
        .await
        .unwrap();

    let expected_end = tou_peak_end_sc(&now);
    assert_eq!(
        outcome,
        SchedulerOutcome::DelayWindow {
            start_sc: unix_to_sc(now.timestamp()),
            end_sc: expected_end
        }
    );

    let sent = rig.wiring.transport.sent().await;
    assert_eq!(sent.len(), 1);
    let payload = &sent[0].payload;
    assert_eq!(payload.len(), 10);
    assert_eq!(payload[0], 0x10);
    assert_eq!(payload[1], 0x02);
    let start = u32::from_le_bytes(payload[2..6].try_into().unwrap());
    let end = u32::from_le_bytes(payload[6..10].try_into().unwrap());
    assert_eq!(start, unix_to_sc(now.timestamp()));
    assert_eq!(end, expected_end);

    let state = rig.wiring.store.get_state(&device.device_id).await;
    let intent = state.scheduler.unwrap();
    assert_eq!(intent.last_command, SchedulerCommand::DelayWindow);
    assert_eq!(intent.window_end_sc, Some(expected_end));
    assert_eq!(intent.sent_unix, Some(now.timestamp()));
    assert_eq!(intent.reason, "tou_peak");

    let events = rig
        .wiring
        .store
        .events_by_type("charge_scheduler_command")
        .await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].data["command"], "delay_window");
    assert_eq!(events[0].data["moer_percent"], "N/A");
}

#[tokio::test]
async fn off_peak_no_prior_state_sends_nothing() {
    let rig = rig();
    let device = provision(&rig.wiring.store).await;
    let now = mt(2026, 2, 16, 10, 0);

    let outcome = rig
        .scheduler
        .evaluate_at(&device, false, &now, None)
        .await
        .unwrap();

    assert_eq!(outcome, SchedulerOutcome::OffPeak);
    assert!(rig.wiring.transport.sent().await.is_empty());
    let state = rig.wiring.store.get_state(&device.device_id).await;
    assert_eq!(
        state.scheduler.unwrap().last_command,
        SchedulerCommand::OffPeak
    );
}

#[tokio::test]
async fn off_peak_cancels_active_window_with_legacy_allow() {
    let rig = rig();
    let device = provision(&rig.wiring.store).await;
    rig.wiring
        .store
        .update_state(&device.device_id, |s| {
            s.scheduler = Some(intent(SchedulerCommand::DelayWindow));
        })
        .await;

    let now = mt(2026, 2, 16, 10, 0);
    let outcome = rig
        .scheduler
        .evaluate_at(&device, false, &now, None)
        .await
        .unwrap();

    assert_eq!(outcome, SchedulerOutcome::Allow);
    let sent = rig.wiring.transport.sent().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].payload, vec![0x10, 0x01, 0x00, 0x00]);

    let state = rig.wiring.store.get_state(&device.device_id).await;
    let after = state.scheduler.unwrap();
    assert_eq!(after.last_command, SchedulerCommand::Allow);
    assert_eq!(after.sent_unix, Some(now.timestamp()));
}

#[tokio::test]
async fn high_moer_off_peak_sends_30_minute_window() {
    let rig = rig();
    let device = provision(&rig.wiring.store).await;
    let now = mt(2026, 2, 16, 10, 0);

    let outcome = rig
        .scheduler
        .evaluate_at(&device, false, &now, Some(85))
        .await
        .unwrap();

    let now_sc = unix_to_sc(now.timestamp());
    assert_eq!(
        outcome,
        SchedulerOutcome::DelayWindow {
            start_sc: now_sc,
            end_sc: now_sc + 1800
        }
    );
    let events = rig
        .wiring
        .store
        .events_by_type("charge_scheduler_command")
        .await;
    assert_eq!(events[0].data["reason"], "moer>70");
    assert_eq!(events[0].data["moer_percent"], 85);
}

#[tokio::test]
async fn tou_plus_moer_uses_longer_window() {
    let rig = rig();
    let device = provision(&rig.wiring.store).await;
    let now = mt(2026, 2, 16, 18, 0); // peak: 3 h left > 30 min MOER window

    let outcome = rig
        .scheduler
        .evaluate_at(&device, false, &now, Some(85))
        .await
        .unwrap();

    assert_eq!(
        outcome,
        SchedulerOutcome::DelayWindow {
            start_sc: unix_to_sc(now.timestamp()),
            end_sc: tou_peak_end_sc(&now)
        }
    );
}

#[tokio::test]
async fn heartbeat_dedup_suppresses_unchanged_window() {
    let rig = rig();
    let device = provision(&rig.wiring.store).await;
    let now = mt(2026, 2, 16, 18, 0);
    let end_sc = tou_peak_end_sc(&now);

    rig.wiring
        .store
        .update_state(&device.device_id, |s| {
            s.scheduler = Some(SchedulerIntent {
                last_command: SchedulerCommand::DelayWindow,
                window_end_sc: Some(end_sc),
                window_start_sc: Some(end_sc - 10_000),
                sent_unix: Some(now.timestamp() - 300), // 5 min ago
                ..intent(SchedulerCommand::DelayWindow)
            });
        })
        .await;

    let outcome = rig
        .scheduler
        .evaluate_at(&device, false, &now, None)
        .await
        .unwrap();

    assert_eq!(outcome, SchedulerOutcome::NoChange);
    assert!(rig.wiring.transport.sent().await.is_empty());
    // state still refreshed
    let state = rig.wiring.store.get_state(&device.device_id).await;
    assert_eq!(state.scheduler.unwrap().updated_unix, now.timestamp());
}

#[tokio::test]
async fn stale_heartbeat_resends_window() {
    let rig = rig();
    let device = provision(&rig.wiring.store).await;
    let now = mt(2026, 2, 16, 18, 30);
    let end_sc = tou_peak_end_sc(&now);

    rig.wiring
        .store
        .update_state(&device.device_id, |s| {
            s.scheduler = Some(SchedulerIntent {
                last_command: SchedulerCommand::DelayWindow,
                window_end_sc: Some(end_sc),
                sent_unix: Some(now.timestamp() - 2000), // ~33 min ago
                ..intent(SchedulerCommand::DelayWindow)
            });
        })
        .await;

    let outcome = rig
        .scheduler
        .evaluate_at(&device, false, &now, None)
        .await
        .unwrap();

    assert!(matches!(outcome, SchedulerOutcome::DelayWindow { .. }));
    assert_eq!(rig.wiring.transport.sent().await.len(), 1);
}

#[tokio::test]
async fn force_resend_bypasses_heartbeat_dedup() {
    let rig = rig();
    let device = provision(&rig.wiring.store).await;
    let now = mt(2026, 2, 16, 18, 0);
    let end_sc = tou_peak_end_sc(&now);

    rig.wiring
        .store
        .update_state(&device.device_id, |s| {
            s.scheduler = Some(SchedulerIntent {
                last_command: SchedulerCommand::DelayWindow,
                window_end_sc: Some(end_sc),
                sent_unix: Some(now.timestamp() - 60),
                ..intent(SchedulerCommand::DelayWindow)
            });
        })
        .await;

    let outcome = rig
        .scheduler
        .evaluate_at(&device, true, &now, None)
        .await
        .unwrap();

    assert!(matches!(outcome, SchedulerOutcome::DelayWindow { .. }));
    assert_eq!(rig.wiring.transport.sent().await.len(), 1);
}

#[tokio::test]
async fn force_resend_off_peak_resends_allow() {
    let rig = rig();
    let device = provision(&rig.wiring.store).await;
    rig.wiring
        .store
        .update_state(&device.device_id, |s| {
            s.scheduler = Some(intent(SchedulerCommand::Allow));
        })
        .await;

    let now = mt(2026, 2, 16, 10, 0);
    let outcome = rig
        .scheduler
        .evaluate_at(&device, true, &now, None)
        .await
        .unwrap();

    assert_eq!(outcome, SchedulerOutcome::Allow);
    assert_eq!(
        rig.wiring.transport.sent().await[0].payload,
        vec![0x10, 0x01, 0x00, 0x00]
    );
}

#[tokio::test]
async fn off_peak_allow_state_without_force_stays_quiet() {
    let rig = rig();
    let device = provision(&rig.wiring.store).await;
    rig.wiring
        .store
        .update_state(&device.device_id, |s| {
            s.scheduler = Some(intent(SchedulerCommand::Allow));
        })
        .await;

    let now = mt(2026, 2, 16, 10, 0);
    let outcome = rig
        .scheduler
        .evaluate_at(&device, false, &now, None)
        .await
        .unwrap();

    assert_eq!(outcome, SchedulerOutcome::OffPeak);
    assert!(rig.wiring.transport.sent().await.is_empty());
}

// ── Charge-now opt-out guard ──────────────────────────────────────────────────

#[tokio::test]
async fn live_override_suppresses_peak_pause() {
    let rig = rig();
    let device = provision(&rig.wiring.store).await;
    let now = mt(2026, 2, 16, 18, 0);
    let override_until = now.timestamp() + 3600;

    rig.wiring
        .store
        .update_state(&device.device_id, |s| {
            s.scheduler = Some(intent(SchedulerCommand::DelayWindow));
            s.charge_now_override_until = Some(override_until);
        })
        .await;

    let outcome = rig
        .scheduler
        .evaluate_at(&device, false, &now, None)
        .await
        .unwrap();

    assert_eq!(outcome, SchedulerOutcome::ChargeNowOptout);
    assert!(rig.wiring.transport.sent().await.is_empty());

    let state = rig.wiring.store.get_state(&device.device_id).await;
    assert_eq!(
        state.scheduler.as_ref().unwrap().last_command,
        SchedulerCommand::ChargeNowOptout
    );
    // live override survives the write
    assert_eq!(state.charge_now_override_until, Some(override_until));
}

#[tokio::test]
async fn expired_override_resumes_scheduling_and_is_dropped() {
    let rig = rig();
    let device = provision(&rig.wiring.store).await;
    let now = mt(2026, 2, 16, 18, 0);

    rig.wiring
        .store
        .update_state(&device.device_id, |s| {
            s.scheduler = Some(intent(SchedulerCommand::DelayWindow));
            s.charge_now_override_until = Some(now.timestamp() - 60);
        })
        .await;

    let outcome = rig
        .scheduler
        .evaluate_at(&device, false, &now, None)
        .await
        .unwrap();

    assert!(matches!(outcome, SchedulerOutcome::DelayWindow { .. }));
    assert_eq!(rig.wiring.transport.sent().await.len(), 1);
    let state = rig.wiring.store.get_state(&device.device_id).await;
    assert_eq!(state.charge_now_override_until, None);
}

#[tokio::test]
async fn override_suppresses_moer_pause_and_heartbeat() {
    let rig = rig();
    let device = provision(&rig.wiring.store).await;
    let now = mt(2026, 2, 16, 18, 30);
    let end_sc = tou_peak_end_sc(&now);

    rig.wiring
        .store
        .update_state(&device.device_id, |s| {
            s.scheduler = Some(SchedulerIntent {
                last_command: SchedulerCommand::DelayWindow,
                window_end_sc: Some(end_sc),
                sent_unix: Some(now.timestamp() - 2000), // stale: would re-send
                ..intent(SchedulerCommand::DelayWindow)
            });
            s.charge_now_override_until = Some(now.timestamp() + 1800);
        })
        .await;

    let outcome = rig
        .scheduler
        .evaluate_at(&device, false, &now, Some(85))
        .await
        .unwrap();

    assert_eq!(outcome, SchedulerOutcome::ChargeNowOptout);
    assert!(rig.wiring.transport.sent().await.is_empty());
}

#[tokio::test]
async fn override_does_not_suppress_off_peak_cancel() {
    let rig = rig();
    let device = provision(&rig.wiring.store).await;
    let now = mt(2026, 2, 16, 10, 0);

    rig.wiring
        .store
        .update_state(&device.device_id, |s| {
            s.scheduler = Some(intent(SchedulerCommand::DelayWindow));
            s.charge_now_override_until = Some(now.timestamp() + 3600);
        })
        .await;

    let outcome = rig
        .scheduler
        .evaluate_at(&device, false, &now, None)
        .await
        .unwrap();

    assert_eq!(outcome, SchedulerOutcome::Allow);
    assert_eq!(rig.wiring.transport.sent().await.len(), 1);
    // the override is still live off-peak, so it is preserved
    let state = rig.wiring.store.get_state(&device.device_id).await;
    assert_eq!(state.charge_now_override_until, Some(now.timestamp() + 3600));
}

#[tokio::test]
async fn two_ticks_same_peak_emit_one_downlink() {
    let rig = rig();
    let device = provision(&rig.wiring.store).await;
    let t1 = mt(2026, 2, 16, 18, 0);
    let t2 = mt(2026, 2, 16, 18, 5);

    rig.scheduler
        .evaluate_at(&device, false, &t1, None)
        .await
        .unwrap();
    let second = rig
        .scheduler
        .evaluate_at(&device, false, &t2, None)
        .await
        .unwrap();

    assert_eq!(second, SchedulerOutcome::NoChange);
    assert_eq!(rig.wiring.transport.sent().await.len(), 1);
}
