//! device.rs — simulated EVSE node.
//!
//! Models the firmware behaviors the cloud orchestrator cares about:
//! J1772 telemetry uplinks, charge-control windows (with self-expiry),
//! time sync, and the chunked OTA receive path with ACK/COMPLETE replies.
//! The node builds the same byte layouts the real firmware emits; the
//! `evse-wire` builders stay cloud-side only.

use tracing::{debug, info, warn};

use evse_wire::{unix_to_sc, CommandAuthKey};

const TELEMETRY_VERSION: u8 = 0x0A;
const DIAG_VERSION: u8 = 0x01;

// ── OTA receive state ─────────────────────────────────────────────────────────

struct OtaReceive {
    total_chunks: u16,
    chunks_received: u16,
    fw_crc32: u32,
}

// ── Device ────────────────────────────────────────────────────────────────────

pub struct EvseDevice {
    pub app_build: u8,
    pub platform_build: u8,
    /// None until a TIME_SYNC lands (frames carry epoch 0 before that).
    clock_sc: Option<u32>,
    charge_allowed: bool,
    /// Active delay window end, device epoch seconds.
    window_end_sc: Option<u32>,
    /// Set for one frame after charge_allowed changes.
    pending_transition: u8,
    charge_now_latched: bool,
    boot_count: u16,
    uptime_s: u32,
    ota: Option<OtaReceive>,
    /// When set, the next OTA chunk is answered with NO_SESSION (models a
    /// reboot that lost the session).
    pub drop_session_once: bool,
    auth: Option<CommandAuthKey>,
}

/// Uplink bytes the device wants to transmit in reaction to a downlink.
pub type Reply = Option<Vec<u8>>;

impl EvseDevice {
    pub fn new(app_build: u8, auth: Option<CommandAuthKey>) -> Self {
        Self {
            app_build,
            platform_build: 1,
            clock_sc: None,
            charge_allowed: true,
            window_end_sc: None,
            pending_transition: 0,
            charge_now_latched: false,
            boot_count: 1,
            uptime_s: 0,
            ota: None,
            drop_session_once: false,
            auth,
        }
    }

    /// Advance the device clock by one second of wall time.
    pub fn tick(&mut self, now_unix: i64) {
        self.uptime_s += 1;
        if let Some(clock) = self.clock_sc.as_mut() {
            *clock = unix_to_sc(now_unix);
        }
        // delay windows expire on their own; the device resumes without
        // waiting for a cloud cancel
        if let (Some(end), Some(clock)) = (self.window_end_sc, self.clock_sc) {
            if clock >= end {
                info!("sim: delay window expired, resuming charge");
                self.window_end_sc = None;
                self.set_charge_allowed(true, 4); // auto_resume
            }
        }
    }

    /// Operator pressed the charge-now button.
    pub fn press_charge_now(&mut self) {
        info!("sim: charge-now pressed");
        self.charge_now_latched = true;
        self.window_end_sc = None;
        self.set_charge_allowed(true, 3); // charge_now
    }

    fn set_charge_allowed(&mut self, allowed: bool, reason: u8) {
        if self.charge_allowed != allowed {
            self.charge_allowed = allowed;
            self.pending_transition = reason;
        }
    }

    // ── Uplink builders ───────────────────────────────────────────────────────

    /// v0x0A telemetry frame.
    pub fn telemetry_frame(&mut self, pilot_state: u8, pilot_mv: u16, current_ma: u16) -> Vec<u8> {
        let mut flags = 0u8;
        flags |= 0x02; // cool call, matching a summer profile
        if self.charge_allowed {
            flags |= 0x04;
        }
        if self.charge_now_latched {
            flags |= 0x08;
        }

        let mut frame = vec![0xE5, TELEMETRY_VERSION, pilot_state];
        frame.extend_from_slice(&pilot_mv.to_le_bytes());
        frame.extend_from_slice(&current_ma.to_le_bytes());
        frame.push(flags);
        frame.extend_from_slice(&self.clock_sc.unwrap_or(0).to_le_bytes());
        frame.push(std::mem::take(&mut self.pending_transition));
        frame.push(self.app_build);
        frame.push(self.platform_build);

        self.charge_now_latched = false;
        frame
    }

    pub fn diagnostics_frame(&self) -> Vec<u8> {
        let mut flags = 0x01u8; // sidewalk_ready
        if self.charge_allowed {
            flags |= 0x02;
        }
        flags |= 0x10; // selftest_pass
        if self.ota.is_some() {
            flags |= 0x20;
        }
        if self.clock_sc.is_some() {
            flags |= 0x40;
        }

        let mut frame = vec![0xE6, DIAG_VERSION];
        frame.extend_from_slice(&(self.app_build as u16).to_le_bytes());
        frame.extend_from_slice(&self.uptime_s.to_le_bytes());
        frame.extend_from_slice(&self.boot_count.to_le_bytes());
        frame.push(0); // last error: none
        frame.push(flags);
        frame.push(0); // event buffer drained
        frame.push(self.app_build);
        frame.push(self.platform_build);
        frame
    }

    // ── Downlink handling ─────────────────────────────────────────────────────

    /// Process one downlink; returns an immediate uplink reply when the
    /// protocol calls for one.
    pub fn handle_downlink(&mut self, payload: &[u8]) -> Reply {
        if payload.is_empty() {
            return None;
        }
        match payload[0] {
            0x10 => {
                let Some(cmd) = self.verify_charge_control(payload) else {
                    warn!("sim: charge-control auth failed, dropping");
                    return None;
                };
                self.handle_charge_control(&cmd);
                None
            }
            0x30 if payload.len() >= 9 => {
                let epoch = u32::from_le_bytes([payload[1], payload[2], payload[3], payload[4]]);
                info!("sim: time sync (epoch_sc={epoch})");
                self.clock_sc = Some(epoch);
                None
            }
            0x40 => Some(self.diagnostics_frame()),
            0x20 => self.handle_ota(payload),
            other => {
                debug!("sim: unknown downlink cmd 0x{other:02x}");
                None
            }
        }
    }

    /// Strip and check the auth tag when a key is provisioned.
    fn verify_charge_control(&self, payload: &[u8]) -> Option<Vec<u8>> {
        match &self.auth {
            None => Some(payload.to_vec()),
            Some(key) => {
                if key.verify(payload) {
                    Some(payload[..payload.len() - 8].to_vec())
                } else {
                    None
                }
            }
        }
    }

    fn handle_charge_control(&mut self, cmd: &[u8]) {
        match cmd.get(1) {
            Some(0x02) if cmd.len() >= 10 => {
                let start = u32::from_le_bytes([cmd[2], cmd[3], cmd[4], cmd[5]]);
                let end = u32::from_le_bytes([cmd[6], cmd[7], cmd[8], cmd[9]]);
                info!("sim: delay window {start}..{end}");
                self.window_end_sc = Some(end);
                self.set_charge_allowed(false, 2); // delay_window
            }
            Some(&allow) => {
                info!("sim: charge control allow={}", allow == 1);
                self.window_end_sc = None;
                self.set_charge_allowed(allow == 1, 1); // cloud_cmd
            }
            None => {}
        }
    }

    fn handle_ota(&mut self, payload: &[u8]) -> Reply {
        match payload.get(1) {
            // START
            Some(0x01) if payload.len() >= 18 => {
                let total = u16::from_le_bytes([payload[6], payload[7]]);
                let crc = u32::from_le_bytes([payload[10], payload[11], payload[12], payload[13]]);
                info!("sim: OTA START ({total} chunks)");
                self.ota = Some(OtaReceive {
                    total_chunks: total,
                    chunks_received: 0,
                    fw_crc32: crc,
                });
                if total == 0 {
                    // nothing to transfer: apply immediately
                    return Some(self.ota_complete(0, crc));
                }
                Some(self.ota_ack(0))
            }
            // CHUNK
            Some(0x02) if payload.len() >= 4 => {
                if self.drop_session_once {
                    self.drop_session_once = false;
                    self.ota = None;
                    warn!("sim: dropping OTA session (simulated reboot)");
                    return Some(self.ota_ack_status(3)); // NO_SESSION
                }
                let Some(ota) = self.ota.as_mut() else {
                    return Some(self.ota_ack_status(3));
                };
                ota.chunks_received += 1;
                debug!("sim: chunk {}/{}", ota.chunks_received, ota.total_chunks);
                if ota.chunks_received >= ota.total_chunks {
                    let crc = ota.fw_crc32;
                    self.boot_count += 1;
                    return Some(self.ota_complete(0, crc));
                }
                Some(self.ota_ack(0))
            }
            // ABORT
            Some(0x03) => {
                info!("sim: OTA aborted by cloud");
                self.ota = None;
                None
            }
            _ => None,
        }
    }

    fn ota_ack(&self, status: i8) -> Vec<u8> {
        let (next, received) = match &self.ota {
            Some(ota) => (ota.chunks_received, ota.chunks_received),
            None => (0, 0),
        };
        let mut msg = vec![0x20, 0x80, status as u8];
        msg.extend_from_slice(&next.to_le_bytes());
        msg.extend_from_slice(&received.to_le_bytes());
        msg
    }

    fn ota_ack_status(&self, status: i8) -> Vec<u8> {
        self.ota_ack(status)
    }

    fn ota_complete(&mut self, result: i8, crc: u32) -> Vec<u8> {
        info!("sim: OTA COMPLETE (result={result})");
        self.ota = None;
        let mut msg = vec![0x20, 0x81, result as u8];
        msg.extend_from_slice(&crc.to_le_bytes());
        msg
    }
}
