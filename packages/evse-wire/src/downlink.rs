//! Non-OTA downlink builders: charge control, time sync, diagnostics request.

pub const CHARGE_CONTROL_CMD: u8 = 0x10;
pub const DELAY_WINDOW_SUBTYPE: u8 = 0x02;
pub const TIME_SYNC_CMD: u8 = 0x30;
pub const DIAG_REQUEST_CMD: u8 = 0x40;

/// Hard MTU of the wireless downlink, auth tag included.
pub const DOWNLINK_MTU: usize = 19;

/// Legacy 4-byte charge control: immediate allow / pause.
pub fn build_charge_allow(allowed: bool) -> Vec<u8> {
    vec![CHARGE_CONTROL_CMD, if allowed { 0x01 } else { 0x00 }, 0x00, 0x00]
}

/// 10-byte delay window: pause from `start_sc` until `end_sc` (device
/// epoch seconds). The device resumes on its own when the window lapses,
/// so a lost cancel never strands the charger.
pub fn build_delay_window(start_sc: u32, end_sc: u32) -> Vec<u8> {
    let mut msg = Vec::with_capacity(10);
    msg.push(CHARGE_CONTROL_CMD);
    msg.push(DELAY_WINDOW_SUBTYPE);
    msg.extend_from_slice(&start_sc.to_le_bytes());
    msg.extend_from_slice(&end_sc.to_le_bytes());
    msg
}

/// 9-byte time sync: current device epoch plus the uplink-ack watermark
/// ("all data through this second is safely stored").
pub fn build_time_sync(epoch_sc: u32, watermark_sc: u32) -> Vec<u8> {
    let mut msg = Vec::with_capacity(9);
    msg.push(TIME_SYNC_CMD);
    msg.extend_from_slice(&epoch_sc.to_le_bytes());
    msg.extend_from_slice(&watermark_sc.to_le_bytes());
    msg
}

/// 1-byte request for an immediate diagnostics uplink.
pub fn build_diag_request() -> Vec<u8> {
    vec![DIAG_REQUEST_CMD]
}
