//! Diagnostics frame (magic `0xE6`) decoding.
//!
//! 15-byte layout:
//!
//! ```text
//! byte 0      magic 0xE6
//! byte 1      diag format version
//! bytes 2-3   app version (u16 LE)
//! bytes 4-7   uptime seconds (u32 LE)
//! bytes 8-9   boot count (u16 LE)
//! byte 10     last error code
//! byte 11     state flags (7 named bits)
//! byte 12     pending events in the device ring buffer
//! byte 13     app build
//! byte 14     platform build
//! ```

use serde::{Deserialize, Serialize};

use crate::{read_u16, read_u32};

pub const DIAG_MAGIC: u8 = 0xE6;

const DIAG_LEN: usize = 15;

/// One decoded diagnostics frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticsFrame {
    pub diag_version: u8,
    pub app_version: u16,
    pub uptime_seconds: u32,
    pub boot_count: u16,
    pub last_error_code: u8,
    pub event_buffer_pending: u8,
    pub app_build: u8,
    pub platform_build: u8,
    // state flags, bit 0 upward
    pub sidewalk_ready: bool,
    pub charge_allowed: bool,
    pub charge_now: bool,
    pub interlock_active: bool,
    pub selftest_pass: bool,
    pub ota_in_progress: bool,
    pub time_synced: bool,
}

impl DiagnosticsFrame {
    pub fn parse(raw: &[u8]) -> Option<Self> {
        if raw.len() < DIAG_LEN || raw[0] != DIAG_MAGIC {
            return None;
        }
        let flags = raw[11];
        Some(Self {
            diag_version: raw[1],
            app_version: read_u16(raw, 2),
            uptime_seconds: read_u32(raw, 4),
            boot_count: read_u16(raw, 8),
            last_error_code: raw[10],
            event_buffer_pending: raw[12],
            app_build: raw[13],
            platform_build: raw[14],
            sidewalk_ready: flags & 0x01 != 0,
            charge_allowed: flags & 0x02 != 0,
            charge_now: flags & 0x04 != 0,
            interlock_active: flags & 0x08 != 0,
            selftest_pass: flags & 0x10 != 0,
            ota_in_progress: flags & 0x20 != 0,
            time_synced: flags & 0x40 != 0,
        })
    }

    /// Human name for the last error code. Codes mirror the four fault
    /// sources; anything newer than this build is preserved as `unknown_N`.
    pub fn last_error_name(&self) -> String {
        match self.last_error_code {
            0 => "none".into(),
            1 => "sensor".into(),
            2 => "clamp_mismatch".into(),
            3 => "interlock".into(),
            4 => "selftest".into(),
            code => format!("unknown_{code}"),
        }
    }
}
