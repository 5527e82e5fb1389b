//! Telemetry frame (magic `0xE5`) decoding.
//!
//! The frame evolved through several firmware generations; the version byte
//! selects the layout. Common core (all versions):
//!
//! ```text
//! byte 0     magic 0xE5
//! byte 1     version
//! byte 2     J1772 pilot state (0..=6)
//! bytes 3-4  pilot voltage, mV (u16 LE, sane ≤ 15 000)
//! bytes 5-6  current draw, mA (u16 LE, sane ≤ 100 000)
//! byte 7     flags
//! ```
//!
//! - v ≥ 0x07 adds bytes 8-11: device epoch seconds (`_sc`, 0 = unsynced)
//! - v ≥ 0x09 adds byte 12: transition reason
//! - v ≥ 0x0A adds bytes 13-14: app / platform build versions
//!
//! Flags byte: bits 0-1 thermostat heat/cool (heat is reserved from v0x08
//! on), bits 2-3 charge-allowed / charge-now (v ≥ 0x07), bits 4-7 the four
//! fault flags. Frames whose state code or analog values fail the sanity
//! bounds parse to `None` — the caller records them as unknown, never as a
//! clamped reading.

use serde::{Deserialize, Serialize};

use crate::epoch::sc_to_unix;
use crate::read_u16;
use crate::read_u32;

pub const TELEMETRY_MAGIC: u8 = 0xE5;

pub const PILOT_MV_MAX: u16 = 15_000;
pub const CURRENT_MA_SANE: u32 = 100_000;

const LEN_BASIC: usize = 8; // versions ≤ 0x06
const LEN_V07: usize = 12;
const LEN_V09: usize = 13;
const LEN_V0A: usize = 15;

// ── J1772 pilot state ─────────────────────────────────────────────────────────

/// J1772 pilot states. Code 0 is the firmware's "could not classify".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PilotState {
    Unknown,
    /// No vehicle (12 V)
    A,
    /// Vehicle connected, not ready (9 V)
    B,
    /// Vehicle ready, charging (6 V)
    C,
    /// Vehicle ready, ventilation required (3 V)
    D,
    /// Error — short circuit
    E,
    /// Error — no pilot
    F,
}

impl PilotState {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Unknown),
            1 => Some(Self::A),
            2 => Some(Self::B),
            3 => Some(Self::C),
            4 => Some(Self::D),
            5 => Some(Self::E),
            6 => Some(Self::F),
            _ => None,
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::A => 1,
            Self::B => 2,
            Self::C => 3,
            Self::D => 4,
            Self::E => 5,
            Self::F => 6,
        }
    }

    /// Letter used in event rows and dashboards.
    pub fn letter(&self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::A => "A",
            Self::B => "B",
            Self::C => "C",
            Self::D => "D",
            Self::E => "E",
            Self::F => "F",
        }
    }
}

// ── Transition reason ─────────────────────────────────────────────────────────

/// Why `charge_allowed` just changed, reported alongside the state that
/// resulted. Unknown codes are preserved rather than dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransitionReason {
    None,
    CloudCmd,
    DelayWindow,
    ChargeNow,
    AutoResume,
    Manual,
    Unrecognized(u8),
}

impl TransitionReason {
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => Self::None,
            1 => Self::CloudCmd,
            2 => Self::DelayWindow,
            3 => Self::ChargeNow,
            4 => Self::AutoResume,
            5 => Self::Manual,
            other => Self::Unrecognized(other),
        }
    }

    pub fn name(&self) -> String {
        match self {
            Self::None => "none".into(),
            Self::CloudCmd => "cloud_cmd".into(),
            Self::DelayWindow => "delay_window".into(),
            Self::ChargeNow => "charge_now".into(),
            Self::AutoResume => "auto_resume".into(),
            Self::Manual => "manual".into(),
            Self::Unrecognized(code) => format!("unknown_{code}"),
        }
    }
}

// ── Telemetry frame ───────────────────────────────────────────────────────────

/// One decoded telemetry frame. Optional fields are absent on wire versions
/// that predate them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryFrame {
    pub version: u8,
    pub state: PilotState,
    pub pilot_mv: u16,
    pub current_ma: u16,
    /// Raw flags byte, kept for event rows.
    pub flags: u8,
    /// Thermostat bits only (control/fault bits masked out).
    pub thermostat_bits: u8,
    /// Heat call. Reserved (absent) from v0x08 on.
    pub thermostat_heat: Option<bool>,
    pub thermostat_cool: bool,
    /// v ≥ 0x07
    pub charge_allowed: Option<bool>,
    /// v ≥ 0x07
    pub charge_now: Option<bool>,
    pub fault_sensor: bool,
    pub fault_clamp_mismatch: bool,
    pub fault_interlock: bool,
    pub fault_selftest_fail: bool,
    /// Device `_sc` epoch seconds; `Some(0)` means the device is unsynced.
    pub device_epoch: Option<u32>,
    /// v ≥ 0x09
    pub transition_reason: Option<TransitionReason>,
    /// v ≥ 0x0A
    pub app_build: Option<u8>,
    /// v ≥ 0x0A
    pub platform_build: Option<u8>,
}

impl TelemetryFrame {
    /// Parse a telemetry frame. `None` on any layout or sanity failure.
    pub fn parse(raw: &[u8]) -> Option<Self> {
        if raw.len() < LEN_BASIC || raw[0] != TELEMETRY_MAGIC {
            return None;
        }
        let version = raw[1];

        let required = match version {
            v if v >= 0x0A => LEN_V0A,
            0x09 => LEN_V09,
            0x07 | 0x08 => LEN_V07,
            _ => LEN_BASIC,
        };
        if raw.len() < required {
            return None;
        }

        let state = PilotState::from_code(raw[2])?;
        let pilot_mv = read_u16(raw, 3);
        let current_ma = read_u16(raw, 5);
        if pilot_mv > PILOT_MV_MAX || current_ma as u32 > CURRENT_MA_SANE {
            return None;
        }

        let flags = raw[7];
        let has_heat = version <= 0x07;
        let heat = if has_heat { Some(flags & 0x01 != 0) } else { None };
        let cool = flags & 0x02 != 0;
        let thermostat_bits = if has_heat { flags & 0x03 } else { flags & 0x02 };

        let (charge_allowed, charge_now) = if version >= 0x07 {
            (Some(flags & 0x04 != 0), Some(flags & 0x08 != 0))
        } else {
            (None, None)
        };

        let device_epoch = if version >= 0x07 {
            Some(read_u32(raw, 8))
        } else {
            None
        };

        let transition_reason = if version >= 0x09 {
            Some(TransitionReason::from_code(raw[12]))
        } else {
            None
        };

        let (app_build, platform_build) = if version >= 0x0A {
            (Some(raw[13]), Some(raw[14]))
        } else {
            (None, None)
        };

        Some(Self {
            version,
            state,
            pilot_mv,
            current_ma,
            flags,
            thermostat_bits,
            thermostat_heat: heat,
            thermostat_cool: cool,
            charge_allowed,
            charge_now,
            fault_sensor: flags & 0x10 != 0,
            fault_clamp_mismatch: flags & 0x20 != 0,
            fault_interlock: flags & 0x40 != 0,
            fault_selftest_fail: flags & 0x80 != 0,
            device_epoch,
            transition_reason,
            app_build,
            platform_build,
        })
    }

    /// Device wall clock as Unix seconds, when the device has synced.
    pub fn device_unix(&self) -> Option<i64> {
        match self.device_epoch {
            Some(0) | None => None,
            Some(epoch) => Some(sc_to_unix(epoch)),
        }
    }

    /// True when any of the four fault flags is raised.
    pub fn any_fault(&self) -> bool {
        self.fault_sensor
            || self.fault_clamp_mismatch
            || self.fault_interlock
            || self.fault_selftest_fail
    }
}
