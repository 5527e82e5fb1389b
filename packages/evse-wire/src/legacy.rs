//! Legacy uplink fallbacks.
//!
//! Two pre-versioned firmware behaviors survive in the field:
//!
//! 1. A demo-protocol envelope with a variable-length header in front of a
//!    7-byte telemetry record tagged `0x01`. The header length varies by
//!    link type, so the record is found by scanning.
//! 2. Payloads ASCII-hex encoded before transport framing.
//!
//! Both paths are best-effort: a failed scan yields nothing and the caller
//! records the payload as unknown.

use serde::{Deserialize, Serialize};

use crate::read_u16;
use crate::telemetry::{PilotState, CURRENT_MA_SANE, PILOT_MV_MAX};

const LEGACY_TYPE: u8 = 0x01;
const RECORD_LEN: usize = 7;

/// Telemetry recovered from the legacy envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyTelemetry {
    pub state: PilotState,
    pub pilot_mv: u16,
    pub current_ma: u16,
    pub thermostat_bits: u8,
    pub thermostat_heat: bool,
    pub thermostat_cool: bool,
    /// Where in the envelope the record was found, kept for forensics.
    pub offset: usize,
}

/// Scan for the legacy record. The type byte alone is a weak marker, so the
/// candidate must also pass the telemetry sanity bounds before it is
/// accepted.
pub fn parse_legacy(raw: &[u8]) -> Option<LegacyTelemetry> {
    if raw.len() < RECORD_LEN {
        return None;
    }
    for offset in 0..=(raw.len() - RECORD_LEN) {
        if raw[offset] != LEGACY_TYPE {
            continue;
        }
        let Some(state) = PilotState::from_code(raw[offset + 1]) else {
            continue;
        };
        let pilot_mv = read_u16(raw, offset + 2);
        let current_ma = read_u16(raw, offset + 4);
        if pilot_mv > PILOT_MV_MAX || current_ma as u32 > CURRENT_MA_SANE {
            continue;
        }
        let thermostat_bits = raw[offset + 6];
        return Some(LegacyTelemetry {
            state,
            pilot_mv,
            current_ma,
            thermostat_bits,
            thermostat_heat: thermostat_bits & 0x01 != 0,
            thermostat_cool: thermostat_bits & 0x02 != 0,
            offset,
        });
    }
    None
}

/// Detect an ASCII-hex wrapped payload and return the unwrapped bytes.
pub fn unwrap_ascii_hex(raw: &[u8]) -> Option<Vec<u8>> {
    if raw.len() < 2 || raw.len() % 2 != 0 {
        return None;
    }
    if !raw.iter().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let text = std::str::from_utf8(raw).ok()?;
    hex::decode(text).ok()
}
