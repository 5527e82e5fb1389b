//! # evse-wire
//!
//! Shared wire-format codec for the SideCharge EVSE fleet.
//!
//! These types are used by:
//! - `sidecharge-backend`: decoding uplinks from the wireless transport and
//!   building downlink commands
//! - `evse-simulator`: producing uplink frames and consuming downlinks in
//!   local end-to-end runs
//!
//! ## Wire conventions
//!
//! - All multi-byte integers are **little-endian**.
//! - Every downlink — including an optional 8-byte command-auth tag — fits
//!   the 19-byte LoRa/Sidewalk MTU ([`DOWNLINK_MTU`]).
//! - On-wire timestamps are "`_sc`" seconds: Unix seconds minus
//!   [`epoch::EPOCH_OFFSET`] (2026-01-01T00:00:00Z), a 32-bit monotonic
//!   counter that avoids wasting high bits on the link.
//!
//! ## Frame families
//!
//! | First byte | Direction | Meaning |
//! |---|---|---|
//! | `0xE5` | uplink | telemetry (versions ≤0x06, 0x07, 0x08, 0x09, 0x0A) |
//! | `0xE6` | uplink | diagnostics |
//! | `0x20` | both | OTA (subtype selects START/CHUNK/ABORT/ACK/COMPLETE/STATUS) |
//! | `0x10` | downlink | charge control (legacy allow/pause, delay window) |
//! | `0x30` | downlink | time sync |
//! | `0x40` | downlink | diagnostics request |
//!
//! Decoding is total: anything that fails a layout or sanity check comes
//! back as [`Uplink::Unknown`] with the raw bytes preserved for forensics.

pub mod auth;
pub mod diagnostics;
pub mod downlink;
pub mod epoch;
pub mod legacy;
pub mod ota;
pub mod telemetry;

pub use auth::{CommandAuthKey, CMD_AUTH_KEY_SIZE, CMD_AUTH_TAG_SIZE};
pub use diagnostics::{DiagnosticsFrame, DIAG_MAGIC};
pub use downlink::{
    build_charge_allow, build_delay_window, build_diag_request, build_time_sync,
    CHARGE_CONTROL_CMD, DELAY_WINDOW_SUBTYPE, DIAG_REQUEST_CMD, DOWNLINK_MTU, TIME_SYNC_CMD,
};
pub use epoch::{sc_to_unix, unix_to_sc, EPOCH_OFFSET};
pub use legacy::LegacyTelemetry;
pub use ota::{
    build_ota_abort, build_ota_chunk, build_ota_start, OtaAck, OtaComplete, OtaStartParams,
    OtaStatusCode, OtaStatusReport, OtaUplink, OTA_CMD, OTA_CHUNK_DATA_MAX,
};
pub use telemetry::{PilotState, TelemetryFrame, TransitionReason, TELEMETRY_MAGIC};

use serde::{Deserialize, Serialize};

/// A decoded uplink payload.
///
/// Exhaustive: every uplink handler in the backend matches all variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Uplink {
    Telemetry(TelemetryFrame),
    Diagnostics(DiagnosticsFrame),
    Ota(OtaUplink),
    /// Pre-versioned envelope found by the variable-offset scan.
    Legacy(LegacyTelemetry),
    /// Anything the decoder could not make sense of. Raw bytes are kept so
    /// the event log can store them for forensics.
    Unknown { raw: Vec<u8> },
}

impl Uplink {
    /// Short name used in logs and event rows.
    pub fn kind(&self) -> &'static str {
        match self {
            Uplink::Telemetry(_) => "telemetry",
            Uplink::Diagnostics(_) => "diagnostics",
            Uplink::Ota(_) => "ota",
            Uplink::Legacy(_) => "legacy",
            Uplink::Unknown { .. } => "unknown",
        }
    }
}

/// Decode a raw uplink payload (post base64, straight off the transport).
///
/// Handles the ASCII-hex wrapping some legacy firmware applies before
/// dispatching on the first byte. Never fails — see [`Uplink::Unknown`].
pub fn decode_payload(raw: &[u8]) -> Uplink {
    let unwrapped;
    let bytes: &[u8] = match legacy::unwrap_ascii_hex(raw) {
        Some(b) => {
            unwrapped = b;
            &unwrapped
        }
        None => raw,
    };

    if bytes.is_empty() {
        return Uplink::Unknown { raw: raw.to_vec() };
    }

    match bytes[0] {
        TELEMETRY_MAGIC => match TelemetryFrame::parse(bytes) {
            Some(frame) => Uplink::Telemetry(frame),
            None => Uplink::Unknown { raw: bytes.to_vec() },
        },
        DIAG_MAGIC => match DiagnosticsFrame::parse(bytes) {
            Some(frame) => Uplink::Diagnostics(frame),
            None => Uplink::Unknown { raw: bytes.to_vec() },
        },
        OTA_CMD => match OtaUplink::parse(bytes) {
            Some(msg) => Uplink::Ota(msg),
            None => Uplink::Unknown { raw: bytes.to_vec() },
        },
        _ => match legacy::parse_legacy(bytes) {
            Some(frame) => Uplink::Legacy(frame),
            None => Uplink::Unknown { raw: bytes.to_vec() },
        },
    }
}

/// Read a little-endian u16 at `offset`. Caller guarantees bounds.
pub(crate) fn read_u16(raw: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([raw[offset], raw[offset + 1]])
}

/// Read a little-endian u32 at `offset`. Caller guarantees bounds.
pub(crate) fn read_u32(raw: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([raw[offset], raw[offset + 1], raw[offset + 2], raw[offset + 3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_telemetry() {
        let raw = [0xE5, 0x01, 0x01, 0xA4, 0x0B, 0x00, 0x00, 0x00];
        match decode_payload(&raw) {
            Uplink::Telemetry(t) => {
                assert_eq!(t.state, PilotState::A);
                assert_eq!(t.pilot_mv, 2980);
            }
            other => panic!("expected telemetry, got {other:?}"),
        }
    }

    #[test]
    fn dispatch_garbage_is_unknown() {
        let raw = [0xAB, 0xCD];
        match decode_payload(&raw) {
            Uplink::Unknown { raw: kept } => assert_eq!(kept, vec![0xAB, 0xCD]),
            other => panic!("expected unknown, got {other:?}"),
        }
    }

    #[test]
    fn dispatch_empty_is_unknown() {
        assert!(matches!(decode_payload(&[]), Uplink::Unknown { .. }));
    }

    #[test]
    fn ascii_hex_wrapped_telemetry() {
        // "e50101a40b000000" as ASCII bytes
        let wrapped = b"e50101a40b000000";
        match decode_payload(wrapped) {
            Uplink::Telemetry(t) => assert_eq!(t.pilot_mv, 2980),
            other => panic!("expected telemetry, got {other:?}"),
        }
    }

    #[test]
    fn short_telemetry_keeps_raw() {
        let raw = [0xE5, 0x01, 0x01];
        match decode_payload(&raw) {
            Uplink::Unknown { raw: kept } => assert_eq!(kept.len(), 3),
            other => panic!("expected unknown, got {other:?}"),
        }
    }
}
