//! OTA messages (command byte `0x20`): device uplinks and cloud downlinks.
//!
//! Downlinks:
//! - START `[0x20, 0x01, size u32, total_chunks u16, chunk_size u16,
//!   crc32 u32, version u32, (flags)]` — 18 B, or 19 B when the flags byte
//!   is present (bit 0 = image carries an appended ED25519 signature).
//! - CHUNK `[0x20, 0x02, chunk_idx u16, data…]` — 4-byte header, ≤15 B data.
//!   No per-chunk CRC; the link AEAD covers transit and the final CRC32
//!   validates the assembled image.
//! - ABORT `[0x20, 0x03]`.
//!
//! Uplinks:
//! - ACK `[0x20, 0x80, status i8, next_chunk u16, chunks_received u16]`
//! - COMPLETE `[0x20, 0x81, result i8, crc32_calc u32]`
//! - STATUS `[0x20, 0x82, phase i8, chunks_received u16, total_chunks u16,
//!   app_version u32]`

use serde::{Deserialize, Serialize};

use crate::downlink::DOWNLINK_MTU;
use crate::{read_u16, read_u32};

pub const OTA_CMD: u8 = 0x20;

// Downlink subtypes
pub const OTA_SUB_START: u8 = 0x01;
pub const OTA_SUB_CHUNK: u8 = 0x02;
pub const OTA_SUB_ABORT: u8 = 0x03;

// Uplink subtypes
pub const OTA_SUB_ACK: u8 = 0x80;
pub const OTA_SUB_COMPLETE: u8 = 0x81;
pub const OTA_SUB_STATUS: u8 = 0x82;

/// Chunk header is cmd + subtype + u16 index.
pub const OTA_CHUNK_HEADER: usize = 4;
/// Max chunk data that still fits the 19-byte MTU.
pub const OTA_CHUNK_DATA_MAX: usize = DOWNLINK_MTU - OTA_CHUNK_HEADER;

/// START flags bit 0: image has a trailing 64-byte ED25519 signature the
/// device must verify before applying.
pub const OTA_START_FLAG_SIGNED: u8 = 0x01;

const ACK_LEN: usize = 7;
const COMPLETE_LEN: usize = 7;
const STATUS_LEN: usize = 11;

// ── Status codes ──────────────────────────────────────────────────────────────

/// Device-reported OTA status, used in ACK `status` and COMPLETE `result`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OtaStatusCode {
    Ok,
    CrcErr,
    FlashErr,
    /// Device has no live session (reboot, storage loss). The cloud answers
    /// with a fresh START, never a chunk.
    NoSession,
    SizeErr,
    Other(i8),
}

impl OtaStatusCode {
    pub fn from_raw(raw: i8) -> Self {
        match raw {
            0 => Self::Ok,
            1 => Self::CrcErr,
            2 => Self::FlashErr,
            3 => Self::NoSession,
            4 => Self::SizeErr,
            other => Self::Other(other),
        }
    }

    pub fn raw(&self) -> i8 {
        match self {
            Self::Ok => 0,
            Self::CrcErr => 1,
            Self::FlashErr => 2,
            Self::NoSession => 3,
            Self::SizeErr => 4,
            Self::Other(v) => *v,
        }
    }

    pub fn name(&self) -> String {
        match self {
            Self::Ok => "ok".into(),
            Self::CrcErr => "crc_err".into(),
            Self::FlashErr => "flash_err".into(),
            Self::NoSession => "no_session".into(),
            Self::SizeErr => "size_err".into(),
            Self::Other(v) => format!("status_{v}"),
        }
    }
}

// ── Uplink messages ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OtaAck {
    pub status: OtaStatusCode,
    /// Chunk the device expects next. In delta mode this is a sequence
    /// counter, not an absolute chunk index.
    pub next_chunk: u16,
    pub chunks_received: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OtaComplete {
    pub result: OtaStatusCode,
    /// CRC32 the device computed over the assembled image.
    pub crc32_calc: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OtaStatusReport {
    pub phase: i8,
    pub chunks_received: u16,
    pub total_chunks: u16,
    pub app_version: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum OtaUplink {
    Ack(OtaAck),
    Complete(OtaComplete),
    Status(OtaStatusReport),
}

impl OtaUplink {
    /// Parse an OTA uplink. `None` for unknown subtypes or short frames.
    pub fn parse(raw: &[u8]) -> Option<Self> {
        if raw.len() < 2 || raw[0] != OTA_CMD {
            return None;
        }
        match raw[1] {
            OTA_SUB_ACK if raw.len() >= ACK_LEN => Some(Self::Ack(OtaAck {
                status: OtaStatusCode::from_raw(raw[2] as i8),
                next_chunk: read_u16(raw, 3),
                chunks_received: read_u16(raw, 5),
            })),
            OTA_SUB_COMPLETE if raw.len() >= COMPLETE_LEN => Some(Self::Complete(OtaComplete {
                result: OtaStatusCode::from_raw(raw[2] as i8),
                crc32_calc: read_u32(raw, 3),
            })),
            OTA_SUB_STATUS if raw.len() >= STATUS_LEN => Some(Self::Status(OtaStatusReport {
                phase: raw[2] as i8,
                chunks_received: read_u16(raw, 3),
                total_chunks: read_u16(raw, 5),
                app_version: read_u32(raw, 7),
            })),
            _ => None,
        }
    }
}

// ── Downlink builders ─────────────────────────────────────────────────────────

/// Parameters for an OTA START downlink.
#[derive(Debug, Clone, Copy)]
pub struct OtaStartParams {
    pub size: u32,
    pub total_chunks: u16,
    pub chunk_size: u16,
    pub crc32: u32,
    pub version: u32,
    /// `Some` appends the 19th flags byte.
    pub flags: Option<u8>,
}

pub fn build_ota_start(params: &OtaStartParams) -> Vec<u8> {
    let mut msg = Vec::with_capacity(19);
    msg.push(OTA_CMD);
    msg.push(OTA_SUB_START);
    msg.extend_from_slice(&params.size.to_le_bytes());
    msg.extend_from_slice(&params.total_chunks.to_le_bytes());
    msg.extend_from_slice(&params.chunk_size.to_le_bytes());
    msg.extend_from_slice(&params.crc32.to_le_bytes());
    msg.extend_from_slice(&params.version.to_le_bytes());
    if let Some(flags) = params.flags {
        msg.push(flags);
    }
    msg
}

/// Build an OTA CHUNK downlink. Callers keep `data` within
/// [`OTA_CHUNK_DATA_MAX`]; the MTU gate at the transport rejects oversize.
pub fn build_ota_chunk(chunk_idx: u16, data: &[u8]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(OTA_CHUNK_HEADER + data.len());
    msg.push(OTA_CMD);
    msg.push(OTA_SUB_CHUNK);
    msg.extend_from_slice(&chunk_idx.to_le_bytes());
    msg.extend_from_slice(data);
    msg
}

pub fn build_ota_abort() -> Vec<u8> {
    vec![OTA_CMD, OTA_SUB_ABORT]
}
