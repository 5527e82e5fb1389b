//! Downlink gateway: the opaque unicast channel to a device.
//!
//! The gateway wraps a raw transport behind one chokepoint that
//!
//! 1. appends the command-auth tag to charge-control payloads when a key is
//!    configured,
//! 2. enforces the 19-byte MTU law on the final framed bytes,
//! 3. logs every TX as hex, matching what a protocol analyst sees on air.
//!
//! `transmit_mode` mirrors the transport API: 0 = best-effort,
//! 1 = link-layer retried. Charge control and OTA use 1.

use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tracing::debug;

use evse_wire::{CommandAuthKey, CHARGE_CONTROL_CMD, DOWNLINK_MTU};

pub const TRANSMIT_BEST_EFFORT: u8 = 0;
pub const TRANSMIT_RELIABLE: u8 = 1;

#[derive(Debug, Error)]
pub enum DownlinkError {
    #[error("payload is {0} bytes, exceeds {DOWNLINK_MTU}-byte MTU")]
    Oversize(usize),
    #[error("transport send failed: {0}")]
    Transport(String),
}

/// Raw unicast transport. Implementations: UDP gateway, recording mock.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        wireless_device_id: &str,
        payload: &[u8],
        transmit_mode: u8,
    ) -> Result<(), DownlinkError>;
}

// ── Gateway ───────────────────────────────────────────────────────────────────

pub struct Downlink {
    transport: Arc<dyn Transport>,
    auth: Option<CommandAuthKey>,
}

impl Downlink {
    pub fn new(transport: Arc<dyn Transport>, auth: Option<CommandAuthKey>) -> Self {
        Self { transport, auth }
    }

    /// Frame and send one downlink.
    pub async fn send(
        &self,
        wireless_device_id: &str,
        payload: Vec<u8>,
        transmit_mode: u8,
    ) -> Result<(), DownlinkError> {
        let framed = self.frame(payload);
        if framed.len() > DOWNLINK_MTU {
            return Err(DownlinkError::Oversize(framed.len()));
        }
        debug!(
            "TX: {} ({}B) -> {wireless_device_id}",
            hex::encode(&framed),
            framed.len()
        );
        self.transport
            .send(wireless_device_id, &framed, transmit_mode)
            .await
    }

    /// Charge-control commands get the auth tag when a key is configured.
    fn frame(&self, payload: Vec<u8>) -> Vec<u8> {
        match (&self.auth, payload.first()) {
            (Some(key), Some(&CHARGE_CONTROL_CMD)) => key.append_tag(payload),
            _ => payload,
        }
    }
}

// ── UDP transport ─────────────────────────────────────────────────────────────

/// Sends JSON downlink envelopes over UDP to the wireless gateway (or the
/// device simulator in local runs).
pub struct UdpTransport {
    socket: UdpSocket,
    gateway_addr: String,
}

impl UdpTransport {
    pub async fn bind(gateway_addr: &str) -> std::io::Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        Ok(Self {
            socket,
            gateway_addr: gateway_addr.to_string(),
        })
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send(
        &self,
        wireless_device_id: &str,
        payload: &[u8],
        transmit_mode: u8,
    ) -> Result<(), DownlinkError> {
        let envelope = serde_json::json!({
            "wireless_device_id": wireless_device_id,
            "payload_data": B64.encode(payload),
            "transmit_mode": transmit_mode,
        });
        let bytes =
            serde_json::to_vec(&envelope).map_err(|e| DownlinkError::Transport(e.to_string()))?;
        self.socket
            .send_to(&bytes, &self.gateway_addr)
            .await
            .map_err(|e| DownlinkError::Transport(e.to_string()))?;
        Ok(())
    }
}

// ── Recording transport (tests, dry runs) ─────────────────────────────────────

/// One recorded downlink.
#[derive(Debug, Clone, PartialEq)]
pub struct SentDownlink {
    pub wireless_device_id: String,
    pub payload: Vec<u8>,
    pub transmit_mode: u8,
}

/// Captures downlinks instead of sending them.
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<SentDownlink>>,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn sent(&self) -> Vec<SentDownlink> {
        self.sent.lock().await.clone()
    }

    pub async fn clear(&self) {
        self.sent.lock().await.clear();
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(
        &self,
        wireless_device_id: &str,
        payload: &[u8],
        transmit_mode: u8,
    ) -> Result<(), DownlinkError> {
        self.sent.lock().await.push(SentDownlink {
            wireless_device_id: wireless_device_id.to_string(),
            payload: payload.to_vec(),
            transmit_mode,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evse_wire::{build_charge_allow, build_delay_window, build_time_sync, CMD_AUTH_KEY_SIZE};

    #[tokio::test]
    async fn sends_untagged_without_key() {
        let transport = RecordingTransport::new();
        let downlink = Downlink::new(transport.clone(), None);
        downlink
            .send("dev-1", build_charge_allow(true), TRANSMIT_RELIABLE)
            .await
            .unwrap();
        let sent = transport.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].payload, vec![0x10, 0x01, 0x00, 0x00]);
        assert_eq!(sent[0].transmit_mode, TRANSMIT_RELIABLE);
    }

    #[tokio::test]
    async fn tags_charge_control_when_key_present() {
        let key = CommandAuthKey::new([7u8; CMD_AUTH_KEY_SIZE]);
        let transport = RecordingTransport::new();
        let downlink = Downlink::new(transport.clone(), Some(key.clone()));

        downlink
            .send("dev-1", build_charge_allow(true), TRANSMIT_RELIABLE)
            .await
            .unwrap();
        downlink
            .send("dev-1", build_delay_window(1, 2), TRANSMIT_RELIABLE)
            .await
            .unwrap();

        let sent = transport.sent().await;
        assert_eq!(sent[0].payload.len(), 12);
        assert!(key.verify(&sent[0].payload));
        assert_eq!(sent[1].payload.len(), 18);
        assert!(key.verify(&sent[1].payload));
    }

    #[tokio::test]
    async fn non_charge_payloads_stay_untagged() {
        let key = CommandAuthKey::new([7u8; CMD_AUTH_KEY_SIZE]);
        let transport = RecordingTransport::new();
        let downlink = Downlink::new(transport.clone(), Some(key));
        downlink
            .send("dev-1", build_time_sync(1, 1), TRANSMIT_BEST_EFFORT)
            .await
            .unwrap();
        assert_eq!(transport.sent().await[0].payload.len(), 9);
    }

    #[tokio::test]
    async fn oversize_rejected() {
        let transport = RecordingTransport::new();
        let downlink = Downlink::new(transport.clone(), None);
        let err = downlink
            .send("dev-1", vec![0u8; DOWNLINK_MTU + 1], TRANSMIT_RELIABLE)
            .await
            .unwrap_err();
        assert!(matches!(err, DownlinkError::Oversize(20)));
        assert!(transport.sent().await.is_empty());
    }
}
