//! link.rs — UDP plumbing between the simulator and the backend.
//!
//! Uplinks are the JSON envelopes the backend's hub expects; downlinks are
//! the JSON envelopes the backend's UDP transport emits. Send errors are
//! logged and never crash the sim.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use serde::Deserialize;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

pub struct UplinkSender {
    socket: UdpSocket,
    hub_addr: String,
    device_uuid: String,
    network_id: String,
}

impl UplinkSender {
    pub async fn bind(hub_addr: &str, device_uuid: &str) -> std::io::Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        Ok(Self {
            socket,
            hub_addr: hub_addr.to_string(),
            device_uuid: device_uuid.to_string(),
            network_id: format!("sid-{}", &device_uuid[..8.min(device_uuid.len())]),
        })
    }

    pub async fn send(&self, payload: &[u8]) {
        let envelope = serde_json::json!({
            "wireless_device_id": self.device_uuid,
            "payload_data": B64.encode(payload),
            "link_type": "LORA",
            "rssi": -82,
            "seq": 0,
            "network_id": self.network_id,
        });
        let bytes = match serde_json::to_vec(&envelope) {
            Ok(b) => b,
            Err(e) => {
                warn!("uplink serialize failed: {e}");
                return;
            }
        };
        match self.socket.send_to(&bytes, &self.hub_addr).await {
            Ok(_) => debug!("uplink → {} ({} B payload)", self.hub_addr, payload.len()),
            Err(e) => warn!("uplink send failed: {e}"),
        }
    }
}

#[derive(Debug, Deserialize)]
struct DownlinkEnvelope {
    #[serde(default)]
    payload_data: String,
}

pub struct DownlinkListener {
    socket: UdpSocket,
}

impl DownlinkListener {
    pub async fn bind(port: u16) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", port)).await?;
        Ok(Self { socket })
    }

    /// Receive one downlink payload (raw bytes, post-base64).
    pub async fn recv(&self) -> Option<Vec<u8>> {
        let mut buf = vec![0u8; 1024];
        let (len, src) = match self.socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                warn!("downlink recv error: {e}");
                return None;
            }
        };
        let envelope: DownlinkEnvelope = match serde_json::from_slice(&buf[..len]) {
            Ok(env) => env,
            Err(e) => {
                debug!("malformed downlink from {src}: {e}");
                return None;
            }
        };
        match B64.decode(envelope.payload_data.as_bytes()) {
            Ok(payload) => Some(payload),
            Err(e) => {
                debug!("bad downlink base64: {e}");
                None
            }
        }
    }
}
