//! main.rs — EVSE device simulator entry point.
//!
//! Runs two concurrent loops against a local backend:
//!   1. Telemetry loop: sends a v0x0A frame every `--interval` seconds
//!      (plus a diagnostics frame every 10th uplink)
//!   2. Downlink loop: listens on the gateway UDP port, feeds payloads to
//!      the device model, and uplinks any protocol replies (OTA ACKs etc.)
//!
//! Scenario flags exercise the orchestrator's recovery paths: `--loss`
//! drops downlinks to trip the retry timer, `--drop-session` makes the
//! device forget its OTA session once mid-transfer, `--charge-now-after`
//! presses the override button.

mod device;
mod link;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::interval;
use tracing::{info, warn};

use device::EvseDevice;
use evse_wire::CommandAuthKey;
use link::{DownlinkListener, UplinkSender};

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "evse-sim", about = "SideCharge EVSE device simulator")]
struct Args {
    /// Backend uplink hub address
    #[arg(long, default_value = "127.0.0.1:5880")]
    hub_addr: String,
    /// Local UDP port for downlinks (the backend's DOWNLINK_GATEWAY_ADDR)
    #[arg(long, default_value = "5881")]
    listen_port: u16,
    /// Transport device UUID; pin it for a stable SC-ID across runs
    /// (default: random per run)
    #[arg(long)]
    device_uuid: Option<String>,
    /// Telemetry interval, seconds
    #[arg(long, default_value = "15")]
    interval: u64,
    /// Reported app build version
    #[arg(long, default_value = "1")]
    app_build: u8,
    /// Downlink loss probability 0.0–1.0
    #[arg(long, default_value = "0.0")]
    loss: f64,
    /// Forget the OTA session at the first chunk (NO_SESSION recovery test)
    #[arg(long)]
    drop_session: bool,
    /// Press the charge-now button after N seconds
    #[arg(long)]
    charge_now_after: Option<u64>,
    /// Command-auth key, hex (64 chars), matching the backend's CMD_AUTH_KEY
    #[arg(long)]
    auth_key: Option<String>,
}

// ── Main ──────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "evse_simulator=info".into()),
        )
        .init();

    let args = Args::parse();

    let auth = args.auth_key.as_deref().map(|hex_key| {
        CommandAuthKey::from_hex(hex_key).unwrap_or_else(|e| {
            eprintln!("bad --auth-key: {e}");
            std::process::exit(2);
        })
    });

    let device_uuid = args
        .device_uuid
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    info!(
        "🔌 EVSE simulator starting — uuid {device_uuid}, hub {}, downlinks on :{}",
        args.hub_addr, args.listen_port
    );

    let mut dev = EvseDevice::new(args.app_build, auth);
    dev.drop_session_once = args.drop_session;
    let device = Arc::new(Mutex::new(dev));

    let uplink = match UplinkSender::bind(&args.hub_addr, &device_uuid).await {
        Ok(tx) => Arc::new(tx),
        Err(e) => {
            warn!("uplink bind failed: {e}");
            return;
        }
    };

    // Downlink listener task
    {
        let device = device.clone();
        let uplink = uplink.clone();
        let loss = args.loss;
        let listener = match DownlinkListener::bind(args.listen_port).await {
            Ok(l) => l,
            Err(e) => {
                warn!("downlink bind failed: {e}");
                return;
            }
        };
        tokio::spawn(async move {
            loop {
                let Some(payload) = listener.recv().await else {
                    continue;
                };
                if loss > 0.0 && rand::thread_rng().gen_bool(loss.clamp(0.0, 1.0)) {
                    info!("sim: downlink lost on air ({} B)", payload.len());
                    continue;
                }
                let reply = device.lock().await.handle_downlink(&payload);
                if let Some(reply) = reply {
                    uplink.send(&reply).await;
                }
            }
        });
    }

    // Charge-now button task
    if let Some(after) = args.charge_now_after {
        let device = device.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(after)).await;
            device.lock().await.press_charge_now();
        });
    }

    // Telemetry loop
    let mut ticker = interval(Duration::from_secs(args.interval.max(1)));
    let mut seconds = interval(Duration::from_secs(1));
    let mut uplinks: u64 = 0;
    loop {
        tokio::select! {
            _ = seconds.tick() => {
                let now = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs() as i64;
                device.lock().await.tick(now);
            }
            _ = ticker.tick() => {
                uplinks += 1;
                let mut dev = device.lock().await;
                // vehicle connected and drawing current in this profile
                let frame = dev.telemetry_frame(3, 1489, 15_000);
                let diag = (uplinks % 10 == 0).then(|| dev.diagnostics_frame());
                drop(dev);

                uplink.send(&frame).await;
                if let Some(diag) = diag {
                    uplink.send(&diag).await;
                }
            }
        }
    }
}
