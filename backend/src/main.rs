use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::routing::get;
use axum::Router;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{info, warn};

use sidecharge_backend::carbon::CarbonClient;
use sidecharge_backend::config::Config;
use sidecharge_backend::convergence::Convergence;
use sidecharge_backend::downlink::{Downlink, UdpTransport};
use sidecharge_backend::locks::DeviceLocks;
use sidecharge_backend::objectstore::{FirmwareWatcher, ObjectStore};
use sidecharge_backend::ota::cache::{FirmwareCache, DEFAULT_CACHE_CAPACITY};
use sidecharge_backend::ota::OtaEngine;
use sidecharge_backend::scheduler::Scheduler;
use sidecharge_backend::store::Store;
use sidecharge_backend::uplink::{run_uplink_hub, UplinkPipeline};

// ─── Global startup time (for uptime reporting) ──────────────────────────────
static STARTUP_MS: AtomicU64 = AtomicU64::new(0);

// ─── Ops endpoints ────────────────────────────────────────────────────────────

async fn time_sync() -> axum::Json<serde_json::Value> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    axum::Json(json!({ "serverTime": now }))
}

async fn health_check() -> axum::Json<serde_json::Value> {
    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    let startup = STARTUP_MS.load(Ordering::Relaxed);
    let uptime_secs = if startup > 0 { (now_ms - startup) / 1000 } else { 0 };
    axum::Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeSecs": uptime_secs,
    }))
}

// ─── Main ─────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    let startup_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    STARTUP_MS.store(startup_ms, Ordering::Relaxed);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sidecharge_backend=info".into()),
        )
        .init();

    let cfg = Config::from_env();
    info!(
        "⚡ SideCharge orchestrator v{} starting — data dir {}",
        env!("CARGO_PKG_VERSION"),
        cfg.data_dir.display()
    );

    // Shared infrastructure
    let store = Store::open(&cfg.store_path()).await;
    let locks = DeviceLocks::new();
    let objects = ObjectStore::new(cfg.bucket_root());
    let cache = FirmwareCache::new(cfg.firmware_tmp_dir(), DEFAULT_CACHE_CAPACITY);

    let transport = match UdpTransport::bind(&cfg.downlink_addr).await {
        Ok(t) => Arc::new(t),
        Err(e) => {
            warn!("Downlink transport bind failed: {e}");
            return;
        }
    };
    let downlink = Arc::new(Downlink::new(transport, cfg.cmd_auth_key.clone()));
    if cfg.cmd_auth_key.is_some() {
        info!("Command auth enabled for charge-control downlinks");
    }

    // Divergence → scheduler force-resend channel
    let (force_tx, force_rx) = mpsc::channel::<String>(64);

    // OTA engine
    let ota = Arc::new(OtaEngine::new(
        store.clone(),
        downlink.clone(),
        objects.clone(),
        cache,
        locks.clone(),
        &cfg,
    ));

    // Uplink pipeline + hub
    let convergence = Convergence::new(store.clone(), downlink.clone(), force_tx);
    let pipeline = Arc::new(UplinkPipeline::new(
        store.clone(),
        convergence,
        ota.clone(),
        locks.clone(),
    ));
    tokio::spawn(run_uplink_hub(cfg.uplink_udp_port, pipeline));

    // Charge scheduler (tick + forced re-sends)
    let carbon = Arc::new(CarbonClient::new(&cfg));
    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        downlink.clone(),
        carbon,
        locks.clone(),
        &cfg,
    ));
    tokio::spawn(scheduler.run(force_rx, cfg.scheduler_interval_secs));

    // OTA retry timer
    {
        let ota = ota.clone();
        let interval_secs = cfg.ota_retry_interval_secs;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                ota.retry_tick().await;
            }
        });
    }

    // New-firmware watcher (the object-store trigger surface)
    {
        let ota = ota.clone();
        let objects = objects.clone();
        let poll_secs = cfg.firmware_poll_secs;
        tokio::spawn(async move {
            let mut watcher = FirmwareWatcher::new("firmware");
            let mut ticker = tokio::time::interval(Duration::from_secs(poll_secs));
            loop {
                ticker.tick().await;
                for key in watcher.poll(&objects).await {
                    info!("New firmware object: {key}");
                    ota.handle_new_image(&key).await;
                }
            }
        });
    }

    // Ops router
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/sync", get(time_sync));
    let addr = format!("0.0.0.0:{}", cfg.http_port);
    info!("🚀 Ops endpoints on {addr}");
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            warn!("HTTP bind failed on {addr}: {e}");
            return;
        }
    };
    if let Err(e) = axum::serve(listener, app).await {
        warn!("HTTP server exited: {e}");
    }
}
