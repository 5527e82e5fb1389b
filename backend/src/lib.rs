//! SideCharge cloud orchestrator.
//!
//! Cloud side of a demand-response EV-charger fleet running on constrained
//! LoRa/Sidewalk nodes (≤19 B MTU, intermittent connectivity). Five
//! components form an event-driven pipeline:
//!
//! 1. Codec (`evse-wire` crate) — uplink decode, downlink build
//! 2. Device identity (`registry`) — SC-XXXXXXXX short IDs, auto-provisioning
//! 3. State store (`store`) — durable per-device snapshot + event log
//! 4. Scheduler (`scheduler`) — TOU/MOER charging decisions, delay windows
//! 5. OTA engine (`ota`) — chunked, resumable delta firmware transfer
//!
//! Uplinks arrive as UDP envelopes (`uplink`), flow through identity and
//! state writes, and trigger the closed-loop pieces in `convergence`:
//! divergence re-sends, charge-now overrides, time sync, and interlock
//! transition logging. Downlinks flow back out through the `downlink`
//! gateway, which enforces the MTU law and optional command auth.

pub mod carbon;
pub mod clock;
pub mod config;
pub mod convergence;
pub mod downlink;
pub mod locks;
pub mod objectstore;
pub mod ota;
pub mod registry;
pub mod scheduler;
pub mod state;
pub mod store;
pub mod uplink;
