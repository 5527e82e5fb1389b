//! Device identity: deterministic short IDs and registry provisioning.
//!
//! `SC-XXXXXXXX` where the 8 hex chars are the uppercase first 32 bits of
//! SHA-256 over the transport UUID. Deterministic, so every handler can
//! derive it locally; collision odds are negligible at fleet sizes ≤10⁴.

use sha2::{Digest, Sha256};
use tracing::info;

use crate::clock::now_iso_utc;
use crate::state::{DeviceRecord, DeviceStatus};
use crate::store::Store;

/// Derive the SC short ID from a transport UUID.
pub fn short_id(wireless_device_id: &str) -> String {
    let digest = Sha256::digest(wireless_device_id.as_bytes());
    format!("SC-{}", hex::encode_upper(&digest[..4]))
}

/// Look up a device, auto-provisioning on first uplink. Owner fields are
/// left absent on create so unowned devices stay out of owner queries.
pub async fn get_or_create(
    store: &Store,
    wireless_device_id: &str,
    network_id: &str,
) -> DeviceRecord {
    let sc_id = short_id(wireless_device_id);
    if let Some(existing) = store.get_device(&sc_id).await {
        return existing;
    }

    let now = now_iso_utc();
    let record = DeviceRecord {
        device_id: sc_id.clone(),
        wireless_device_id: wireless_device_id.to_string(),
        network_id: network_id.to_string(),
        status: DeviceStatus::Active,
        last_seen: now.clone(),
        app_version: 0,
        created_at: now,
        owner_name: None,
        owner_email: None,
    };
    store.put_device(record.clone()).await;
    info!("Auto-provisioned device {sc_id} (wireless={wireless_device_id})");
    record
}

/// Touch last-seen (and app version when reported). Partial update — owner
/// metadata is never rewritten here.
pub async fn update_last_seen(store: &Store, wireless_device_id: &str, app_version: Option<u32>) {
    let sc_id = short_id(wireless_device_id);
    let now = now_iso_utc();
    store
        .update_device(&sc_id, |record| {
            record.last_seen = now;
            if let Some(version) = app_version {
                record.app_version = version;
            }
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_id_is_deterministic() {
        let a = short_id("b319d001-6b08-4d88-b4ca-4d2d98a6d43c");
        let b = short_id("b319d001-6b08-4d88-b4ca-4d2d98a6d43c");
        assert_eq!(a, b);
        assert!(a.starts_with("SC-"));
        assert_eq!(a.len(), 11);
        assert!(a[3..].chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
    }

    #[test]
    fn known_vector() {
        // sha256("test-device-id")[..4] = 7c810ac9
        assert_eq!(short_id("test-device-id"), "SC-7C810AC9");
    }

    #[test]
    fn distinct_uuids_distinct_ids() {
        assert_ne!(short_id("device-a"), short_id("device-b"));
    }

    #[tokio::test]
    async fn get_or_create_provisions_once() {
        let store = Store::in_memory();
        let first = get_or_create(&store, "uuid-1", "sid-001").await;
        assert_eq!(first.status, DeviceStatus::Active);
        assert_eq!(first.network_id, "sid-001");
        assert!(first.owner_email.is_none());

        let again = get_or_create(&store, "uuid-1", "ignored").await;
        assert_eq!(again.network_id, "sid-001");
        assert_eq!(store.active_devices(10).await.len(), 1);
    }

    #[tokio::test]
    async fn last_seen_updates_without_touching_owner() {
        let store = Store::in_memory();
        get_or_create(&store, "uuid-1", "").await;
        let sc = short_id("uuid-1");
        store
            .update_device(&sc, |d| d.owner_email = Some("owner@example.com".into()))
            .await;

        update_last_seen(&store, "uuid-1", Some(7)).await;
        let after = store.get_device(&sc).await.unwrap();
        assert_eq!(after.app_version, 7);
        assert_eq!(after.owner_email.as_deref(), Some("owner@example.com"));
    }
}
