//! Device Identity
//!
//! Every installation gets a random id the first time it syncs. The id is written
//! into each snapshot as `ownerDeviceId` and never changes afterwards.

use super::dataset::KeyValueStore;

/// Settings key holding the device id
pub const DEVICE_ID_KEY: &str = "ac:deviceId";

/// Return the persisted device id, creating one on first use
///
/// Storage failures are not fatal: a random id is returned for the lifetime of
/// the caller and a warning is logged.
pub fn get_or_create_device_id(store: &dyn KeyValueStore) -> String {
    match store.get(DEVICE_ID_KEY) {
        Ok(Some(existing)) if !existing.trim().is_empty() => return existing,
        Ok(_) => {}
        Err(e) => {
            log::warn!("Device id storage unavailable, using ephemeral id: {}", e);
            return generate_device_id();
        }
    }

    let device_id = generate_device_id();
    if let Err(e) = store.set(DEVICE_ID_KEY, &device_id) {
        log::warn!("Failed to persist device id {}: {}", device_id, e);
    } else {
        log::info!("Generated new device id: {}", device_id);
    }
    device_id
}

fn generate_device_id() -> String {
    format!("dev_{}", uuid::Uuid::new_v4().simple())
}
