//! BLE Service and Characteristic UUIDs.
//!
//! Contains the UUID constants and discovery predicates for Holman tap timers.

use uuid::Uuid;

/// Holman tap timer GATT service UUID.
pub const HOLMAN_SERVICE_UUID: Uuid = Uuid::from_u128(0x0a75f000_f9ad_467a_e564_3c19163ad543);

/// Tap state characteristic UUID (Read).
pub const STATE_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x0000_f004_0000_1000_8000_00805f9b34fb);

/// Manual watering characteristic UUID (Write).
pub const MANUAL_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x0000_f006_0000_1000_8000_00805f9b34fb);

/// Service UUIDs used to filter BLE scans.
pub const SERVICE_UUIDS: [Uuid; 1] = [HOLMAN_SERVICE_UUID];

/// Alias every Holman tap timer advertises.
pub const TAP_TIMER_ALIAS: &str = "Tap Timer";

/// Check if a service UUID is the Holman service.
pub fn is_holman_service(uuid: &Uuid) -> bool {
    *uuid == HOLMAN_SERVICE_UUID
}

/// Check if advertised data identifies a Holman tap timer.
///
/// A device matches when its alias is exactly [`TAP_TIMER_ALIAS`] or when it
/// advertises the Holman service.
pub fn is_tap_timer(local_name: Option<&str>, services: &[Uuid]) -> bool {
    local_name == Some(TAP_TIMER_ALIAS) || services.iter().any(is_holman_service)
}
