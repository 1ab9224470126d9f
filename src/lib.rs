// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # holman-ble
//!
//! A Rust library for controlling Holman Bluetooth tap timers via
//! Bluetooth Low Energy.
//!
//! ## Features
//!
//! - **Discovery**: Find nearby tap timers, each reported once
//! - **Connection management**: Connect, disconnect and optionally
//!   reconnect whenever the link drops
//! - **Manual watering**: Turn the tap on for up to 255 minutes, or off
//! - **State**: Read whether the tap is currently running
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use holman_ble::{parse_address, ManagerConfig, Result, TapTimerManager};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let manager = TapTimerManager::new(ManagerConfig::default()).await?;
//!
//!     let tap_timer = manager.tap_timer(parse_address("AA:BB:CC:DD:EE:FF")?).await?;
//!     tap_timer.connect().await?;
//!
//!     // Water for ten minutes
//!     tap_timer.start(10).await?;
//!     println!("Tap is {}", tap_timer.state());
//!
//!     tap_timer.disconnect().await?;
//!     Ok(())
//! }
//! ```
//!
//! Links dropped by the device are only noticed while
//! [`TapTimerManager::run`] is processing adapter events.
//!
//! ## Platform Notes
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group. Adapters
//! are selected by name, e.g. `hci0`.
//!
//! ### macOS
//! Requires Bluetooth permission. macOS hides MAC addresses from
//! applications, so lookups by address only work on Linux and Windows.
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization/deserialization for data types

// Public modules
pub mod ble;
pub mod config;
pub mod error;
pub mod listener;
pub mod protocol;
pub mod tap_timer;
pub mod tap_timer_manager;
pub mod utils;

// Re-exports for convenience
pub use config::ManagerConfig;
pub use error::{Error, Result};
pub use listener::{TapTimerListener, TapTimerManagerListener};
pub use tap_timer::{CallbackHandle, TapTimer};
pub use tap_timer_manager::TapTimerManager;
pub use utils::parse_address;

// Re-export commonly used types from submodules
pub use ble::connection::ConnectionState;
pub use ble::uuids::{
    HOLMAN_SERVICE_UUID, MANUAL_CHARACTERISTIC_UUID, STATE_CHARACTERISTIC_UUID, TAP_TIMER_ALIAS,
};
pub use protocol::{ManualCommand, TapState, DEFAULT_RUNTIME_MINUTES, MAX_RUNTIME_MINUTES};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_exports() {
        // Verify that key types are exported
        let _ = std::any::TypeId::of::<TapTimerManager>();
        let _ = std::any::TypeId::of::<TapTimer>();
        let _ = std::any::TypeId::of::<ManagerConfig>();
        let _ = std::any::TypeId::of::<Error>();
        let _ = std::any::TypeId::of::<TapState>();
        let _ = std::any::TypeId::of::<ManualCommand>();
        let _ = std::any::TypeId::of::<ConnectionState>();
    }

    #[test]
    fn test_manual_command_bytes() {
        assert_eq!(ManualCommand::start(DEFAULT_RUNTIME_MINUTES).to_bytes(), [1, 0, 0, 1]);
        assert_eq!(ManualCommand::stop().to_bytes(), [0, 0, 0, 0]);
    }
}
