//! BLE communication module.
//!
//! This module provides the Bluetooth Low Energy plumbing for
//! discovering and talking to Holman tap timers.

pub mod characteristics;
pub mod connection;
pub mod scanner;
pub mod transport;
pub mod uuids;

pub use characteristics::CharacteristicHandler;
pub use connection::{ConnectionEvent, ConnectionManager, ConnectionState};
pub use scanner::{BleScanner, TapTimerDiscoveryEvent};
pub use transport::GattTransport;
pub use uuids::*;
