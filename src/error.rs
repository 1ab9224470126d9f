//! Error types for the holman-ble crate.

use thiserror::Error;

/// The main error type for this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Bluetooth is not available or is disabled on this system.
    #[error("Bluetooth not available or disabled")]
    BluetoothUnavailable,

    /// No adapter with the requested name exists.
    #[error("Bluetooth adapter not found: {name}")]
    AdapterNotFound {
        /// The adapter name that was searched for.
        name: String,
    },

    /// No tap timer with the given address could be found.
    #[error("Tap timer not found: {address}")]
    TapTimerNotFound {
        /// The MAC address that was searched for.
        address: String,
    },

    /// Operation requires a connection but the tap timer is not connected.
    #[error("Tap timer not connected")]
    NotConnected,

    /// Failed to establish a connection to the tap timer.
    #[error("Connection failed: {reason}")]
    ConnectionFailed {
        /// Description of why the connection failed.
        reason: String,
    },

    /// An operation did not complete in time.
    #[error("Timed out: {operation}")]
    Timeout {
        /// Description of the operation that timed out.
        operation: String,
    },

    /// An invalid parameter was provided.
    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter {
        /// The name of the parameter.
        name: String,
        /// The invalid value that was provided.
        value: String,
    },

    /// Characteristic not found on the device.
    #[error("Holman GATT characteristic {uuid} missing")]
    CharacteristicNotFound {
        /// The UUID of the characteristic that was not found.
        uuid: String,
    },

    /// Service not found on the device.
    #[error("Holman GATT service {uuid} missing")]
    ServiceNotFound {
        /// The UUID of the service that was not found.
        uuid: String,
    },
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
