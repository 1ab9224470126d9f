//! Utility functions for the holman-ble crate.

use btleplug::api::BDAddr;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Parse a MAC address.
///
/// # Arguments
///
/// * `address` - Address in `AA:BB:CC:DD:EE:FF` form (case-insensitive)
///
/// # Example
///
/// ```
/// use holman_ble::parse_address;
///
/// let address = parse_address("aa:bb:cc:dd:ee:ff").unwrap();
/// assert_eq!(address.to_string(), "AA:BB:CC:DD:EE:FF");
/// ```
pub fn parse_address(address: &str) -> Result<BDAddr> {
    BDAddr::from_str(address.trim()).map_err(|_| Error::InvalidParameter {
        name: "address".to_string(),
        value: address.to_string(),
    })
}
