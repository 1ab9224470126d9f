//! GATT characteristic handling.
//!
//! Locates the Holman service on a connected tap timer and provides
//! reads of the state characteristic and writes to the manual
//! characteristic.

use btleplug::api::{Characteristic, WriteType};
use std::sync::Arc;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::ble::transport::GattTransport;
use crate::ble::uuids::*;
use crate::error::{Error, Result};

/// Handler for the Holman characteristics of a connected tap timer.
pub struct CharacteristicHandler {
    /// The peripheral to communicate with.
    transport: Arc<dyn GattTransport>,
    /// Manual watering characteristic.
    manual: Characteristic,
    /// Tap state characteristic.
    state: Characteristic,
}

impl CharacteristicHandler {
    /// Resolve the Holman service and its characteristics.
    ///
    /// Services must already be discovered on the transport.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ServiceNotFound`] when the Holman service is absent and
    /// [`Error::CharacteristicNotFound`] when either characteristic is absent.
    pub fn resolve(transport: Arc<dyn GattTransport>) -> Result<Self> {
        let services = transport.services();

        let holman_service = services
            .iter()
            .find(|service| is_holman_service(&service.uuid))
            .ok_or_else(|| Error::ServiceNotFound {
                uuid: HOLMAN_SERVICE_UUID.to_string(),
            })?;

        for characteristic in &holman_service.characteristics {
            debug!(
                "Found characteristic: {} in service {}",
                characteristic.uuid, holman_service.uuid
            );
        }

        let find = |uuid: Uuid| {
            holman_service
                .characteristics
                .iter()
                .find(|c| c.uuid == uuid)
                .cloned()
                .ok_or_else(|| Error::CharacteristicNotFound {
                    uuid: uuid.to_string(),
                })
        };

        let manual = find(MANUAL_CHARACTERISTIC_UUID)?;
        let state = find(STATE_CHARACTERISTIC_UUID)?;

        Ok(Self {
            transport,
            manual,
            state,
        })
    }

    /// Read the raw tap state.
    pub async fn read_state(&self) -> Result<Vec<u8>> {
        let data = self.transport.read(&self.state).await?;
        trace!(
            "Read {} bytes from characteristic {}",
            data.len(),
            self.state.uuid
        );
        Ok(data)
    }

    /// Write a command to the manual characteristic.
    pub async fn write_manual(&self, data: &[u8]) -> Result<()> {
        self.transport
            .write(&self.manual, data, WriteType::WithResponse)
            .await?;
        trace!("Wrote {:02X?} to characteristic {}", data, self.manual.uuid);
        Ok(())
    }
}
