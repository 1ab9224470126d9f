//! GATT transport abstraction.
//!
//! The tap timer logic talks to the Bluetooth stack only through
//! [`GattTransport`]. The production implementation delegates to a
//! `btleplug` peripheral.

use async_trait::async_trait;
use btleplug::api::{BDAddr, Characteristic, Peripheral as _, Service, WriteType};
use btleplug::platform::Peripheral;
use std::collections::BTreeSet;

use crate::error::{Error, Result};

/// GATT client operations needed to drive a tap timer.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GattTransport: Send + Sync {
    /// Platform identifier of the peripheral.
    fn identifier(&self) -> String;

    /// Bluetooth MAC address of the peripheral.
    fn address(&self) -> BDAddr;

    /// Advertised local name (alias), if known.
    async fn local_name(&self) -> Result<Option<String>>;

    /// Whether the platform reports the link as connected.
    async fn is_connected(&self) -> Result<bool>;

    /// Open the link.
    async fn connect(&self) -> Result<()>;

    /// Close the link.
    async fn disconnect(&self) -> Result<()>;

    /// Resolve the GATT services of a connected peripheral.
    async fn discover_services(&self) -> Result<()>;

    /// Services resolved by the last call to `discover_services`.
    fn services(&self) -> BTreeSet<Service>;

    /// Read a characteristic value.
    async fn read(&self, characteristic: &Characteristic) -> Result<Vec<u8>>;

    /// Write a characteristic value.
    async fn write(
        &self,
        characteristic: &Characteristic,
        data: &[u8],
        write_type: WriteType,
    ) -> Result<()>;
}

#[async_trait]
impl GattTransport for Peripheral {
    fn identifier(&self) -> String {
        self.id().to_string()
    }

    fn address(&self) -> BDAddr {
        btleplug::api::Peripheral::address(self)
    }

    async fn local_name(&self) -> Result<Option<String>> {
        let properties = self.properties().await.map_err(Error::Bluetooth)?;
        Ok(properties.and_then(|p| p.local_name))
    }

    async fn is_connected(&self) -> Result<bool> {
        btleplug::api::Peripheral::is_connected(self)
            .await
            .map_err(Error::Bluetooth)
    }

    async fn connect(&self) -> Result<()> {
        btleplug::api::Peripheral::connect(self)
            .await
            .map_err(Error::Bluetooth)
    }

    async fn disconnect(&self) -> Result<()> {
        btleplug::api::Peripheral::disconnect(self)
            .await
            .map_err(Error::Bluetooth)
    }

    async fn discover_services(&self) -> Result<()> {
        btleplug::api::Peripheral::discover_services(self)
            .await
            .map_err(Error::Bluetooth)
    }

    fn services(&self) -> BTreeSet<Service> {
        btleplug::api::Peripheral::services(self)
    }

    async fn read(&self, characteristic: &Characteristic) -> Result<Vec<u8>> {
        btleplug::api::Peripheral::read(self, characteristic)
            .await
            .map_err(Error::Bluetooth)
    }

    async fn write(
        &self,
        characteristic: &Characteristic,
        data: &[u8],
        write_type: WriteType,
    ) -> Result<()> {
        btleplug::api::Peripheral::write(self, characteristic, data, write_type)
            .await
            .map_err(Error::Bluetooth)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Helpers for building mock transports in unit tests.

    use super::*;
    use crate::ble::uuids::*;
    use btleplug::api::CharPropFlags;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use uuid::Uuid;

    pub(crate) use super::MockGattTransport;

    pub(crate) const TEST_ADDRESS: [u8; 6] = [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF];

    pub(crate) fn characteristic(uuid: Uuid, properties: CharPropFlags) -> Characteristic {
        Characteristic {
            uuid,
            service_uuid: HOLMAN_SERVICE_UUID,
            properties,
            descriptors: BTreeSet::new(),
        }
    }

    pub(crate) fn service(uuid: Uuid, characteristics: Vec<Characteristic>) -> Service {
        Service {
            uuid,
            primary: true,
            characteristics: characteristics.into_iter().collect(),
        }
    }

    /// The service layout of a real tap timer.
    pub(crate) fn holman_services() -> BTreeSet<Service> {
        let mut services = BTreeSet::new();
        services.insert(service(
            HOLMAN_SERVICE_UUID,
            vec![
                characteristic(STATE_CHARACTERISTIC_UUID, CharPropFlags::READ),
                characteristic(MANUAL_CHARACTERISTIC_UUID, CharPropFlags::WRITE),
            ],
        ));
        services
    }

    /// A mock with identity expectations set.
    pub(crate) fn mock_transport(identifier: &str, address: [u8; 6]) -> MockGattTransport {
        let mut mock = MockGattTransport::new();
        mock.expect_identifier().return_const(identifier.to_string());
        mock.expect_address().return_const(BDAddr::from(address));
        mock
    }

    /// A mock that connects successfully and exposes the Holman service.
    pub(crate) fn connectable_transport(state: Vec<u8>) -> MockGattTransport {
        let mut mock = mock_transport("hci0/dev_AA_BB_CC_DD_EE_FF", TEST_ADDRESS);
        mock.expect_is_connected().returning(|| Ok(false));
        mock.expect_connect().returning(|| Ok(()));
        mock.expect_discover_services().returning(|| Ok(()));
        mock.expect_services().returning(holman_services);
        mock.expect_read().returning(move |_| Ok(state.clone()));
        mock.expect_disconnect().returning(|| Ok(()));
        mock
    }

    /// A transport with a real link state whose operations can be slowed
    /// down, for exercising timing between concurrent calls.
    #[derive(Default)]
    pub(crate) struct SlowTransport {
        connect_delay: Duration,
        discover_delay: Duration,
        connected: AtomicBool,
        connects: AtomicUsize,
    }

    impl SlowTransport {
        pub(crate) fn with_connect_delay(mut self, delay: Duration) -> Self {
            self.connect_delay = delay;
            self
        }

        pub(crate) fn with_discover_delay(mut self, delay: Duration) -> Self {
            self.discover_delay = delay;
            self
        }

        /// Number of link connects started.
        pub(crate) fn connects(&self) -> usize {
            self.connects.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl GattTransport for SlowTransport {
        fn identifier(&self) -> String {
            "slow".to_string()
        }

        fn address(&self) -> BDAddr {
            BDAddr::from(TEST_ADDRESS)
        }

        async fn local_name(&self) -> Result<Option<String>> {
            Ok(Some(TAP_TIMER_ALIAS.to_string()))
        }

        async fn is_connected(&self) -> Result<bool> {
            Ok(self.connected.load(Ordering::SeqCst))
        }

        async fn connect(&self) -> Result<()> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.connect_delay).await;
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn disconnect(&self) -> Result<()> {
            self.connected.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn discover_services(&self) -> Result<()> {
            tokio::time::sleep(self.discover_delay).await;
            Ok(())
        }

        fn services(&self) -> BTreeSet<Service> {
            holman_services()
        }

        async fn read(&self, _characteristic: &Characteristic) -> Result<Vec<u8>> {
            Ok(vec![0x00])
        }

        async fn write(
            &self,
            _characteristic: &Characteristic,
            _data: &[u8],
            _write_type: WriteType,
        ) -> Result<()> {
            Ok(())
        }
    }
}
