//! BLE scanning functionality.
//!
//! Provides the adapter selection and the scanner for discovering
//! Holman tap timers.

use btleplug::api::{BDAddr, Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use chrono::{DateTime, Utc};
use futures::stream::StreamExt;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, trace};

use crate::ble::uuids::{is_holman_service, is_tap_timer, SERVICE_UUIDS};
use crate::error::{Error, Result};

/// Event emitted when a tap timer is seen during a scan.
#[derive(Debug, Clone)]
pub struct TapTimerDiscoveryEvent {
    /// The BLE peripheral identifier.
    pub identifier: String,
    /// The MAC address.
    pub address: BDAddr,
    /// The peripheral handle.
    pub peripheral: Peripheral,
    /// Advertised alias.
    pub local_name: Option<String>,
    /// Signal strength in dBm.
    pub rssi: Option<i16>,
    /// When the advertisement was processed.
    pub discovered_at: DateTime<Utc>,
}

/// Check whether an adapter description names the requested adapter.
///
/// On Linux adapter info reads like `hci0 (usb:v1D6Bp0246d0540)`, so the
/// name matches either the whole description or its first word.
pub fn adapter_matches(adapter_info: &str, name: &str) -> bool {
    !name.is_empty()
        && (adapter_info == name
            || adapter_info
                .strip_prefix(name)
                .is_some_and(|rest| rest.starts_with(' ')))
}

/// BLE scanner for discovering Holman tap timers.
pub struct BleScanner {
    /// The BLE adapter to use for scanning.
    adapter: Adapter,
    /// Whether scanning is currently active.
    is_scanning: Arc<RwLock<bool>>,
    /// Channel for discovery events.
    event_tx: broadcast::Sender<TapTimerDiscoveryEvent>,
    /// Handle to the scanning task.
    scan_handle: Arc<RwLock<Option<tokio::task::JoinHandle<()>>>>,
}

impl BleScanner {
    /// Create a new BLE scanner on the named adapter, or the first adapter
    /// when no name is given.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BluetoothUnavailable`] if there is no adapter and
    /// [`Error::AdapterNotFound`] if none matches `adapter_name`.
    pub async fn new(adapter_name: Option<&str>) -> Result<Self> {
        let manager = Manager::new()
            .await
            .map_err(|_e| Error::BluetoothUnavailable)?;

        let adapters = manager.adapters().await.map_err(Error::Bluetooth)?;

        let adapter = match adapter_name {
            None => adapters
                .into_iter()
                .next()
                .ok_or(Error::BluetoothUnavailable)?,
            Some(name) => {
                if adapters.is_empty() {
                    return Err(Error::BluetoothUnavailable);
                }

                let mut selected = None;
                for adapter in adapters {
                    let info = adapter.adapter_info().await.unwrap_or_default();
                    debug!("Found adapter: {}", info);
                    if adapter_matches(&info, name) {
                        selected = Some(adapter);
                        break;
                    }
                }

                selected.ok_or_else(|| Error::AdapterNotFound {
                    name: name.to_string(),
                })?
            }
        };

        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        Ok(Self::with_adapter(adapter))
    }

    /// Create a new BLE scanner with a specific adapter.
    pub fn with_adapter(adapter: Adapter) -> Self {
        let (event_tx, _) = broadcast::channel(100);

        Self {
            adapter,
            is_scanning: Arc::new(RwLock::new(false)),
            event_tx,
            scan_handle: Arc::new(RwLock::new(None)),
        }
    }

    /// Start scanning for tap timers.
    ///
    /// # Errors
    ///
    /// Returns an error if scanning cannot be started.
    pub async fn start_scanning(&self) -> Result<()> {
        if *self.is_scanning.read() {
            debug!("Already scanning, ignoring start request");
            return Ok(());
        }

        info!("Starting BLE scan for Holman tap timers");

        self.adapter
            .start_scan(ScanFilter {
                services: SERVICE_UUIDS.to_vec(),
            })
            .await
            .map_err(Error::Bluetooth)?;

        *self.is_scanning.write() = true;

        let adapter = self.adapter.clone();
        let is_scanning = self.is_scanning.clone();
        let event_tx = self.event_tx.clone();

        let handle = tokio::spawn(async move {
            let mut events = match adapter.events().await {
                Ok(events) => events,
                Err(e) => {
                    error!("Failed to get adapter events: {}", e);
                    return;
                }
            };

            while *is_scanning.read() {
                tokio::select! {
                    Some(event) = events.next() => {
                        Self::handle_event(event, &adapter, &event_tx).await;
                    }
                    _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                }
            }

            debug!("Scan event loop ended");
        });

        *self.scan_handle.write() = Some(handle);

        Ok(())
    }

    /// Stop scanning for tap timers.
    pub async fn stop_scanning(&self) -> Result<()> {
        if !*self.is_scanning.read() {
            debug!("Not scanning, ignoring stop request");
            return Ok(());
        }

        info!("Stopping BLE scan");

        *self.is_scanning.write() = false;

        self.adapter.stop_scan().await.map_err(Error::Bluetooth)?;

        let handle = self.scan_handle.write().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        Ok(())
    }

    /// Check if currently scanning.
    pub fn is_scanning(&self) -> bool {
        *self.is_scanning.read()
    }

    /// Subscribe to discovery events.
    pub fn subscribe(&self) -> broadcast::Receiver<TapTimerDiscoveryEvent> {
        self.event_tx.subscribe()
    }

    /// Get the underlying adapter.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    /// Handle a BLE central event.
    async fn handle_event(
        event: CentralEvent,
        adapter: &Adapter,
        event_tx: &broadcast::Sender<TapTimerDiscoveryEvent>,
    ) {
        match event {
            CentralEvent::DeviceDiscovered(id) => {
                trace!("Device discovered: {:?}", id);
                Self::process_peripheral(adapter, id, event_tx).await;
            }
            CentralEvent::DeviceUpdated(id) => {
                trace!("Device updated: {:?}", id);
                Self::process_peripheral(adapter, id, event_tx).await;
            }
            CentralEvent::ServicesAdvertisement { id, services } => {
                if services.iter().any(is_holman_service) {
                    trace!("Holman service advertisement: {:?}", id);
                    Self::process_peripheral(adapter, id, event_tx).await;
                }
            }
            _ => {}
        }
    }

    /// Process a discovered peripheral.
    async fn process_peripheral(
        adapter: &Adapter,
        id: PeripheralId,
        event_tx: &broadcast::Sender<TapTimerDiscoveryEvent>,
    ) {
        let peripheral = match adapter.peripheral(&id).await {
            Ok(p) => p,
            Err(e) => {
                trace!("Failed to get peripheral: {}", e);
                return;
            }
        };

        let properties = match peripheral.properties().await {
            Ok(Some(p)) => p,
            _ => return,
        };

        if !is_tap_timer(properties.local_name.as_deref(), &properties.services) {
            return;
        }

        let event = TapTimerDiscoveryEvent {
            identifier: id.to_string(),
            address: properties.address,
            peripheral,
            local_name: properties.local_name,
            rssi: properties.rssi,
            discovered_at: Utc::now(),
        };

        let _ = event_tx.send(event);
    }
}

impl Drop for BleScanner {
    fn drop(&mut self) {
        *self.is_scanning.write() = false;
    }
}
