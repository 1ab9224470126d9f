//! Manager for discovering and managing Holman tap timers.
//!
//! This module is the entry point of the crate. It owns the Bluetooth
//! adapter, runs discovery, hands out [`TapTimer`] instances and routes
//! platform disconnect events to them.

use btleplug::api::{BDAddr, Central, CentralEvent, Peripheral as _};
use btleplug::platform::Peripheral;
use futures::stream::StreamExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::ble::scanner::{BleScanner, TapTimerDiscoveryEvent};
use crate::ble::transport::GattTransport;
use crate::ble::uuids::is_tap_timer;
use crate::config::ManagerConfig;
use crate::error::{Error, Result};
use crate::listener::TapTimerManagerListener;
use crate::tap_timer::{CallbackHandle, TapTimer};

/// Tap timers by platform identifier.
type TapTimerMap = Arc<RwLock<HashMap<String, Arc<TapTimer>>>>;

/// Polling interval while looking up a tap timer by address.
const LOOKUP_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Entry point for discovering and managing Holman tap timers.
pub struct TapTimerManager {
    /// Manager settings.
    config: ManagerConfig,
    /// BLE scanner.
    scanner: Arc<BleScanner>,
    /// Every tap timer handed out, by platform identifier.
    tap_timers: TapTimerMap,
    /// Tap timers reported by discovery, by MAC address.
    discovered: Arc<RwLock<HashMap<BDAddr, Arc<TapTimer>>>>,
    /// Discovery listener.
    listener: Arc<RwLock<Option<Arc<dyn TapTimerManagerListener>>>>,
    /// Tap timer discovery channel.
    discovered_tx: broadcast::Sender<Arc<TapTimer>>,
    /// Callback ID counter.
    callback_counter: AtomicU64,
    /// Discovery task handle.
    discovery_handle: RwLock<Option<tokio::task::JoinHandle<()>>>,
    /// Discovery flag.
    is_discovering: Arc<AtomicBool>,
    /// Event loop flag.
    is_running: AtomicBool,
}

impl TapTimerManager {
    /// Create a new manager.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth or the configured adapter is not available.
    pub async fn new(config: ManagerConfig) -> Result<Self> {
        let scanner = BleScanner::new(config.adapter()).await?;

        let (discovered_tx, _) = broadcast::channel(32);

        Ok(Self {
            config,
            scanner: Arc::new(scanner),
            tap_timers: Arc::new(RwLock::new(HashMap::new())),
            discovered: Arc::new(RwLock::new(HashMap::new())),
            listener: Arc::new(RwLock::new(None)),
            discovered_tx,
            callback_counter: AtomicU64::new(0),
            discovery_handle: RwLock::new(None),
            is_discovering: Arc::new(AtomicBool::new(false)),
            is_running: AtomicBool::new(false),
        })
    }

    /// Create a manager for the named adapter with default settings.
    pub async fn with_adapter_name(adapter_name: &str) -> Result<Self> {
        Self::new(ManagerConfig::default().adapter_name(adapter_name)).await
    }

    /// Assign the listener notified of discovered tap timers.
    pub fn set_listener(&self, listener: Arc<dyn TapTimerManagerListener>) {
        *self.listener.write() = Some(listener);
    }

    /// Remove the discovery listener.
    pub fn clear_listener(&self) {
        *self.listener.write() = None;
    }

    // === Discovery ===

    /// Start discovering nearby tap timers.
    ///
    /// Each tap timer is announced to the listener and to
    /// [`subscribe_discovered`](Self::subscribe_discovered) once.
    pub async fn start_discovery(&self) -> Result<()> {
        if self.is_discovering.load(Ordering::SeqCst) {
            debug!("Already discovering");
            return Ok(());
        }

        info!("Starting tap timer discovery");

        let mut rx = self.scanner.subscribe();
        self.scanner.start_scanning().await?;
        self.is_discovering.store(true, Ordering::SeqCst);

        let config = self.config.clone();
        let tap_timers = self.tap_timers.clone();
        let discovered = self.discovered.clone();
        let listener = self.listener.clone();
        let discovered_tx = self.discovered_tx.clone();
        let is_discovering = self.is_discovering.clone();

        let handle = tokio::spawn(async move {
            while is_discovering.load(Ordering::SeqCst) {
                tokio::select! {
                    Ok(event) = rx.recv() => {
                        Self::handle_discovery_event(
                            event,
                            &config,
                            &tap_timers,
                            &discovered,
                            &listener,
                            &discovered_tx,
                        );
                    }
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                }
            }

            debug!("Discovery task ended");
        });

        *self.discovery_handle.write() = Some(handle);

        Ok(())
    }

    /// Stop discovering tap timers.
    pub async fn stop_discovery(&self) -> Result<()> {
        if !self.is_discovering.load(Ordering::SeqCst) {
            return Ok(());
        }

        info!("Stopping tap timer discovery");

        self.is_discovering.store(false, Ordering::SeqCst);
        self.scanner.stop_scanning().await?;

        let handle = self.discovery_handle.write().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        Ok(())
    }

    /// Check if discovery is active.
    pub fn is_discovering(&self) -> bool {
        self.is_discovering.load(Ordering::SeqCst)
    }

    /// Subscribe to tap timer discovery events.
    pub fn subscribe_discovered(&self) -> broadcast::Receiver<Arc<TapTimer>> {
        self.discovered_tx.subscribe()
    }

    /// Register a callback for discovered tap timers.
    pub fn on_tap_timer_discovered<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(Arc<TapTimer>) + Send + Sync + 'static,
    {
        let callback_id = self.callback_counter.fetch_add(1, Ordering::SeqCst);
        Self::spawn_discovery_callback(callback_id, self.discovered_tx.subscribe(), callback)
    }

    /// Run `callback` for every tap timer received until the handle is dropped.
    fn spawn_discovery_callback<F>(
        callback_id: u64,
        mut rx: broadcast::Receiver<Arc<TapTimer>>,
        callback: F,
    ) -> CallbackHandle
    where
        F: Fn(Arc<TapTimer>) + Send + Sync + 'static,
    {
        let handle = tokio::spawn(async move {
            while let Ok(tap_timer) = rx.recv().await {
                callback(tap_timer);
            }
        });

        CallbackHandle::new(callback_id, move || {
            handle.abort();
        })
    }

    // === Known tap timers ===

    /// Get all tap timers already known to the adapter.
    pub async fn tap_timers(&self) -> Result<Vec<Arc<TapTimer>>> {
        let peripherals = self
            .scanner
            .adapter()
            .peripherals()
            .await
            .map_err(Error::Bluetooth)?;

        let mut found = Vec::new();
        for peripheral in peripherals {
            let properties = match peripheral.properties().await {
                Ok(Some(p)) => p,
                _ => continue,
            };

            if is_tap_timer(properties.local_name.as_deref(), &properties.services) {
                found.push(Self::register(
                    &self.tap_timers,
                    Arc::new(peripheral),
                    &self.config,
                ));
            }
        }

        debug!("{} known tap timers", found.len());

        Ok(found)
    }

    /// Get the tap timer with the given MAC address.
    ///
    /// Looks among known peripherals first, then scans for up to the
    /// configured lookup timeout.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TapTimerNotFound`] if the device does not show up.
    pub async fn tap_timer(&self, address: BDAddr) -> Result<Arc<TapTimer>> {
        let existing = self
            .tap_timers
            .read()
            .values()
            .find(|t| t.address() == address)
            .cloned();
        if let Some(tap_timer) = existing {
            return Ok(tap_timer);
        }

        let peripheral = match self.find_peripheral(address).await? {
            Some(peripheral) => peripheral,
            None => self.scan_for(address).await?,
        };

        Ok(Self::register(
            &self.tap_timers,
            Arc::new(peripheral),
            &self.config,
        ))
    }

    async fn find_peripheral(&self, address: BDAddr) -> Result<Option<Peripheral>> {
        let peripherals = self
            .scanner
            .adapter()
            .peripherals()
            .await
            .map_err(Error::Bluetooth)?;

        Ok(peripherals
            .into_iter()
            .find(|p| btleplug::api::Peripheral::address(p) == address))
    }

    async fn scan_for(&self, address: BDAddr) -> Result<Peripheral> {
        info!("Scanning for tap timer {}", address);

        let started_scan = !self.scanner.is_scanning();
        if started_scan {
            self.scanner.start_scanning().await?;
        }

        let deadline = Instant::now() + self.config.lookup_timeout_duration();
        let result = loop {
            match self.find_peripheral(address).await {
                Ok(Some(peripheral)) => break Ok(peripheral),
                Ok(None) => {}
                Err(e) => break Err(e),
            }

            if Instant::now() >= deadline {
                break Err(Error::TapTimerNotFound {
                    address: address.to_string(),
                });
            }

            tokio::time::sleep(LOOKUP_POLL_INTERVAL).await;
        };

        if started_scan {
            if let Err(e) = self.scanner.stop_scanning().await {
                debug!("Failed to stop lookup scan: {}", e);
            }
        }

        result
    }

    // === Event loop ===

    /// Process adapter events until [`stop`](Self::stop) is called.
    ///
    /// Tap timers only hear about links dropped by the remote side while
    /// this loop runs.
    pub async fn run(&self) -> Result<()> {
        if self.is_running.swap(true, Ordering::SeqCst) {
            debug!("Event loop already running");
            return Ok(());
        }

        let mut events = match self.scanner.adapter().events().await {
            Ok(events) => events,
            Err(e) => {
                self.is_running.store(false, Ordering::SeqCst);
                return Err(Error::Bluetooth(e));
            }
        };

        info!("Tap timer manager event loop started");

        while self.is_running.load(Ordering::SeqCst) {
            tokio::select! {
                Some(event) = events.next() => {
                    self.handle_central_event(event);
                }
                _ = tokio::time::sleep(Duration::from_millis(100)) => {}
            }
        }

        debug!("Tap timer manager event loop ended");

        Ok(())
    }

    /// Stop the event loop started by [`run`](Self::run).
    pub fn stop(&self) {
        self.is_running.store(false, Ordering::SeqCst);
    }

    /// Check if the event loop is running.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Clean shutdown of discovery, the event loop and all connections.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down tap timer manager");

        self.stop();
        self.stop_discovery().await?;

        let tap_timers: Vec<_> = self.tap_timers.read().values().cloned().collect();
        for tap_timer in tap_timers {
            if !tap_timer.is_connected() {
                continue;
            }
            tap_timer.set_auto_reconnect(false);
            if let Err(e) = tap_timer.disconnect().await {
                warn!("Error disconnecting tap timer {}: {}", tap_timer.address(), e);
            }
        }

        Ok(())
    }

    fn handle_central_event(&self, event: CentralEvent) {
        match event {
            CentralEvent::DeviceDisconnected(id) => {
                let tap_timer = self.tap_timers.read().get(&id.to_string()).cloned();
                if let Some(tap_timer) = tap_timer {
                    debug!("Link to tap timer {} dropped", tap_timer.address());
                    tokio::spawn(async move {
                        tap_timer.handle_disconnected().await;
                    });
                }
            }
            CentralEvent::DeviceConnected(id) => {
                trace!("Device connected: {:?}", id);
            }
            _ => {}
        }
    }

    /// Get or create the managed tap timer for a transport.
    fn register(
        tap_timers: &TapTimerMap,
        transport: Arc<dyn GattTransport>,
        config: &ManagerConfig,
    ) -> Arc<TapTimer> {
        let identifier = transport.identifier();
        tap_timers
            .write()
            .entry(identifier)
            .or_insert_with(|| Arc::new(TapTimer::new(transport, config)))
            .clone()
    }

    /// Handle a discovery event from the scanner.
    fn handle_discovery_event(
        event: TapTimerDiscoveryEvent,
        config: &ManagerConfig,
        tap_timers: &TapTimerMap,
        discovered: &RwLock<HashMap<BDAddr, Arc<TapTimer>>>,
        listener: &RwLock<Option<Arc<dyn TapTimerManagerListener>>>,
        discovered_tx: &broadcast::Sender<Arc<TapTimer>>,
    ) {
        let tap_timer = Self::register(tap_timers, Arc::new(event.peripheral), config);

        if Self::announce_discovery(tap_timer, discovered, listener, discovered_tx) {
            info!(
                "Discovered tap timer {} ({:?}, RSSI {:?})",
                event.address, event.local_name, event.rssi
            );
        }
    }

    /// Announce a tap timer unless its address was announced before.
    ///
    /// Returns `true` when the tap timer was new.
    fn announce_discovery(
        tap_timer: Arc<TapTimer>,
        discovered: &RwLock<HashMap<BDAddr, Arc<TapTimer>>>,
        listener: &RwLock<Option<Arc<dyn TapTimerManagerListener>>>,
        discovered_tx: &broadcast::Sender<Arc<TapTimer>>,
    ) -> bool {
        {
            let mut discovered = discovered.write();
            if discovered.contains_key(&tap_timer.address()) {
                trace!("Tap timer {} already announced", tap_timer.address());
                return false;
            }
            discovered.insert(tap_timer.address(), tap_timer.clone());
        }

        let listener = listener.read().clone();
        if let Some(listener) = listener {
            listener.tap_timer_discovered(&tap_timer);
        }

        let _ = discovered_tx.send(tap_timer);

        true
    }
}

impl Drop for TapTimerManager {
    fn drop(&mut self) {
        self.is_discovering.store(false, Ordering::SeqCst);
        self.is_running.store(false, Ordering::SeqCst);
    }
}
