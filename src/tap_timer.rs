//! Tap timer struct and methods.
//!
//! Represents a single Holman Bluetooth tap timer.

use btleplug::api::BDAddr;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

use crate::ble::characteristics::CharacteristicHandler;
use crate::ble::connection::{ConnectionEvent, ConnectionManager, ConnectionState};
use crate::ble::transport::GattTransport;
use crate::config::ManagerConfig;
use crate::error::{Error, Result};
use crate::listener::TapTimerListener;
use crate::protocol::{ManualCommand, TapState};

/// Callback handle for unregistering callbacks.
pub struct CallbackHandle {
    id: u64,
    unregister_fn: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl CallbackHandle {
    /// Create a new callback handle.
    pub(crate) fn new(id: u64, unregister_fn: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            id,
            unregister_fn: Some(Box::new(unregister_fn)),
        }
    }

    /// Unregister this callback.
    pub fn unregister(mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }

    /// Get the callback ID.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for CallbackHandle {
    fn drop(&mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }
}

/// Represents a single Holman tap timer.
///
/// Obtain instances through [`TapTimerManager`](crate::TapTimerManager),
/// either from discovery or by address. Assign a [`TapTimerListener`] to
/// follow connection events.
pub struct TapTimer {
    /// Platform identifier.
    identifier: String,
    /// MAC address.
    address: BDAddr,
    /// GATT transport.
    transport: Arc<dyn GattTransport>,
    /// Connection manager.
    connection: ConnectionManager,
    /// Resolved characteristics while connected.
    characteristics: RwLock<Option<Arc<CharacteristicHandler>>>,
    /// Last tap state read from the device.
    state: RwLock<TapState>,
    /// Lifecycle listener.
    listener: RwLock<Option<Arc<dyn TapTimerListener>>>,
    /// Reconnect after the link drops.
    auto_reconnect: AtomicBool,
    /// A `connect()` call is in flight.
    connecting: AtomicBool,
    /// Callback ID counter.
    callback_counter: AtomicU64,
}

impl TapTimer {
    /// Create a new tap timer instance.
    pub(crate) fn new(transport: Arc<dyn GattTransport>, config: &ManagerConfig) -> Self {
        let mut connection = ConnectionManager::new(transport.clone());
        connection.set_retry_params(config.attempts(), config.retry_delay_duration());
        connection.set_connect_timeout(config.connect_timeout_duration());

        Self {
            identifier: transport.identifier(),
            address: transport.address(),
            transport,
            connection,
            characteristics: RwLock::new(None),
            state: RwLock::new(TapState::default()),
            listener: RwLock::new(None),
            auto_reconnect: AtomicBool::new(false),
            connecting: AtomicBool::new(false),
            callback_counter: AtomicU64::new(0),
        }
    }

    // === Identification ===

    /// Get the platform identifier.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Get the MAC address.
    pub fn address(&self) -> BDAddr {
        self.address
    }

    /// Get the MAC address formatted as `AA:BB:CC:DD:EE:FF`.
    pub fn mac_address(&self) -> String {
        self.address.to_string()
    }

    /// Get the advertised alias, if known.
    pub async fn alias(&self) -> Result<Option<String>> {
        self.transport.local_name().await
    }

    /// Get the name of the tap timer (its alias, or empty when unknown).
    pub async fn name(&self) -> Result<String> {
        Ok(self.alias().await?.unwrap_or_default())
    }

    // === Listener ===

    /// Assign the listener notified of connection events.
    pub fn set_listener(&self, listener: Arc<dyn TapTimerListener>) {
        *self.listener.write() = Some(listener);
    }

    /// Remove the listener.
    pub fn clear_listener(&self) {
        *self.listener.write() = None;
    }

    fn listener(&self) -> Option<Arc<dyn TapTimerListener>> {
        self.listener.read().clone()
    }

    // === Connection ===

    /// Get the current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Reconnect automatically whenever the link drops.
    pub fn set_auto_reconnect(&self, enabled: bool) {
        self.auto_reconnect.store(enabled, Ordering::SeqCst);
    }

    /// Check if automatic reconnection is enabled.
    pub fn is_auto_reconnect(&self) -> bool {
        self.auto_reconnect.load(Ordering::SeqCst)
    }

    /// Subscribe to connection state changes.
    pub fn subscribe_connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.connection.subscribe()
    }

    /// Register a callback for connection state changes.
    pub fn on_connection_state_changed<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        let callback_id = self.callback_counter.fetch_add(1, Ordering::SeqCst);
        let mut rx = self.connection.subscribe();

        let handle = tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                callback(event.state);
            }
        });

        CallbackHandle::new(callback_id, move || {
            handle.abort();
        })
    }

    /// Connect to the tap timer.
    ///
    /// Resolves the Holman service and reads the current state. The listener
    /// hears `started_connecting` followed by either `connect_succeeded` or
    /// `connect_failed`. A call made while another connect is in flight
    /// fails without notifying the listener.
    pub async fn connect(&self) -> Result<()> {
        if self.connecting.swap(true, Ordering::SeqCst) {
            return Err(Error::ConnectionFailed {
                reason: "Connecting already in progress".to_string(),
            });
        }
        let connecting = ConnectingGuard(&self.connecting);

        info!("Connecting to tap timer {}", self.address);

        if let Some(listener) = self.listener() {
            listener.started_connecting(self);
        }

        let result = self.establish().await;
        drop(connecting);

        match result {
            Ok(()) => {
                info!("Connected to tap timer {}", self.address);
                if let Some(listener) = self.listener() {
                    listener.connect_succeeded(self);
                }
                Ok(())
            }
            Err(e) => {
                warn!("Connecting to tap timer {} failed: {}", self.address, e);
                if let Some(listener) = self.listener() {
                    listener.connect_failed(self, &e);
                }
                Err(e)
            }
        }
    }

    async fn establish(&self) -> Result<()> {
        self.connection.connect(self.is_auto_reconnect()).await?;

        let handler = match CharacteristicHandler::resolve(self.transport.clone()) {
            Ok(handler) => Arc::new(handler),
            Err(e) => {
                self.abandon_connection().await;
                return Err(e);
            }
        };
        *self.characteristics.write() = Some(handler);

        if let Err(e) = self.refresh_state().await {
            self.abandon_connection().await;
            return Err(e);
        }

        if !self.connection.is_connected() {
            *self.characteristics.write() = None;
            return Err(Error::ConnectionFailed {
                reason: "link dropped while connecting".to_string(),
            });
        }

        Ok(())
    }

    /// Drop a link that came up without a usable Holman service.
    async fn abandon_connection(&self) {
        *self.characteristics.write() = None;
        if let Err(e) = self.connection.disconnect().await {
            debug!("Failed to drop link to {}: {}", self.address, e);
        }
    }

    /// Disconnect from the tap timer.
    ///
    /// The listener hears `started_disconnecting` and, once the link is
    /// closed, `disconnect_succeeded`.
    pub async fn disconnect(&self) -> Result<()> {
        info!("Disconnecting from tap timer {}", self.address);

        if let Some(listener) = self.listener() {
            listener.started_disconnecting(self);
        }

        if let Err(e) = self.refresh_state().await {
            debug!("Could not refresh state before disconnecting: {}", e);
        }

        let result = self.connection.disconnect().await;
        *self.characteristics.write() = None;
        result?;

        if let Some(listener) = self.listener() {
            listener.disconnect_succeeded(self);
        }

        Ok(())
    }

    /// React to the platform reporting that the link dropped.
    pub(crate) async fn handle_disconnected(&self) {
        if !self.connection.handle_disconnection() {
            trace!("Ignoring disconnect event for {}", self.address);
            return;
        }

        if self.connecting.load(Ordering::SeqCst) {
            // The pending connect reports the failure.
            debug!("Link to {} dropped while connecting", self.address);
            return;
        }

        *self.characteristics.write() = None;

        if let Some(listener) = self.listener() {
            listener.disconnect_succeeded(self);
        }

        if self.is_auto_reconnect() {
            info!("Reconnecting to tap timer {}", self.address);
            if let Err(e) = self.connect().await {
                debug!("Reconnect to {} failed: {}", self.address, e);
            }
        }
    }

    fn handler(&self) -> Option<Arc<CharacteristicHandler>> {
        self.characteristics.read().clone()
    }

    // === State ===

    /// Get the last state read from the tap timer.
    pub fn state(&self) -> TapState {
        self.state.read().clone()
    }

    /// Re-read the state characteristic. Does nothing while disconnected.
    pub async fn refresh_state(&self) -> Result<()> {
        let Some(handler) = self.handler() else {
            return Ok(());
        };

        let state = TapState::from_bytes(&handler.read_state().await?);
        debug!("Tap timer {} is {}", self.address, state);
        *self.state.write() = state;

        Ok(())
    }

    /// Check whether the tap is running.
    ///
    /// Reads the state first when connected; otherwise reports the last
    /// known state.
    pub async fn is_on(&self) -> Result<bool> {
        self.refresh_state().await?;
        Ok(self.state.read().is_on())
    }

    // === Watering ===

    /// Turn on the tap for `runtime_minutes` minutes (at most 255).
    pub async fn start(&self, runtime_minutes: u32) -> Result<()> {
        self.send_command(ManualCommand::start(runtime_minutes)).await
    }

    /// Turn off the tap.
    pub async fn stop(&self) -> Result<()> {
        self.send_command(ManualCommand::stop()).await
    }

    /// Write a manual command, then refresh the state whatever the outcome.
    async fn send_command(&self, command: ManualCommand) -> Result<()> {
        let handler = self.handler().ok_or(Error::NotConnected)?;

        info!("Tap timer {}: {}", self.address, command);

        let result = handler.write_manual(&command.to_bytes()).await;
        if let Err(e) = &result {
            warn!("Writing {} to {} failed: {}", command, self.address, e);
        }

        if let Err(e) = self.refresh_state().await {
            debug!("Could not refresh state after write: {}", e);
        }

        result
    }
}

/// Clears the in-flight connect flag when `connect()` finishes or is dropped.
struct ConnectingGuard<'a>(&'a AtomicBool);

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for TapTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TapTimer")
            .field("identifier", &self.identifier)
            .field("address", &self.address)
            .field("connection_state", &self.connection_state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::transport::test_support::*;
    use crate::ble::uuids::*;
    use btleplug::api::CharPropFlags;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeSet;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingListener {
        events: Mutex<Vec<String>>,
    }

    impl RecordingListener {
        fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.events.lock())
        }
    }

    impl TapTimerListener for RecordingListener {
        fn started_connecting(&self, _tap_timer: &TapTimer) {
            self.events.lock().push("started_connecting".into());
        }

        fn connect_succeeded(&self, _tap_timer: &TapTimer) {
            self.events.lock().push("connect_succeeded".into());
        }

        fn connect_failed(&self, _tap_timer: &TapTimer, error: &Error) {
            self.events.lock().push(format!("connect_failed: {}", error));
        }

        fn started_disconnecting(&self, _tap_timer: &TapTimer) {
            self.events.lock().push("started_disconnecting".into());
        }

        fn disconnect_succeeded(&self, _tap_timer: &TapTimer) {
            self.events.lock().push("disconnect_succeeded".into());
        }
    }

    fn tap_timer(transport: MockGattTransport) -> (TapTimer, Arc<RecordingListener>) {
        let config = ManagerConfig::default().retry_delay(Duration::from_millis(1));
        let tap_timer = TapTimer::new(Arc::new(transport), &config);
        let listener = Arc::new(RecordingListener::default());
        tap_timer.set_listener(listener.clone());
        (tap_timer, listener)
    }

    #[tokio::test]
    async fn test_connect_succeeds_and_reads_state() {
        let (tap_timer, listener) = tap_timer(connectable_transport(vec![0x00, 0x01]));

        tap_timer.connect().await.unwrap();

        assert_eq!(
            listener.take(),
            vec!["started_connecting", "connect_succeeded"]
        );
        assert_eq!(tap_timer.connection_state(), ConnectionState::Connected);
        assert!(tap_timer.state().is_on());
        assert_eq!(tap_timer.mac_address(), "AA:BB:CC:DD:EE:FF");
    }

    #[tokio::test]
    async fn test_connect_failure_notifies_listener() {
        let mut mock = mock_transport("dev", TEST_ADDRESS);
        mock.expect_is_connected().returning(|| Ok(false));
        mock.expect_connect()
            .returning(|| Err(Error::Bluetooth(btleplug::Error::DeviceNotFound)));

        let (tap_timer, listener) = tap_timer(mock);
        assert!(tap_timer.connect().await.is_err());

        let events = listener.take();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], "started_connecting");
        assert!(events[1].starts_with("connect_failed: Connection failed"));
        assert_eq!(tap_timer.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_missing_service_fails_connect_and_drops_link() {
        let mut mock = mock_transport("dev", TEST_ADDRESS);
        mock.expect_is_connected().returning(|| Ok(false));
        mock.expect_connect().returning(|| Ok(()));
        mock.expect_discover_services().returning(|| Ok(()));
        mock.expect_services().returning(BTreeSet::new);
        mock.expect_disconnect().times(1).returning(|| Ok(()));

        let (tap_timer, listener) = tap_timer(mock);
        let result = tap_timer.connect().await;

        assert!(matches!(result, Err(Error::ServiceNotFound { .. })));
        assert_eq!(
            listener.take(),
            vec![
                "started_connecting".to_string(),
                format!(
                    "connect_failed: Holman GATT service {} missing",
                    HOLMAN_SERVICE_UUID
                ),
            ]
        );
        assert_eq!(tap_timer.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_missing_manual_characteristic_fails_connect() {
        let mut mock = mock_transport("dev", TEST_ADDRESS);
        mock.expect_is_connected().returning(|| Ok(false));
        mock.expect_connect().returning(|| Ok(()));
        mock.expect_discover_services().returning(|| Ok(()));
        mock.expect_services().returning(|| {
            let mut services = BTreeSet::new();
            services.insert(service(
                HOLMAN_SERVICE_UUID,
                vec![characteristic(STATE_CHARACTERISTIC_UUID, CharPropFlags::READ)],
            ));
            services
        });
        mock.expect_disconnect().returning(|| Ok(()));

        let (tap_timer, _listener) = tap_timer(mock);
        match tap_timer.connect().await {
            Err(Error::CharacteristicNotFound { uuid }) => {
                assert_eq!(uuid, MANUAL_CHARACTERISTIC_UUID.to_string())
            }
            other => panic!("expected CharacteristicNotFound, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_start_writes_clamped_runtime_and_refreshes() {
        let mut mock = connectable_transport(vec![0x01]);
        mock.expect_write()
            .withf(|c, data, _| {
                c.uuid == MANUAL_CHARACTERISTIC_UUID
                    && data.to_vec() == vec![0x01, 0x00, 0x00, 0xFF]
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let (tap_timer, _listener) = tap_timer(mock);
        tap_timer.connect().await.unwrap();
        tap_timer.start(300).await.unwrap();

        assert!(tap_timer.is_on().await.unwrap());
    }

    #[tokio::test]
    async fn test_stop_writes_zero_payload() {
        let mut mock = connectable_transport(vec![0x00]);
        mock.expect_write()
            .withf(|_, data, _| data.to_vec() == vec![0x00, 0x00, 0x00, 0x00])
            .times(1)
            .returning(|_, _, _| Ok(()));

        let (tap_timer, _listener) = tap_timer(mock);
        tap_timer.connect().await.unwrap();
        tap_timer.stop().await.unwrap();

        assert!(!tap_timer.is_on().await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_write_is_returned_after_refresh() {
        let mut mock = mock_transport("dev", TEST_ADDRESS);
        mock.expect_is_connected().returning(|| Ok(false));
        mock.expect_connect().returning(|| Ok(()));
        mock.expect_discover_services().returning(|| Ok(()));
        mock.expect_services().returning(holman_services);
        // One read while connecting, one after the failed write.
        mock.expect_read().times(2).returning(|_| Ok(vec![0x00]));
        mock.expect_write()
            .times(1)
            .returning(|_, _, _| Err(Error::Bluetooth(btleplug::Error::NotConnected)));

        let (tap_timer, _listener) = tap_timer(mock);
        tap_timer.connect().await.unwrap();

        assert!(matches!(
            tap_timer.start(5).await,
            Err(Error::Bluetooth(btleplug::Error::NotConnected))
        ));
    }

    #[tokio::test]
    async fn test_disconnect_survives_failed_refresh() {
        let mut mock = mock_transport("dev", TEST_ADDRESS);
        mock.expect_is_connected().returning(|| Ok(false));
        mock.expect_connect().returning(|| Ok(()));
        mock.expect_discover_services().returning(|| Ok(()));
        mock.expect_services().returning(holman_services);
        let reads = AtomicUsize::new(0);
        mock.expect_read().returning(move |_| {
            if reads.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(vec![0x01])
            } else {
                Err(Error::Bluetooth(btleplug::Error::NotConnected))
            }
        });
        mock.expect_disconnect().times(1).returning(|| Ok(()));

        let (tap_timer, listener) = tap_timer(mock);
        tap_timer.connect().await.unwrap();
        listener.take();

        tap_timer.disconnect().await.unwrap();

        assert_eq!(
            listener.take(),
            vec!["started_disconnecting", "disconnect_succeeded"]
        );
        assert_eq!(tap_timer.connection_state(), ConnectionState::Disconnected);
        // The last successful read is kept.
        assert!(tap_timer.state().is_on());
    }

    #[tokio::test]
    async fn test_commands_require_connection() {
        let mut mock = mock_transport("dev", TEST_ADDRESS);
        mock.expect_write().never();

        let (tap_timer, _listener) = tap_timer(mock);

        assert!(matches!(tap_timer.start(1).await, Err(Error::NotConnected)));
        assert!(matches!(tap_timer.stop().await, Err(Error::NotConnected)));
        assert!(!tap_timer.is_on().await.unwrap());
    }

    #[tokio::test]
    async fn test_disconnect_notifies_listener() {
        let (tap_timer, listener) = tap_timer(connectable_transport(vec![0x00]));
        tap_timer.connect().await.unwrap();
        listener.take();

        tap_timer.disconnect().await.unwrap();

        assert_eq!(
            listener.take(),
            vec!["started_disconnecting", "disconnect_succeeded"]
        );
        assert_eq!(tap_timer.connection_state(), ConnectionState::Disconnected);

        // The platform event that follows a local disconnect is not reported twice.
        tap_timer.handle_disconnected().await;
        assert!(listener.take().is_empty());
    }

    #[tokio::test]
    async fn test_link_loss_is_reported_once() {
        let (tap_timer, listener) = tap_timer(connectable_transport(vec![0x00]));
        tap_timer.connect().await.unwrap();
        listener.take();

        tap_timer.handle_disconnected().await;
        tap_timer.handle_disconnected().await;

        assert_eq!(listener.take(), vec!["disconnect_succeeded"]);
        assert!(matches!(tap_timer.stop().await, Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn test_link_drop_while_connecting_fails_the_connect() {
        tokio::time::pause();

        let transport =
            Arc::new(SlowTransport::default().with_discover_delay(Duration::from_millis(200)));
        let config = ManagerConfig::default().retry_delay(Duration::from_millis(1));
        let tap_timer = Arc::new(TapTimer::new(transport.clone(), &config));
        let listener = Arc::new(RecordingListener::default());
        tap_timer.set_listener(listener.clone());
        tap_timer.set_auto_reconnect(true);

        let pending = {
            let tap_timer = tap_timer.clone();
            tokio::spawn(async move { tap_timer.connect().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        // A second connect is refused while the first is in flight.
        assert!(matches!(
            tap_timer.connect().await,
            Err(Error::ConnectionFailed { .. })
        ));

        tap_timer.handle_disconnected().await;

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(Error::ConnectionFailed { .. })));
        assert_eq!(transport.connects(), 1);
        assert_eq!(
            listener.take(),
            vec![
                "started_connecting",
                "connect_failed: Connection failed: link dropped while connecting"
            ]
        );
        assert_eq!(tap_timer.connection_state(), ConnectionState::Disconnected);
        assert!(matches!(tap_timer.stop().await, Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn test_auto_reconnect_after_link_loss() {
        let (tap_timer, listener) = tap_timer(connectable_transport(vec![0x00]));
        tap_timer.set_auto_reconnect(true);
        tap_timer.connect().await.unwrap();
        listener.take();

        tap_timer.handle_disconnected().await;

        assert_eq!(
            listener.take(),
            vec![
                "disconnect_succeeded",
                "started_connecting",
                "connect_succeeded"
            ]
        );
        assert!(tap_timer.is_connected());
    }

    #[tokio::test]
    async fn test_connection_state_callback() {
        let (tap_timer, _listener) = tap_timer(connectable_transport(vec![0x00]));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let handle = tap_timer.on_connection_state_changed(move |state| {
            seen_clone.lock().push(state);
        });

        tap_timer.connect().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(
            *seen.lock(),
            vec![ConnectionState::Connecting, ConnectionState::Connected]
        );
        handle.unregister();
    }
}
