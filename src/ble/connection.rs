//! BLE connection management.
//!
//! Tracks the connection state of a tap timer and drives the underlying
//! link through connect and disconnect transitions.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::ble::transport::GattTransport;
use crate::error::{Error, Result};

/// Connection state for a tap timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConnectionState {
    /// Not connected to the tap timer.
    #[default]
    Disconnected,
    /// Currently attempting to connect.
    Connecting,
    /// Connected to the tap timer.
    Connected,
    /// Currently disconnecting.
    Disconnecting,
}

impl ConnectionState {
    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Check if in a transitional state.
    pub fn is_transitioning(&self) -> bool {
        matches!(self, Self::Connecting | Self::Disconnecting)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Disconnecting => write!(f, "Disconnecting"),
        }
    }
}

/// Event for connection state changes.
#[derive(Debug, Clone)]
pub struct ConnectionEvent {
    /// The identifier of the peripheral.
    pub identifier: String,
    /// The new connection state.
    pub state: ConnectionState,
}

/// Manages the connection to a single tap timer.
pub struct ConnectionManager {
    /// The peripheral to manage.
    transport: Arc<dyn GattTransport>,
    /// Current connection state.
    state: Arc<RwLock<ConnectionState>>,
    /// Whether to maintain the connection (retry connects).
    maintain_connection: Arc<RwLock<bool>>,
    /// Channel for connection events.
    event_tx: broadcast::Sender<ConnectionEvent>,
    /// Maximum connection attempts when maintaining the connection.
    max_attempts: u32,
    /// Delay between connection attempts.
    retry_delay: Duration,
    /// Time allowed for a single connection attempt.
    connect_timeout: Duration,
    /// The platform reported a drop while connecting.
    link_lost: AtomicBool,
}

impl ConnectionManager {
    /// Create a new connection manager for a peripheral.
    pub fn new(transport: Arc<dyn GattTransport>) -> Self {
        let (event_tx, _) = broadcast::channel(16);

        Self {
            transport,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            maintain_connection: Arc::new(RwLock::new(false)),
            event_tx,
            max_attempts: 3,
            retry_delay: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(30),
            link_lost: AtomicBool::new(false),
        }
    }

    /// Get the current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Subscribe to connection events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.event_tx.subscribe()
    }

    /// Attempt to connect and resolve services.
    ///
    /// # Arguments
    ///
    /// * `maintain` - Retry failed attempts and keep the connection maintained
    ///
    /// Only one connect runs at a time; a concurrent call fails with
    /// [`Error::ConnectionFailed`].
    pub async fn connect(&self, maintain: bool) -> Result<()> {
        let current_state = {
            let mut state = self.state.write();
            let current = *state;
            if current == ConnectionState::Disconnected {
                *state = ConnectionState::Connecting;
            }
            current
        };

        match current_state {
            ConnectionState::Connected => {
                debug!("Already connected");
                return Ok(());
            }
            ConnectionState::Connecting | ConnectionState::Disconnecting => {
                return Err(Error::ConnectionFailed {
                    reason: format!("{} already in progress", current_state),
                });
            }
            ConnectionState::Disconnected => {
                debug!("Connection state changed: Disconnected -> Connecting");
                self.emit(ConnectionState::Connecting);
            }
        }

        self.link_lost.store(false, Ordering::SeqCst);
        *self.maintain_connection.write() = maintain;

        if self.transport.is_connected().await.unwrap_or(false) {
            info!("Peripheral already connected at BLE level");
            return self.finish_connect().await;
        }

        let mut attempts = 0;
        let max_attempts = if maintain { self.max_attempts.max(1) } else { 1 };
        let mut last_error = None;

        while attempts < max_attempts {
            attempts += 1;

            debug!("Connection attempt {} of {}", attempts, max_attempts);
            self.link_lost.store(false, Ordering::SeqCst);

            let outcome =
                match tokio::time::timeout(self.connect_timeout, self.transport.connect()).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::Timeout {
                        operation: format!("connecting to {}", self.transport.identifier()),
                    }),
                };

            match outcome {
                Ok(()) => {
                    info!("Connected to {}", self.transport.identifier());
                    return self.finish_connect().await;
                }
                Err(e) => {
                    warn!("Connection attempt {} failed: {}", attempts, e);
                    last_error = Some(e);

                    if attempts < max_attempts {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
            }
        }

        self.set_state(ConnectionState::Disconnected);
        let reason = match last_error {
            Some(e @ Error::Timeout { .. }) => return Err(e),
            Some(e) if max_attempts == 1 => e.to_string(),
            Some(e) => format!("Failed after {} attempts: {}", max_attempts, e),
            None => format!("Failed after {} attempts", max_attempts),
        };
        Err(Error::ConnectionFailed { reason })
    }

    /// Resolve services once the link is up.
    async fn finish_connect(&self) -> Result<()> {
        if let Err(e) = self.transport.discover_services().await {
            warn!("Failed to discover services: {}", e);
            let _ = self.transport.disconnect().await;
            self.set_state(ConnectionState::Disconnected);
            return Err(Error::ConnectionFailed {
                reason: format!("Service discovery failed: {}", e),
            });
        }

        let connected = {
            let mut state = self.state.write();
            let connected = *state == ConnectionState::Connecting
                && !self.link_lost.load(Ordering::SeqCst);
            if connected {
                *state = ConnectionState::Connected;
            }
            connected
        };

        if !connected {
            warn!("Link to {} dropped while connecting", self.transport.identifier());
            let _ = self.transport.disconnect().await;
            self.set_state(ConnectionState::Disconnected);
            return Err(Error::ConnectionFailed {
                reason: "link dropped while connecting".to_string(),
            });
        }

        debug!("Connection state changed: Connecting -> Connected");
        self.emit(ConnectionState::Connected);
        Ok(())
    }

    /// Disconnect from the tap timer.
    ///
    /// A link the platform still reports as connected is closed even when
    /// this manager never opened it.
    pub async fn disconnect(&self) -> Result<()> {
        *self.maintain_connection.write() = false;

        let current_state = self.state();

        if current_state == ConnectionState::Disconnecting {
            return Ok(());
        }

        if current_state == ConnectionState::Disconnected
            && !self.transport.is_connected().await.unwrap_or(false)
        {
            debug!("Not connected, nothing to disconnect");
            return Ok(());
        }

        self.set_state(ConnectionState::Disconnecting);

        match self.transport.disconnect().await {
            Ok(()) => {
                info!("Disconnected from {}", self.transport.identifier());
                self.set_state(ConnectionState::Disconnected);
                Ok(())
            }
            Err(e) => {
                error!("Failed to disconnect: {}", e);
                self.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    /// Check if we're maintaining the connection.
    pub fn is_maintaining_connection(&self) -> bool {
        *self.maintain_connection.read()
    }

    /// Set the retry parameters used when maintaining the connection.
    pub fn set_retry_params(&mut self, max_attempts: u32, delay: Duration) {
        self.max_attempts = max_attempts;
        self.retry_delay = delay;
    }

    /// Set the time allowed for a single connection attempt.
    pub fn set_connect_timeout(&mut self, timeout: Duration) {
        self.connect_timeout = timeout;
    }

    /// Handle a disconnection reported by the platform.
    ///
    /// Returns `true` when an established link dropped. A drop while
    /// connecting makes the pending [`connect`](Self::connect) fail instead,
    /// and disconnects started through [`disconnect`](Self::disconnect) are
    /// reported by that call, so both return `false`.
    pub fn handle_disconnection(&self) -> bool {
        let dropped = {
            let mut state = self.state.write();
            match *state {
                ConnectionState::Connected => {
                    *state = ConnectionState::Disconnected;
                    true
                }
                ConnectionState::Connecting => {
                    self.link_lost.store(true, Ordering::SeqCst);
                    false
                }
                _ => false,
            }
        };

        if dropped {
            info!("Connection to {} lost", self.transport.identifier());
            self.emit(ConnectionState::Disconnected);
        }

        dropped
    }

    /// Update the connection state and emit an event.
    fn set_state(&self, new_state: ConnectionState) {
        let old_state = {
            let mut state = self.state.write();
            let old = *state;
            *state = new_state;
            old
        };

        if old_state != new_state {
            debug!("Connection state changed: {} -> {}", old_state, new_state);
            self.emit(new_state);
        }
    }

    fn emit(&self, state: ConnectionState) {
        let _ = self.event_tx.send(ConnectionEvent {
            identifier: self.transport.identifier(),
            state,
        });
    }
}
