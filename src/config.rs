//! Configuration for the tap timer manager.

use std::time::Duration;

/// Settings used by [`TapTimerManager`](crate::TapTimerManager).
///
/// Built with chained setters:
///
/// ```
/// use holman_ble::ManagerConfig;
/// use std::time::Duration;
///
/// let config = ManagerConfig::default()
///     .adapter_name("hci0")
///     .lookup_timeout(Duration::from_secs(5));
/// assert_eq!(config.adapter(), Some("hci0"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ManagerConfig {
    /// Name of the Bluetooth adapter to use. The first adapter is used when unset.
    adapter_name: Option<String>,
    /// How long to scan for a tap timer that is not yet known to the adapter.
    lookup_timeout: Duration,
    /// Connection attempts made when reconnecting automatically.
    connect_attempts: u32,
    /// Delay between connection attempts.
    retry_delay: Duration,
    /// Time allowed for a single connection attempt.
    connect_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            adapter_name: None,
            lookup_timeout: Duration::from_secs(10),
            connect_attempts: 3,
            retry_delay: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(30),
        }
    }
}

impl ManagerConfig {
    /// Use the adapter with the given name, e.g. `hci0`.
    pub fn adapter_name(mut self, name: impl Into<String>) -> Self {
        self.adapter_name = Some(name.into());
        self
    }

    /// Scan for at most `timeout` when looking up a tap timer by address.
    pub fn lookup_timeout(mut self, timeout: Duration) -> Self {
        self.lookup_timeout = timeout;
        self
    }

    /// Number of connection attempts when reconnecting automatically.
    /// Values below one are treated as one.
    pub fn connect_attempts(mut self, attempts: u32) -> Self {
        self.connect_attempts = attempts.max(1);
        self
    }

    /// Delay between connection attempts.
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Give up on a connection attempt after `timeout`.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// The configured adapter name.
    pub fn adapter(&self) -> Option<&str> {
        self.adapter_name.as_deref()
    }

    /// The configured lookup timeout.
    pub fn lookup_timeout_duration(&self) -> Duration {
        self.lookup_timeout
    }

    /// The configured number of connection attempts.
    pub fn attempts(&self) -> u32 {
        self.connect_attempts
    }

    /// The configured retry delay.
    pub fn retry_delay_duration(&self) -> Duration {
        self.retry_delay
    }

    /// The configured connection attempt timeout.
    pub fn connect_timeout_duration(&self) -> Duration {
        self.connect_timeout
    }
}
