//! Listener traits for tap timer events.
//!
//! Implement [`TapTimerListener`] to follow the connection lifecycle of a
//! [`TapTimer`], and [`TapTimerManagerListener`] to be told about tap timers
//! found during discovery. Every method has an empty default, so
//! implementors only override the events they care about.

use std::sync::Arc;

use crate::error::Error;
use crate::tap_timer::TapTimer;

/// Receives connection lifecycle events from a [`TapTimer`].
pub trait TapTimerListener: Send + Sync {
    /// A connection attempt has started.
    fn started_connecting(&self, _tap_timer: &TapTimer) {}

    /// The tap timer is connected and its Holman service resolved.
    fn connect_succeeded(&self, _tap_timer: &TapTimer) {}

    /// The connection attempt failed.
    fn connect_failed(&self, _tap_timer: &TapTimer, _error: &Error) {}

    /// A disconnect has been requested.
    fn started_disconnecting(&self, _tap_timer: &TapTimer) {}

    /// The tap timer is disconnected, either on request or because the link
    /// dropped.
    fn disconnect_succeeded(&self, _tap_timer: &TapTimer) {}
}

/// Receives discovery events from a
/// [`TapTimerManager`](crate::TapTimerManager).
pub trait TapTimerManagerListener: Send + Sync {
    /// Called once for each tap timer discovered nearby.
    fn tap_timer_discovered(&self, _tap_timer: &Arc<TapTimer>) {}
}
