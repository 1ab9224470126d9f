//! Protocol module for constructing commands and parsing state.
//!
//! This module contains the implementations for:
//! - Manual watering command payloads
//! - Tap state parsing

pub mod commands;
pub mod state;

pub use commands::{ManualCommand, DEFAULT_RUNTIME_MINUTES, MAX_RUNTIME_MINUTES};
pub use state::TapState;
