//! Manual watering commands.
//!
//! Commands are written as a 4-byte payload to the manual characteristic:
//!
//! | Byte | Meaning                     |
//! |------|-----------------------------|
//! | 0    | `0x01` = start, `0x00` = stop |
//! | 1-2  | Reserved, always `0x00`     |
//! | 3    | Runtime in minutes          |

/// Longest runtime a single start command can request, in minutes.
pub const MAX_RUNTIME_MINUTES: u8 = 255;

/// Runtime used when none is given, in minutes.
pub const DEFAULT_RUNTIME_MINUTES: u32 = 1;

/// A command for the manual characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ManualCommand {
    /// Open the tap for a number of minutes.
    Start {
        /// Runtime in minutes.
        minutes: u8,
    },
    /// Close the tap.
    Stop,
}

impl ManualCommand {
    /// Build a start command, clamping the runtime to [`MAX_RUNTIME_MINUTES`].
    pub fn start(runtime_minutes: u32) -> Self {
        let minutes = runtime_minutes.min(u32::from(MAX_RUNTIME_MINUTES)) as u8;
        Self::Start { minutes }
    }

    /// Build a stop command.
    pub fn stop() -> Self {
        Self::Stop
    }

    /// Encode the command payload.
    pub fn to_bytes(&self) -> [u8; 4] {
        match self {
            Self::Start { minutes } => [0x01, 0x00, 0x00, *minutes],
            Self::Stop => [0x00, 0x00, 0x00, 0x00],
        }
    }
}

impl Default for ManualCommand {
    fn default() -> Self {
        Self::start(DEFAULT_RUNTIME_MINUTES)
    }
}

impl std::fmt::Display for ManualCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Start { minutes } => write!(f, "start for {} min", minutes),
            Self::Stop => write!(f, "stop"),
        }
    }
}
