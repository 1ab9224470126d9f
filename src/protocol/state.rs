//! Tap state characteristic parsing.

/// Raw value of the tap state characteristic.
///
/// The tap is running when the last byte is `0x01`.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TapState {
    raw: Vec<u8>,
}

impl TapState {
    /// Wrap a value read from the state characteristic.
    pub fn from_bytes(data: &[u8]) -> Self {
        Self { raw: data.to_vec() }
    }

    /// Whether the tap is currently running.
    pub fn is_on(&self) -> bool {
        self.raw.last() == Some(&0x01)
    }

    /// The raw bytes as read.
    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }
}

impl Default for TapState {
    /// Off until the first read.
    fn default() -> Self {
        Self { raw: vec![0x00] }
    }
}

impl std::fmt::Display for TapState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_on() {
            write!(f, "on")
        } else {
            write!(f, "off")
        }
    }
}
