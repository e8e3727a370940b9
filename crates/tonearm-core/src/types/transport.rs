//! Transport state of a playback session.

use serde::{Deserialize, Serialize};

/// Transport state of the engine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum TransportState {
    #[default]
    Stopped,
    Playing,
    Paused,
}

impl TransportState {
    pub const fn is_playing(self) -> bool {
        matches!(self, Self::Playing)
    }

    /// Label used by hosts for the state.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Playing => "playing",
            Self::Paused => "paused",
        }
    }
}

impl std::fmt::Display for TransportState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_state_default() {
        assert_eq!(TransportState::default(), TransportState::Stopped);
        assert!(!TransportState::default().is_playing());
        assert_eq!(TransportState::Paused.to_string(), "paused");
    }
}
