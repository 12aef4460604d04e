use std::fmt;

use modemlink_frame::is_boot;
use serde::Serialize;

use crate::error::LinkError;

/// Communication state of a link device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommState {
    /// Link down.
    None,
    /// Region reset, waiting for the modem to finish initialization.
    Handshake,
    /// Firmware download in progress.
    Boot,
    /// Every channel carries traffic.
    Online,
    /// Modem crashed; a reset is required.
    Crash,
}

impl CommState {
    /// Whether `channel` may carry traffic in this state.
    pub fn admits(self, channel: u8) -> Result<(), LinkError> {
        match self {
            CommState::Online => Ok(()),
            CommState::Handshake | CommState::Boot if is_boot(channel) => Ok(()),
            CommState::Crash => Err(LinkError::PeerCrashed),
            state => Err(LinkError::NotReady { state }),
        }
    }

    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// Any state may drop to `None` or restart at `Handshake`.
    pub fn can_transition(self, next: CommState) -> bool {
        matches!(
            (self, next),
            (_, CommState::None | CommState::Handshake)
                | (CommState::Handshake, CommState::Boot | CommState::Online)
                | (CommState::Boot, CommState::Online)
                | (
                    CommState::Handshake | CommState::Boot | CommState::Online,
                    CommState::Crash
                )
        )
    }
}

impl fmt::Display for CommState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CommState::None => "none",
            CommState::Handshake => "handshake",
            CommState::Boot => "boot",
            CommState::Online => "online",
            CommState::Crash => "crash",
        })
    }
}
