use std::path::PathBuf;
use std::time::Duration;

use modemlink_frame::FrameError;
use modemlink_transport::TransportError;

use crate::state::CommState;

/// Errors surfaced to link consumers.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// The link state does not admit traffic on this channel.
    #[error("channel not accepted while link is {state}")]
    NotReady { state: CommState },

    /// Handshake not established.
    #[error("link inactive: handshake not established")]
    LinkInactive,

    /// No room in the outbound queue; retry or drop.
    #[error("channel {channel} backpressured")]
    Backpressure { channel: u8 },

    /// Peer state is untrustworthy; only a full reset recovers.
    #[error("corrupt queue, link reset required: {0}")]
    CorruptQueue(#[source] TransportError),

    /// Inbound stream lost framing.
    #[error("bad framing on inbound stream")]
    BadFraming,

    /// A bounded wait expired.
    #[error("{op} timed out after {waited:?}")]
    Timeout { op: &'static str, waited: Duration },

    /// Another transfer owns the channel.
    #[error("channel {channel} busy")]
    Busy { channel: u8 },

    /// The modem reported a crash (or one was forced).
    #[error("peer crashed")]
    PeerCrashed,

    #[error("unknown channel {0}")]
    UnknownChannel(u8),

    /// Other transport-level error.
    #[error("transport error: {0}")]
    Transport(#[source] TransportError),

    /// Other frame-level error.
    #[error("frame error: {0}")]
    Frame(#[source] FrameError),
}

impl LinkError {
    /// Map a transport error raised while sending on `channel`.
    pub fn from_transport(channel: u8, err: TransportError) -> Self {
        match err {
            TransportError::Backpressure { .. } => LinkError::Backpressure { channel },
            TransportError::Busy { channel } => LinkError::Busy { channel },
            other => other.into(),
        }
    }

    /// Whether the link must be reset before it can carry traffic again.
    pub fn requires_reset(&self) -> bool {
        matches!(self, LinkError::CorruptQueue(_) | LinkError::PeerCrashed)
    }
}

impl From<TransportError> for LinkError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::LinkInactive | TransportError::Reset => LinkError::LinkInactive,
            err @ TransportError::CorruptQueue { .. } => LinkError::CorruptQueue(err),
            TransportError::Timeout { op, waited } => LinkError::Timeout { op, waited },
            TransportError::Busy { channel } => LinkError::Busy { channel },
            TransportError::UnknownChannel(channel) => LinkError::UnknownChannel(channel),
            TransportError::Frame(err) => err.into(),
            other => LinkError::Transport(other),
        }
    }
}

impl From<FrameError> for LinkError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::BadFraming { .. } => LinkError::BadFraming,
            other => LinkError::Frame(other),
        }
    }
}

/// Errors loading a [`crate::LinkConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config json: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, LinkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_map_to_consumer_taxonomy() {
        let corrupt = TransportError::CorruptQueue {
            queue: "raw",
            head: 9,
            tail: 0,
            size: 8,
        };
        assert!(matches!(
            LinkError::from(corrupt),
            LinkError::CorruptQueue(_)
        ));
        assert!(matches!(
            LinkError::from(TransportError::Reset),
            LinkError::LinkInactive
        ));
        assert!(matches!(
            LinkError::from(TransportError::Frame(FrameError::BadFraming { byte: 0 })),
            LinkError::BadFraming
        ));
        assert!(matches!(
            LinkError::from(TransportError::Unsupported("x")),
            LinkError::Transport(_)
        ));
    }

    #[test]
    fn backpressure_carries_channel() {
        let err = LinkError::from_transport(
            10,
            TransportError::Backpressure {
                queue: "raw",
                needed: 4,
                free: 0,
            },
        );
        assert!(matches!(err, LinkError::Backpressure { channel: 10 }));
        assert!(!err.requires_reset());
        assert!(LinkError::PeerCrashed.requires_reset());
    }
}
