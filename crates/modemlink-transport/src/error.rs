use std::time::Duration;

use modemlink_frame::FrameError;

/// Errors that can occur in link transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The region (or serial link) has not completed its handshake.
    #[error("link inactive: handshake not established")]
    LinkInactive,

    /// Not enough free space in the outbound queue.
    #[error("{queue} queue full: need {needed} bytes, {free} free")]
    Backpressure {
        queue: &'static str,
        needed: usize,
        free: usize,
    },

    /// A ring pointer was observed outside `[0, size)`.
    #[error("corrupt {queue} queue: head {head}, tail {tail}, size {size}")]
    CorruptQueue {
        queue: &'static str,
        head: u32,
        tail: u32,
        size: u32,
    },

    /// A bounded wait expired.
    #[error("{op} timed out after {waited:?}")]
    Timeout { op: &'static str, waited: Duration },

    /// Another transfer owns the channel.
    #[error("channel {channel} busy")]
    Busy { channel: u8 },

    /// The link was reset or terminated while waiting.
    #[error("link reset while waiting")]
    Reset,

    /// The channel id has no route on this transport.
    #[error("unknown channel {0}")]
    UnknownChannel(u8),

    /// The operation is not supported by this transport.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// The mapped region cannot hold the requested layout.
    #[error("region too small: need {need} bytes, have {have}")]
    RegionTooSmall { need: usize, have: usize },

    /// An access fell outside the mapped region.
    #[error("access out of bounds: offset {offset}, len {len}, region {size}")]
    OutOfBounds {
        offset: usize,
        len: usize,
        size: usize,
    },

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// An I/O error occurred on the physical link.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TransportError>;
