/// Errors that can occur during SIPC5 frame encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The decoder expected a frame start and found something else.
    ///
    /// The offending byte has already been dropped; feeding the decoder again
    /// resynchronizes on the next start byte.
    #[error("bad framing: byte {byte:#04x} is not a frame start")]
    BadFraming { byte: u8 },

    /// The frame exceeds the configured transport MTU.
    #[error("frame too large ({size} bytes, max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// The length field is smaller than the header it belongs to.
    #[error("frame length {length} shorter than its {header_len}-byte header")]
    LengthUnderflow { length: usize, header_len: usize },

    /// A reassembled multi-frame message grew past its bound.
    #[error("message on channel {channel} too large ({size} bytes, max {max})")]
    MessageTooLarge {
        channel: u8,
        size: usize,
        max: usize,
    },

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The stream was closed before a complete frame was received.
    #[error("connection closed (incomplete frame)")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, FrameError>;
