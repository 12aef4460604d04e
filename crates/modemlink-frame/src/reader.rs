use std::io::{ErrorKind, Read};

use bytes::BytesMut;
use tracing::debug;

use crate::codec::{Frame, FrameConfig, FrameDecoder};
use crate::error::{FrameError, Result};
use crate::reassembly::Reassembler;

const READ_CHUNK_SIZE: usize = 4 * 1024;

/// Blocking SIPC5 reader over any byte stream (a tty, a dump file, a pipe).
///
/// [`read_frame`](Self::read_frame) yields frames as they appear on the
/// wire; [`read_message`](Self::read_message) also joins multi-frame FMT
/// messages.
pub struct FrameReader<T> {
    inner: T,
    buf: BytesMut,
    decoder: FrameDecoder,
    reassembler: Reassembler,
    skipped: u64,
}

impl<T: Read> FrameReader<T> {
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, &FrameConfig::default())
    }

    pub fn with_config(inner: T, config: &FrameConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(READ_CHUNK_SIZE),
            decoder: FrameDecoder::new(config.max_frame_size),
            reassembler: Reassembler::new(config.max_message_size),
            skipped: 0,
        }
    }

    /// Pull more bytes from the stream. `Ok(false)` at end of stream.
    fn fill(&mut self) -> Result<bool> {
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        loop {
            match self.inner.read(&mut chunk) {
                Ok(0) => return Ok(false),
                Ok(n) => {
                    self.buf.extend_from_slice(&chunk[..n]);
                    return Ok(true);
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
    }

    /// Next frame on the wire (blocking).
    ///
    /// A framing error drops one byte and is returned to the caller; the
    /// next call continues the search for a start byte. End of stream is
    /// `ConnectionClosed`, also when it cuts a frame short.
    pub fn read_frame(&mut self) -> Result<Frame> {
        loop {
            if let Some(frame) = self.decoder.decode(&mut self.buf)? {
                return Ok(frame);
            }
            if !self.fill()? {
                return Err(FrameError::ConnectionClosed);
            }
        }
    }

    /// Next frame, silently stepping over bytes that cannot start one.
    pub fn read_frame_resync(&mut self) -> Result<Frame> {
        loop {
            match self.read_frame() {
                Err(
                    err @ (FrameError::BadFraming { .. }
                    | FrameError::LengthUnderflow { .. }
                    | FrameError::FrameTooLarge { .. }),
                ) => {
                    if self.skipped == 0 {
                        debug!(error = %err, "stream out of sync");
                    }
                    self.skipped += 1;
                }
                other => return other,
            }
        }
    }

    /// Next complete message, reassembled across FMT fragments.
    ///
    /// Messages the reassembler rejects are dropped and reading goes on.
    pub fn read_message(&mut self) -> Result<Frame> {
        loop {
            let frame = self.read_frame_resync()?;
            match self.reassembler.push(frame) {
                Ok(Some(message)) => return Ok(message),
                Ok(None) => {}
                Err(err) => debug!(error = %err, "dropping message"),
            }
        }
    }

    /// Bytes discarded while hunting for frame starts.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Bytes read but not yet part of a returned frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}
