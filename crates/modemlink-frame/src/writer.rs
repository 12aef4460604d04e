use std::io::{self, ErrorKind, Write};

use bytes::BytesMut;

use crate::codec::{encode_frame, Frame, FrameConfig};
use crate::error::{FrameError, Result};
use crate::reassembly::Fragmenter;

/// Blocking SIPC5 writer.
///
/// Every call emits whole frames and then flushes, so the far end never
/// sits on half a header.
pub struct FrameWriter<T> {
    inner: T,
    scratch: BytesMut,
    fragmenter: Fragmenter,
    config: FrameConfig,
}

impl<T: Write> FrameWriter<T> {
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, &FrameConfig::default())
    }

    pub fn with_config(inner: T, config: &FrameConfig) -> Self {
        Self {
            inner,
            scratch: BytesMut::new(),
            fragmenter: Fragmenter::new(),
            config: config.clone(),
        }
    }

    /// Write `frame` as is, control byte included.
    pub fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        let size = frame.wire_size(self.config.align);
        if size > self.config.max_frame_size {
            return Err(FrameError::FrameTooLarge {
                size,
                max: self.config.max_frame_size,
            });
        }
        self.scratch.clear();
        encode_frame(
            frame.channel,
            frame.control,
            &frame.payload,
            self.config.align,
            &mut self.scratch,
        )?;
        self.emit()
    }

    /// Frame and write a message, splitting FMT messages over the MTU.
    /// Returns the number of frames written.
    pub fn send(&mut self, channel: u8, payload: &[u8]) -> Result<usize> {
        self.scratch.clear();
        let frames = self
            .fragmenter
            .encode(channel, payload, &self.config, &mut self.scratch)?;
        self.emit()?;
        Ok(frames)
    }

    fn emit(&mut self) -> Result<()> {
        let mut pending = &self.scratch[..];
        while !pending.is_empty() {
            match self.inner.write(pending) {
                Ok(0) => return Err(FrameError::ConnectionClosed),
                Ok(n) => pending = &pending[n..],
                Err(err) if retryable(&err) => {}
                Err(err) => return Err(err.into()),
            }
        }
        loop {
            match self.inner.flush() {
                Ok(()) => return Ok(()),
                Err(err) if retryable(&err) => {}
                Err(err) => return Err(err.into()),
            }
        }
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

fn retryable(err: &io::Error) -> bool {
    matches!(err.kind(), ErrorKind::Interrupted | ErrorKind::WouldBlock)
}
