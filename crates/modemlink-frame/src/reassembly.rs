//! Multi-frame messages on formatted channels.
//!
//! A formatted message larger than the transport MTU travels as a run of
//! frames sharing a frame id; every frame but the last carries
//! [`CONTROL_MORE`].

use std::collections::HashMap;

use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};

use crate::channel::ChannelClass;
use crate::codec::{
    encode_frame, encoded_len, Frame, FrameConfig, ALIGNMENT, CONTROL_ID_MASK, CONTROL_MORE,
    MAX_HEADER_SIZE,
};
use crate::error::{FrameError, Result};

/// Joins continuation frames into complete messages.
#[derive(Debug)]
pub struct Reassembler {
    pending: HashMap<(u8, u8), BytesMut>,
    max_message_size: usize,
}

impl Reassembler {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            pending: HashMap::new(),
            max_message_size,
        }
    }

    /// Accept one decoded frame.
    ///
    /// Returns the complete message once the closing frame arrives; frames on
    /// channels that do not reassemble pass straight through.
    pub fn push(&mut self, frame: Frame) -> Result<Option<Frame>> {
        if !ChannelClass::of(frame.channel).reassembles() {
            return Ok(Some(frame));
        }
        let Some(control) = frame.control else {
            return Ok(Some(frame));
        };

        let key = (frame.channel, control & CONTROL_ID_MASK);
        if frame.more() {
            let buffered = self.pending.get(&key).map_or(0, BytesMut::len);
            let size = buffered + frame.payload.len();
            if size > self.max_message_size {
                self.pending.remove(&key);
                return Err(FrameError::MessageTooLarge {
                    channel: frame.channel,
                    size,
                    max: self.max_message_size,
                });
            }
            self.pending
                .entry(key)
                .or_default()
                .extend_from_slice(&frame.payload);
            return Ok(None);
        }

        match self.pending.remove(&key) {
            Some(mut head) => {
                let size = head.len() + frame.payload.len();
                if size > self.max_message_size {
                    return Err(FrameError::MessageTooLarge {
                        channel: frame.channel,
                        size,
                        max: self.max_message_size,
                    });
                }
                head.extend_from_slice(&frame.payload);
                debug!(channel = frame.channel, len = size, "reassembled message");
                Ok(Some(Frame {
                    channel: frame.channel,
                    control: frame.control,
                    payload: head.freeze(),
                }))
            }
            None => Ok(Some(frame)),
        }
    }

    /// Number of messages still waiting for their closing frame.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Discard every partial message.
    pub fn clear(&mut self) {
        if !self.pending.is_empty() {
            warn!(count = self.pending.len(), "dropping partial messages");
        }
        self.pending.clear();
    }
}

/// Splits outbound messages into frames no larger than the MTU.
#[derive(Debug, Default)]
pub struct Fragmenter {
    next_id: u8,
}

impl Fragmenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode `payload` for `channel`, appending every frame to `dst`.
    ///
    /// Formatted channels always carry a control byte with a rolling frame
    /// id and are split as needed. Other channels must fit one frame.
    /// Returns the number of frames written.
    pub fn encode(
        &mut self,
        channel: u8,
        payload: &[u8],
        config: &FrameConfig,
        dst: &mut BytesMut,
    ) -> Result<usize> {
        if !ChannelClass::of(channel).reassembles() {
            let size = encoded_len(None, payload.len(), config.align);
            if size > config.max_frame_size {
                return Err(FrameError::FrameTooLarge {
                    size,
                    max: config.max_frame_size,
                });
            }
            encode_frame(channel, None, payload, config.align, dst)?;
            return Ok(1);
        }

        if payload.len() > config.max_message_size {
            return Err(FrameError::MessageTooLarge {
                channel,
                size: payload.len(),
                max: config.max_message_size,
            });
        }

        let id = self.next_id & CONTROL_ID_MASK;
        self.next_id = self.next_id.wrapping_add(1) & CONTROL_ID_MASK;

        if encoded_len(Some(id), payload.len(), config.align) <= config.max_frame_size {
            encode_frame(channel, Some(id), payload, config.align, dst)?;
            return Ok(1);
        }

        let chunk = max_chunk(config)?;
        let mut frames = 0;
        let mut parts = payload.chunks(chunk).peekable();
        while let Some(part) = parts.next() {
            let control = if parts.peek().is_some() {
                id | CONTROL_MORE
            } else {
                id
            };
            encode_frame(channel, Some(control), part, config.align, dst)?;
            frames += 1;
        }
        Ok(frames)
    }
}

/// Largest payload slice that still fits a frame with a control byte.
fn max_chunk(config: &FrameConfig) -> Result<usize> {
    let slack = MAX_HEADER_SIZE + if config.align { ALIGNMENT - 1 } else { 0 };
    match config.max_frame_size.checked_sub(slack) {
        Some(chunk) if chunk > 0 => Ok(chunk),
        _ => Err(FrameError::FrameTooLarge {
            size: slack + 1,
            max: config.max_frame_size,
        }),
    }
}

/// Concatenate the payloads of frames that belong to one message.
pub fn join_payloads(frames: &[Frame]) -> Bytes {
    let mut out = BytesMut::with_capacity(frames.iter().map(|f| f.payload.len()).sum());
    for frame in frames {
        out.extend_from_slice(&frame.payload);
    }
    out.freeze()
}
