use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::codec::{encode_frame, Frame, FrameConfig, FrameDecoder};
use crate::error::FrameError;

/// SIPC5 codec for `tokio_util::codec::{FramedRead, FramedWrite}`.
#[derive(Debug, Clone)]
pub struct Sipc5Codec {
    decoder: FrameDecoder,
    config: FrameConfig,
}

impl Sipc5Codec {
    pub fn new(config: FrameConfig) -> Self {
        Self {
            decoder: FrameDecoder::new(config.max_frame_size),
            config,
        }
    }
}

impl Default for Sipc5Codec {
    fn default() -> Self {
        Self::new(FrameConfig::default())
    }
}

impl Decoder for Sipc5Codec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.decoder.decode(src)
    }
}

impl Encoder<Frame> for Sipc5Codec {
    type Error = FrameError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let size = item.wire_size(self.config.align);
        if size > self.config.max_frame_size {
            return Err(FrameError::FrameTooLarge {
                size,
                max: self.config.max_frame_size,
            });
        }
        encode_frame(
            item.channel,
            item.control,
            item.payload.as_ref(),
            self.config.align,
            dst,
        )?;
        Ok(())
    }
}
