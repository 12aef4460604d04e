use bytes::BytesMut;
use tracing::{debug, warn};

use crate::codec::{Frame, FrameConfig, FrameDecoder};
use crate::error::FrameError;
use crate::reassembly::Reassembler;

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;

/// Turns an inbound byte stream into complete messages.
///
/// Combines the resumable decoder, resynchronization after framing errors,
/// and multi-frame reassembly. Bytes may arrive in arbitrary pieces.
#[derive(Debug)]
pub struct Deframer {
    buf: BytesMut,
    decoder: FrameDecoder,
    reassembler: Reassembler,
    dropped_bytes: u64,
    rejected_messages: u64,
    in_resync: bool,
}

impl Deframer {
    pub fn new(config: &FrameConfig) -> Self {
        Self {
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            decoder: FrameDecoder::new(config.max_frame_size),
            reassembler: Reassembler::new(config.max_message_size),
            dropped_bytes: 0,
            rejected_messages: 0,
            in_resync: false,
        }
    }

    /// Feed inbound bytes, handing every completed message to `sink`.
    ///
    /// Returns the number of messages delivered by this call.
    pub fn feed(&mut self, data: &[u8], mut sink: impl FnMut(Frame)) -> usize {
        self.buf.extend_from_slice(data);
        let mut delivered = 0;
        loop {
            match self.decoder.decode(&mut self.buf) {
                Ok(Some(frame)) => {
                    if self.in_resync {
                        debug!("decoder resynchronized");
                        self.in_resync = false;
                    }
                    match self.reassembler.push(frame) {
                        Ok(Some(message)) => {
                            sink(message);
                            delivered += 1;
                        }
                        Ok(None) => {}
                        Err(err) => {
                            self.rejected_messages += 1;
                            warn!(error = %err, "dropping message");
                        }
                    }
                }
                Ok(None) => break,
                Err(err) => self.note_desync(&err),
            }
        }
        delivered
    }

    fn note_desync(&mut self, err: &FrameError) {
        self.dropped_bytes += 1;
        if !self.in_resync {
            warn!(error = %err, "framing lost, resynchronizing");
            self.in_resync = true;
        }
    }

    /// Bytes held back waiting for the rest of a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Bytes discarded while hunting for a frame start.
    pub fn dropped_bytes(&self) -> u64 {
        self.dropped_bytes
    }

    /// Messages discarded by the reassembler.
    pub fn rejected_messages(&self) -> u64 {
        self.rejected_messages
    }

    /// Forget all partial state, e.g. after a link reset.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.decoder.reset();
        self.reassembler.clear();
        self.in_resync = false;
    }
}

impl Default for Deframer {
    fn default() -> Self {
        Self::new(&FrameConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{FMT_0, PDP_0};
    use crate::codec::encode_frame;
    use crate::reassembly::Fragmenter;

    #[test]
    fn delivers_across_arbitrary_chunks() {
        let mut wire = BytesMut::new();
        encode_frame(PDP_0, None, b"first", true, &mut wire).unwrap();
        encode_frame(PDP_0 + 1, None, b"second", true, &mut wire).unwrap();

        for chunk_size in 1..=wire.len() {
            let mut deframer = Deframer::default();
            let mut got = Vec::new();
            for chunk in wire.chunks(chunk_size) {
                deframer.feed(chunk, |f| got.push(f));
            }
            assert_eq!(got.len(), 2, "chunk size {chunk_size}");
            assert_eq!(got[0].payload.as_ref(), b"first");
            assert_eq!(got[1].channel, PDP_0 + 1);
            assert_eq!(deframer.buffered(), 0);
        }
    }

    #[test]
    fn garbage_between_frames_is_skipped() {
        let mut wire = BytesMut::new();
        encode_frame(1, None, b"a", false, &mut wire).unwrap();
        wire.extend_from_slice(&[0x00, 0x13, 0x37]);
        encode_frame(2, None, b"b", false, &mut wire).unwrap();

        let mut deframer = Deframer::default();
        let mut got = Vec::new();
        let n = deframer.feed(&wire, |f| got.push(f.channel));
        assert_eq!(n, 2);
        assert_eq!(got, vec![1, 2]);
        assert_eq!(deframer.dropped_bytes(), 3);
    }

    #[test]
    fn reassembles_fragmented_fmt_messages() {
        let config = FrameConfig {
            max_frame_size: 24,
            ..FrameConfig::default()
        };
        let message = vec![0x5Au8; 100];
        let mut wire = BytesMut::new();
        Fragmenter::new()
            .encode(FMT_0, &message, &config, &mut wire)
            .unwrap();

        let mut deframer = Deframer::new(&config);
        let mut got = Vec::new();
        deframer.feed(&wire, |f| got.push(f));
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].payload.as_ref(), message.as_slice());
    }

    #[test]
    fn reset_discards_partial_frame() {
        let mut wire = BytesMut::new();
        encode_frame(1, None, b"partial", false, &mut wire).unwrap();

        let mut deframer = Deframer::default();
        assert_eq!(deframer.feed(&wire[..6], |_| {}), 0);
        assert!(deframer.buffered() > 0);
        deframer.reset();
        assert_eq!(deframer.buffered(), 0);

        let mut got = 0;
        deframer.feed(&wire, |_| got += 1);
        assert_eq!(got, 1);
    }
}
