use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{FrameError, Result};

/// Config bit: this byte starts a frame.
pub const CONFIG_START: u8 = 0x80;
/// Config bit: a control byte follows the length field.
pub const CONFIG_CONTROL: u8 = 0x40;
/// Config bit: the length field is 32 bits wide instead of 16.
pub const CONFIG_EXT_LENGTH: u8 = 0x20;
/// Config bit: the payload is followed by padding up to a 4-byte boundary.
pub const CONFIG_PADDING: u8 = 0x10;
const CONFIG_RESERVED: u8 = 0x0F;

/// Control bit: more frames of the same message follow.
pub const CONTROL_MORE: u8 = 0x80;
/// Control bits carrying the frame id shared by all parts of one message.
pub const CONTROL_ID_MASK: u8 = 0x7F;

/// Config + channel + 16-bit length.
pub const MIN_HEADER_SIZE: usize = 4;
/// Config + channel + 32-bit length + control.
pub const MAX_HEADER_SIZE: usize = 7;

/// Frames on aligned transports end on this boundary.
pub const ALIGNMENT: usize = 4;

/// Default transport MTU: 64 KiB.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024;

/// Default bound on a reassembled multi-frame message: 1 MiB.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Header length implied by a config byte.
pub fn header_len(config: u8) -> usize {
    let mut len = MIN_HEADER_SIZE;
    if config & CONFIG_EXT_LENGTH != 0 {
        len += 2;
    }
    if config & CONFIG_CONTROL != 0 {
        len += 1;
    }
    len
}

/// Filler bytes needed after a frame of `frame_len` bytes on an aligned link.
pub fn padding_len(frame_len: usize) -> usize {
    (ALIGNMENT - frame_len % ALIGNMENT) % ALIGNMENT
}

/// Total wire size of a frame, padding included.
pub fn encoded_len(control: Option<u8>, payload_len: usize, align: bool) -> usize {
    let config = select_config(control, payload_len, align);
    let frame_len = header_len(config) + payload_len;
    if align {
        frame_len + padding_len(frame_len)
    } else {
        frame_len
    }
}

fn select_config(control: Option<u8>, payload_len: usize, align: bool) -> u8 {
    let mut config = CONFIG_START;
    if control.is_some() {
        config |= CONFIG_CONTROL;
    }
    if align {
        config |= CONFIG_PADDING;
    }
    let short_header = header_len(config);
    if short_header + payload_len > u16::MAX as usize {
        config |= CONFIG_EXT_LENGTH;
    }
    config
}

/// Parsed SIPC5 header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameMeta {
    /// Raw config byte.
    pub config: u8,
    /// Logical channel id.
    pub channel: u8,
    /// Length field: header plus payload, padding excluded.
    pub length: usize,
    /// Control byte, when present.
    pub control: Option<u8>,
}

impl FrameMeta {
    pub fn header_len(&self) -> usize {
        header_len(self.config)
    }

    pub fn data_len(&self) -> usize {
        self.length - self.header_len()
    }

    pub fn pad_len(&self) -> usize {
        if self.config & CONFIG_PADDING != 0 {
            padding_len(self.length)
        } else {
            0
        }
    }

    /// Bytes this frame occupies on the wire.
    pub fn wire_len(&self) -> usize {
        self.length + self.pad_len()
    }
}

/// Parse a complete header. `raw` must hold at least `header_len(raw[0])` bytes.
fn parse_header(raw: &[u8]) -> FrameMeta {
    let config = raw[0];
    let channel = raw[1];
    let (length, control_at) = if config & CONFIG_EXT_LENGTH != 0 {
        (u32::from_le_bytes([raw[2], raw[3], raw[4], raw[5]]) as usize, 6)
    } else {
        (u16::from_le_bytes([raw[2], raw[3]]) as usize, 4)
    };
    let control = (config & CONFIG_CONTROL != 0).then(|| raw[control_at]);
    FrameMeta {
        config,
        channel,
        length,
        control,
    }
}

/// A decoded frame with channel routing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// The channel this frame belongs to.
    pub channel: u8,
    /// Optional control byte.
    pub control: Option<u8>,
    /// The frame payload, padding stripped.
    pub payload: Bytes,
}

impl Frame {
    /// Create a frame without a control byte.
    pub fn new(channel: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            channel,
            control: None,
            payload: payload.into(),
        }
    }

    /// Create a frame carrying a control byte.
    pub fn with_control(channel: u8, control: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            channel,
            control: Some(control),
            payload: payload.into(),
        }
    }

    /// True when more frames of the same message follow.
    pub fn more(&self) -> bool {
        self.control.is_some_and(|c| c & CONTROL_MORE != 0)
    }

    /// Frame id from the control byte.
    pub fn frame_id(&self) -> Option<u8> {
        self.control.map(|c| c & CONTROL_ID_MASK)
    }

    /// The total wire size of this frame.
    pub fn wire_size(&self, align: bool) -> usize {
        encoded_len(self.control, self.payload.len(), align)
    }
}

/// Encode one frame into the wire format, returning the bytes written.
///
/// Wire format:
/// ```text
/// ┌────────┬─────────┬──────────────┬──────────┬──────────┬─────────┐
/// │ Config │ Channel │ Length       │ Control  │ Payload  │ Padding │
/// │ (1B)   │ (1B)    │ (2B/4B LE)   │ (0/1B)   │          │ (0..3B) │
/// └────────┴─────────┴──────────────┴──────────┴──────────┴─────────┘
/// ```
///
/// The 32-bit length is only selected when the frame does not fit a 16-bit one.
pub fn encode_frame(
    channel: u8,
    control: Option<u8>,
    payload: &[u8],
    align: bool,
    dst: &mut BytesMut,
) -> Result<usize> {
    let config = select_config(control, payload.len(), align);
    let frame_len = header_len(config) + payload.len();
    if frame_len > u32::MAX as usize {
        return Err(FrameError::FrameTooLarge {
            size: frame_len,
            max: u32::MAX as usize,
        });
    }
    let pad = if align { padding_len(frame_len) } else { 0 };

    dst.reserve(frame_len + pad);
    dst.put_u8(config);
    dst.put_u8(channel);
    if config & CONFIG_EXT_LENGTH != 0 {
        dst.put_u32_le(frame_len as u32);
    } else {
        dst.put_u16_le(frame_len as u16);
    }
    if let Some(control) = control {
        dst.put_u8(control);
    }
    dst.put_slice(payload);
    dst.put_bytes(0, pad);
    Ok(frame_len + pad)
}

/// Where the decoder is inside the current frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeState {
    /// Waiting for a start byte and the rest of the header.
    AwaitingHeader,
    /// Header parsed; waiting for payload and padding.
    AwaitingPayload(FrameMeta),
}

/// Resumable SIPC5 decoder.
///
/// Bytes are consumed from the caller's buffer only once a header or a whole
/// payload is available, so the same buffer can be topped up and passed again
/// after `Ok(None)`.
#[derive(Debug, Clone)]
pub struct FrameDecoder {
    state: DecodeState,
    max_frame_size: usize,
}

impl FrameDecoder {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            state: DecodeState::AwaitingHeader,
            max_frame_size,
        }
    }

    pub fn state(&self) -> DecodeState {
        self.state
    }

    /// Drop any partially parsed frame.
    pub fn reset(&mut self) {
        self.state = DecodeState::AwaitingHeader;
    }

    /// Decode the next frame from `src`.
    ///
    /// Returns `Ok(None)` when more bytes are needed. On a framing error the
    /// first byte of the bad header has been dropped, so calling again makes
    /// progress towards the next start byte.
    pub fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        loop {
            match self.state {
                DecodeState::AwaitingHeader => {
                    let Some(&config) = src.first() else {
                        return Ok(None);
                    };
                    if config & CONFIG_START == 0 || config & CONFIG_RESERVED != 0 {
                        src.advance(1);
                        return Err(FrameError::BadFraming { byte: config });
                    }
                    let hdr_len = header_len(config);
                    if src.len() < hdr_len {
                        return Ok(None);
                    }
                    let meta = parse_header(&src[..hdr_len]);
                    if meta.length < hdr_len {
                        src.advance(1);
                        return Err(FrameError::LengthUnderflow {
                            length: meta.length,
                            header_len: hdr_len,
                        });
                    }
                    if meta.length > self.max_frame_size {
                        src.advance(1);
                        return Err(FrameError::FrameTooLarge {
                            size: meta.length,
                            max: self.max_frame_size,
                        });
                    }
                    src.advance(hdr_len);
                    self.state = DecodeState::AwaitingPayload(meta);
                }
                DecodeState::AwaitingPayload(meta) => {
                    let needed = meta.data_len() + meta.pad_len();
                    if src.len() < needed {
                        src.reserve(needed - src.len());
                        return Ok(None);
                    }
                    let payload = src.split_to(meta.data_len()).freeze();
                    src.advance(meta.pad_len());
                    self.state = DecodeState::AwaitingHeader;
                    return Ok(Some(Frame {
                        channel: meta.channel,
                        control: meta.control,
                        payload,
                    }));
                }
            }
        }
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

/// Configuration for the frame codec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameConfig {
    /// Transport MTU: largest frame (header + payload) accepted or produced.
    pub max_frame_size: usize,
    /// Pad every frame to a 4-byte boundary.
    pub align: bool,
    /// Largest reassembled multi-frame message.
    pub max_message_size: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            align: true,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(channel: u8, control: Option<u8>, payload: &[u8], align: bool) -> BytesMut {
        let mut buf = BytesMut::new();
        encode_frame(channel, control, payload, align, &mut buf).unwrap();
        buf
    }

    #[test]
    fn encode_decode_roundtrip() {
        let mut buf = encode(10, None, b"hello, modem!", false);
        assert_eq!(buf.len(), MIN_HEADER_SIZE + 13);

        let frame = FrameDecoder::default().decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.channel, 10);
        assert_eq!(frame.control, None);
        assert_eq!(frame.payload.as_ref(), b"hello, modem!");
        assert!(buf.is_empty());
    }

    #[test]
    fn header_lengths_follow_flags() {
        assert_eq!(header_len(CONFIG_START), 4);
        assert_eq!(header_len(CONFIG_START | CONFIG_CONTROL), 5);
        assert_eq!(header_len(CONFIG_START | CONFIG_EXT_LENGTH), 6);
        assert_eq!(
            header_len(CONFIG_START | CONFIG_EXT_LENGTH | CONFIG_CONTROL),
            7
        );
    }

    #[test]
    fn wire_layout_with_control_and_padding() {
        let buf = encode(235, Some(0x05), b"abc", true);
        // 5-byte header + 3 bytes payload = 8, already aligned.
        assert_eq!(
            buf.as_ref(),
            &[
                CONFIG_START | CONFIG_CONTROL | CONFIG_PADDING,
                235,
                8,
                0,
                0x05,
                b'a',
                b'b',
                b'c'
            ]
        );

        let buf = encode(1, None, b"x", true);
        // 4 + 1 = 5, padded to 8.
        assert_eq!(buf.len(), 8);
        assert_eq!(&buf[2..4], &5u16.to_le_bytes());
        assert_eq!(&buf[5..], &[0, 0, 0]);
    }

    #[test]
    fn padding_is_skipped_never_delivered() {
        let mut buf = encode(3, None, b"hello", true);
        encode_frame(4, None, b"next", true, &mut buf).unwrap();

        let mut decoder = FrameDecoder::default();
        let first = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.payload.as_ref(), b"hello");
        let second = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(second.channel, 4);
        assert_eq!(second.payload.as_ref(), b"next");
        assert!(buf.is_empty());
    }

    #[test]
    fn extended_length_selected_only_when_needed() {
        let small = vec![0u8; u16::MAX as usize - MIN_HEADER_SIZE];
        let buf = encode(2, None, &small, false);
        assert_eq!(buf[0] & CONFIG_EXT_LENGTH, 0);

        let big = vec![0xA5u8; u16::MAX as usize];
        let mut buf = encode(2, Some(1), &big, false);
        assert_ne!(buf[0] & CONFIG_EXT_LENGTH, 0);
        assert_eq!(
            u32::from_le_bytes([buf[2], buf[3], buf[4], buf[5]]) as usize,
            big.len() + 7
        );

        let frame = FrameDecoder::new(usize::MAX)
            .decode(&mut buf)
            .unwrap()
            .unwrap();
        assert_eq!(frame.control, Some(1));
        assert_eq!(frame.payload.len(), big.len());
    }

    #[test]
    fn every_split_point_yields_identical_frame() {
        let wire = encode(235, Some(CONTROL_MORE | 9), b"fragmented payload!", true);
        let expected = FrameDecoder::default()
            .decode(&mut wire.clone())
            .unwrap()
            .unwrap();

        for split in 0..=wire.len() {
            let mut decoder = FrameDecoder::default();
            let mut buf = BytesMut::from(&wire[..split]);
            let early = decoder.decode(&mut buf).unwrap();
            if split < wire.len() {
                assert!(early.is_none(), "split {split} produced a frame early");
                buf.extend_from_slice(&wire[split..]);
                let frame = decoder.decode(&mut buf).unwrap().unwrap();
                assert_eq!(frame, expected, "split {split}");
            } else {
                assert_eq!(early.unwrap(), expected);
            }
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn byte_by_byte_feed() {
        let wire = encode(20, None, b"trickle", true);
        let mut decoder = FrameDecoder::default();
        let mut buf = BytesMut::new();
        let mut out = None;
        for &b in wire.iter() {
            buf.put_u8(b);
            if let Some(frame) = decoder.decode(&mut buf).unwrap() {
                out = Some(frame);
            }
        }
        assert_eq!(out.unwrap().payload.as_ref(), b"trickle");
        assert_eq!(decoder.state(), DecodeState::AwaitingHeader);
    }

    #[test]
    fn bad_start_byte_is_dropped_then_resyncs() {
        let mut buf = BytesMut::from(&[0x00u8, 0x7F][..]);
        encode_frame(5, None, b"ok", false, &mut buf).unwrap();

        let mut decoder = FrameDecoder::default();
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(FrameError::BadFraming { byte: 0x00 })
        ));
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(FrameError::BadFraming { byte: 0x7F })
        ));
        let frame = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.payload.as_ref(), b"ok");
    }

    #[test]
    fn length_shorter_than_header_rejected() {
        let mut buf = BytesMut::from(&[CONFIG_START, 1, 2, 0][..]);
        let err = FrameDecoder::default().decode(&mut buf).unwrap_err();
        assert!(matches!(
            err,
            FrameError::LengthUnderflow {
                length: 2,
                header_len: 4
            }
        ));
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn frame_above_mtu_rejected() {
        let mut buf = encode(1, None, &[0u8; 64], false);
        let err = FrameDecoder::new(32).decode(&mut buf).unwrap_err();
        assert!(matches!(err, FrameError::FrameTooLarge { size: 68, max: 32 }));
    }

    #[test]
    fn encoded_len_matches_encoder() {
        for len in [0usize, 1, 3, 4, 5, 100, 65_531, 65_532] {
            for control in [None, Some(3)] {
                for align in [false, true] {
                    let buf = encode(7, control, &vec![0u8; len], align);
                    assert_eq!(buf.len(), encoded_len(control, len, align));
                }
            }
        }
    }

    #[test]
    fn frame_accessors() {
        let frame = Frame::with_control(FMT, CONTROL_MORE | 0x11, Bytes::from_static(b"ab"));
        assert!(frame.more());
        assert_eq!(frame.frame_id(), Some(0x11));
        assert_eq!(frame.wire_size(false), 7);
        assert!(!Frame::new(1, "x").more());
    }

    const FMT: u8 = crate::channel::FMT_0;
}
