//! SIPC5 link-layer framing for the modem IPC link.
//!
//! Every frame multiplexed over a shared-memory queue or a serial link is:
//! - A config byte (start bit, control/extended-length/padding flags)
//! - A channel id byte
//! - A little-endian length (16-bit, or 32-bit when extended)
//! - An optional control byte (multi-frame continuation + frame id)
//! - The payload, optionally padded to a 4-byte boundary
//!
//! The decoder is resumable, so streaming transports can feed it bytes in
//! any split.

pub mod channel;
pub mod codec;
pub mod deframer;
pub mod error;
pub mod reader;
pub mod reassembly;
pub mod writer;

#[cfg(feature = "async")]
pub mod async_codec;

pub use channel::{
    channel_name, is_boot, is_fmt, ChannelClass, BOOT_0, DUMP_0, FMT_0, FMT_1, LOOPBACK, PDP_0,
    PDP_14, RFS_0, RFS_1,
};
pub use codec::{
    encode_frame, encoded_len, DecodeState, Frame, FrameConfig, FrameDecoder, FrameMeta,
    DEFAULT_MAX_FRAME_SIZE, DEFAULT_MAX_MESSAGE_SIZE,
};
pub use deframer::Deframer;
pub use error::{FrameError, Result};
pub use reader::FrameReader;
pub use reassembly::{Fragmenter, Reassembler};
pub use writer::FrameWriter;

#[cfg(feature = "async")]
pub use async_codec::Sipc5Codec;
