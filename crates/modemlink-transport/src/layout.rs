//! Placement of the control words, queues and mailboxes inside the region.
//!
//! ```text
//! magic u32 | access u32 |
//! FMT: tx head u32, tx tail u32, rx head u32, rx tail u32, tx buf, rx buf |
//! RAW: (same) |
//! mbx_ap2cp u16 | mbx_cp2ap u16
//! ```
//!
//! "TX" is always the AP→CP direction, regardless of which side reads the
//! layout.

use modemlink_frame::ChannelClass;
use serde::{Deserialize, Serialize};

use crate::mailbox;

/// Logical device queues carried by the shared-memory transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Queue {
    /// Formatted (control) messages.
    Fmt,
    /// Raw data: packet data, voice, boot and dump traffic.
    Raw,
}

pub const QUEUE_COUNT: usize = 2;

impl Queue {
    pub const ALL: [Queue; QUEUE_COUNT] = [Queue::Fmt, Queue::Raw];

    pub fn index(self) -> usize {
        match self {
            Queue::Fmt => 0,
            Queue::Raw => 1,
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            Queue::Fmt => "fmt",
            Queue::Raw => "raw",
        }
    }

    /// Queue carrying frames for a SIPC5 channel id.
    pub fn for_channel(channel: u8) -> Self {
        match ChannelClass::of(channel) {
            ChannelClass::Fmt => Queue::Fmt,
            _ => Queue::Raw,
        }
    }

    pub fn masks(self) -> QueueMasks {
        match self {
            Queue::Fmt => QueueMasks {
                req_ack: mailbox::INT_MASK_REQ_ACK_F,
                res_ack: mailbox::INT_MASK_RES_ACK_F,
                send: mailbox::INT_MASK_SEND_F,
            },
            Queue::Raw => QueueMasks {
                req_ack: mailbox::INT_MASK_REQ_ACK_R,
                res_ack: mailbox::INT_MASK_RES_ACK_R,
                send: mailbox::INT_MASK_SEND_R,
            },
        }
    }
}

/// Mailbox data bits owned by one queue pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueMasks {
    pub req_ack: u16,
    pub res_ack: u16,
    pub send: u16,
}

/// Offsets of one ring inside the region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueDesc {
    pub head: usize,
    pub tail: usize,
    pub buf: usize,
    pub size: u32,
}

/// TX (AP→CP) and RX (CP→AP) rings of one logical device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelQueuePair {
    pub queue: Queue,
    pub tx: QueueDesc,
    pub rx: QueueDesc,
    pub masks: QueueMasks,
}

/// Ring capacities for one queue pair, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSizes {
    pub tx: u32,
    pub rx: u32,
}

impl QueueSizes {
    pub const fn new(tx: u32, rx: u32) -> Self {
        Self { tx, rx }
    }
}

pub const MAGIC_OFFSET: usize = 0;
pub const ACCESS_OFFSET: usize = 4;
const POINTERS_PER_PAIR: usize = 16;

/// Fully resolved offsets for a shared-memory window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionLayout {
    pub magic: usize,
    pub access: usize,
    pub pairs: [ChannelQueuePair; QUEUE_COUNT],
    pub mbx_ap2cp: usize,
    pub mbx_cp2ap: usize,
    size: usize,
}

/// SIPC5 shared-memory sizes: small formatted rings, large raw rings.
pub const SHMEM_FMT: QueueSizes = QueueSizes::new(4 * 1024, 4 * 1024);
pub const SHMEM_RAW: QueueSizes = QueueSizes::new(2 * 1024 * 1024, 2 * 1024 * 1024);

/// Legacy 16 KiB DPRAM sizes.
pub const DPRAM_FMT: QueueSizes = QueueSizes::new(2044, 2044);
pub const DPRAM_RAW: QueueSizes = QueueSizes::new(6120, 6120);

impl RegionLayout {
    /// Lay out a region for the given FMT and RAW ring sizes.
    ///
    /// Each ring needs at least two bytes (one slot is always kept empty).
    pub fn new(fmt: QueueSizes, raw: QueueSizes) -> Self {
        let mut cursor = ACCESS_OFFSET + 4;
        let mut pair = |queue: Queue, sizes: QueueSizes| {
            let pointers = cursor;
            cursor += POINTERS_PER_PAIR;
            let tx_buf = cursor;
            cursor = align4(cursor + sizes.tx as usize);
            let rx_buf = cursor;
            cursor = align4(cursor + sizes.rx as usize);
            ChannelQueuePair {
                queue,
                tx: QueueDesc {
                    head: pointers,
                    tail: pointers + 4,
                    buf: tx_buf,
                    size: sizes.tx,
                },
                rx: QueueDesc {
                    head: pointers + 8,
                    tail: pointers + 12,
                    buf: rx_buf,
                    size: sizes.rx,
                },
                masks: queue.masks(),
            }
        };
        let fmt = pair(Queue::Fmt, fmt);
        let raw = pair(Queue::Raw, raw);
        let mbx_ap2cp = cursor;
        let mbx_cp2ap = cursor + 2;

        Self {
            magic: MAGIC_OFFSET,
            access: ACCESS_OFFSET,
            pairs: [fmt, raw],
            mbx_ap2cp,
            mbx_cp2ap,
            size: cursor + 4,
        }
    }

    pub fn shmem() -> Self {
        Self::new(SHMEM_FMT, SHMEM_RAW)
    }

    pub fn dpram() -> Self {
        Self::new(DPRAM_FMT, DPRAM_RAW)
    }

    /// Bytes the region must provide.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn pair(&self, queue: Queue) -> &ChannelQueuePair {
        &self.pairs[queue.index()]
    }
}

fn align4(offset: usize) -> usize {
    (offset + 3) & !3
}
