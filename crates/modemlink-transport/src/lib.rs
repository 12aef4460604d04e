//! Physical transports for the modem IPC link.
//!
//! - [`ShmemTransport`]: per-device circular queues in a shared memory
//!   window, a magic/access handshake, and mailbox flow control
//! - [`HsiLink`]: the MIPI-HSI open/ack/close command protocol
//!
//! Both implement [`LinkTransport`], which the link device drives.

pub mod error;
pub mod hsi;
pub mod layout;
pub mod mailbox;
pub mod region;
pub mod ring;
pub mod shmem;
pub mod stats;
pub mod traits;

pub use error::{Result, TransportError};
pub use hsi::{HsiConfig, HsiLink, HsiPort, RecvStep, SendStep, WakeGuard, WakeLine};
pub use layout::{ChannelQueuePair, Queue, QueueDesc, QueueMasks, QueueSizes, RegionLayout};
pub use mailbox::{Command, IntWord};
pub use region::{HeapRegion, SharedMemory};
pub use ring::RingBuffer;
pub use shmem::{Role, ShmemConfig, ShmemTransport, ACCESS_ENABLE, IPC_MAGIC};
pub use stats::{LinkStats, StatsSnapshot};
pub use traits::{LinkTransport, Notifier, TransportKind, Work};

#[cfg(unix)]
pub use region::MappedRegion;
