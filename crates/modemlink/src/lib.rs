//! Link layer between an application processor and a cellular modem.
//!
//! # Crate Structure
//!
//! - [`frame`]: SIPC5 framing, resumable decoding and reassembly
//! - [`transport`]: shared-memory ring queues, mailbox flow control and
//!   the MIPI-HSI connection protocol
//! - [`link`]: the link device facade and communication state machine
//!   (behind the `link` feature)

/// Re-export frame types.
pub mod frame {
    pub use modemlink_frame::*;
}

/// Re-export transport types.
pub mod transport {
    pub use modemlink_transport::*;
}

/// Re-export link device types (requires `link` feature).
#[cfg(feature = "link")]
pub mod link {
    pub use modemlink_link::*;
}
