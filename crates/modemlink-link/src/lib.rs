//! Link device facade for the modem IPC link.
//!
//! A [`LinkDevice`] owns one transport, routes inbound messages to the
//! handler registered for their channel, and tracks the communication
//! state so traffic is only carried once the modem is up.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use modemlink_link::{LinkConfig, LinkDevice};
//! use modemlink_transport::HeapRegion;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = LinkConfig::default();
//! let region = Arc::new(HeapRegion::new(config.region_size()));
//! let device = LinkDevice::shmem(region, config)?;
//! device.register_channel(modemlink_frame::FMT_0, |msg| println!("{} bytes", msg.len()));
//! device.init_comm()?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod device;
pub mod error;
pub mod loopback;
pub mod state;

pub use config::LinkConfig;
pub use device::{DeviceStats, LinkDevice};
pub use error::{ConfigError, LinkError, Result};
pub use loopback::EchoPeer;
pub use state::CommState;
