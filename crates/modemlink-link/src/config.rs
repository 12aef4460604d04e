use std::path::Path;
use std::time::Duration;

use modemlink_frame::codec::{ALIGNMENT, MAX_HEADER_SIZE};
use modemlink_frame::FrameConfig;
use modemlink_transport::{HsiConfig, ShmemConfig, TransportKind};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Everything needed to bring up a link device.
///
/// Every field has a default, so a JSON document only needs to name what
/// it overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub transport: TransportKind,
    pub frame: FrameConfig,
    pub shmem: ShmemConfig,
    pub hsi: HsiConfig,
    /// Capacity of the interrupt → worker queue.
    pub work_queue_depth: usize,
    /// How often an idle worker polls the transport for interrupts.
    pub poll_interval_ms: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::Shmem,
            frame: FrameConfig::default(),
            shmem: ShmemConfig::default(),
            hsi: HsiConfig::default(),
            work_queue_depth: 64,
            poll_interval_ms: 5,
        }
    }
}

impl LinkConfig {
    /// Defaults for a legacy DPRAM window.
    pub fn dpram() -> Self {
        Self {
            transport: TransportKind::Dpram,
            shmem: ShmemConfig::dpram(),
            ..Self::default()
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    /// Reject settings no link could run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let min_frame = MAX_HEADER_SIZE + ALIGNMENT;
        if self.frame.max_frame_size < min_frame {
            return Err(ConfigError::Invalid(format!(
                "frame.max_frame_size must be at least {min_frame}"
            )));
        }
        if self.frame.max_message_size == 0 {
            return Err(ConfigError::Invalid(
                "frame.max_message_size must be non-zero".to_string(),
            ));
        }
        if self.work_queue_depth == 0 {
            return Err(ConfigError::Invalid(
                "work_queue_depth must be non-zero".to_string(),
            ));
        }
        let queues = [self.shmem.fmt, self.shmem.raw];
        if queues.iter().any(|q| q.tx < 2 || q.rx < 2) {
            return Err(ConfigError::Invalid(
                "shmem queues need at least two bytes".to_string(),
            ));
        }
        Ok(())
    }

    /// Bytes a shared-memory window must provide for this configuration.
    pub fn region_size(&self) -> usize {
        self.shmem.layout().size()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}
