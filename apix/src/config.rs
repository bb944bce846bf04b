//! Bus tuning knobs and their JSON persistence.

use std::path::Path;
use std::time::Duration;
use std::{fs, io};

use serde::{Deserialize, Serialize};

/// Engine timing and capacity settings.
///
/// Every field has a default, so a config file only needs the keys it
/// changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct BusConfig {
    /// How long a dispatched request waits for its response.
    pub request_timeout_ms: u64,
    /// How long a service may stay silent before it is dropped.
    pub service_alive_timeout_ms: u64,
    /// How long a partial frame may sit unchanged before it is discarded.
    pub parse_grace_ms: u64,
    /// Subscriber bound per topic.
    pub max_subscribers: usize,
    /// Upper bound of the adaptive idle sleep. When unset, the poll
    /// timeout is spent waiting on the sinks instead.
    pub idle_backoff_ms: Option<u64>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 3000,
            service_alive_timeout_ms: 60_000,
            parse_grace_ms: 1000,
            max_subscribers: 32,
            idle_backoff_ms: None,
        }
    }
}

impl BusConfig {
    /// Loads settings from a JSON file.
    pub fn load(path: &Path) -> io::Result<Self> {
        let data = fs::read_to_string(path)?;
        serde_json::from_str(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Writes settings to a JSON file.
    pub fn save(&self, path: &Path) -> io::Result<()> {
        let file = fs::File::create(path)?;
        serde_json::to_writer_pretty(file, self).map_err(io::Error::other)
    }

    /// Pending request deadline.
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Service liveness deadline.
    pub const fn service_alive_timeout(&self) -> Duration {
        Duration::from_millis(self.service_alive_timeout_ms)
    }

    /// Partial-frame grace period.
    pub const fn parse_grace(&self) -> Duration {
        Duration::from_millis(self.parse_grace_ms)
    }

    /// Maximum adaptive idle sleep, if enabled.
    pub fn idle_backoff(&self) -> Option<Duration> {
        self.idle_backoff_ms.map(Duration::from_millis)
    }
}
