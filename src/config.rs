//! Connection and sync configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::ble::uuids::CATALOG_SERVICE_UUID;

/// Settle window between link establishment and the first catalog read.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(1);
/// Fixed delay before reconnecting after the link drops.
pub const DEFAULT_RECONNECT_BACKOFF: Duration = Duration::from_secs(5);
/// How long discovery waits for an advertising device.
pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);
/// Upper bound on a single characteristic read or write.
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(5);

/// What `add_product` does when the barcode already exists locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DuplicatePolicy {
    /// Write the command and append a second entry.
    #[default]
    Admit,
    /// Fail with `DuplicateBarcode` before writing anything.
    Reject,
}

/// Configuration shared by the connector and the sync engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Service the device must advertise and expose.
    pub service_uuid: Uuid,
    /// Delay after connect before the catalog is fetched.
    pub settle_delay: Duration,
    /// Delay before an automatic reconnect.
    pub reconnect_backoff: Duration,
    /// Discovery scan window.
    pub discovery_timeout: Duration,
    /// Per read/write timeout.
    pub io_timeout: Duration,
    /// Duplicate barcode handling for adds.
    pub duplicate_policy: DuplicatePolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            service_uuid: CATALOG_SERVICE_UUID,
            settle_delay: DEFAULT_SETTLE_DELAY,
            reconnect_backoff: DEFAULT_RECONNECT_BACKOFF,
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
            io_timeout: DEFAULT_IO_TIMEOUT,
            duplicate_policy: DuplicatePolicy::default(),
        }
    }
}

impl SyncConfig {
    /// Use a different service UUID (one per deployment).
    pub fn with_service_uuid(mut self, uuid: Uuid) -> Self {
        self.service_uuid = uuid;
        self
    }

    /// Set the post-connect settle delay.
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Set the reconnect backoff.
    pub fn with_reconnect_backoff(mut self, delay: Duration) -> Self {
        self.reconnect_backoff = delay;
        self
    }

    /// Set the discovery timeout.
    pub fn with_discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }

    /// Set the read/write timeout.
    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    /// Set the duplicate barcode policy.
    pub fn with_duplicate_policy(mut self, policy: DuplicatePolicy) -> Self {
        self.duplicate_policy = policy;
        self
    }
}
