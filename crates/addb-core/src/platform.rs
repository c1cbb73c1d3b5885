//! Hosting environment capabilities

use addb_common::config::NodeConfig;
use uuid::Uuid;

/// Capabilities of the process hosting ADDB, resolved once at startup
pub trait Platform: Send + Sync {
    /// UUID of this node
    fn node_uuid(&self) -> Uuid;

    /// Identifier of this process
    fn process_id(&self) -> u64;

    /// Whether the current execution context may block. Posting through a
    /// machine that cannot post in restricted contexts is skipped when this
    /// is false.
    fn can_block(&self) -> bool {
        true
    }

    /// Wall-clock time in nanoseconds since the Unix epoch
    fn now(&self) -> u64;
}

/// Regular user-space process
#[derive(Clone, Debug)]
pub struct DefaultPlatform {
    node_uuid: Uuid,
}

impl DefaultPlatform {
    /// Use the configured node UUID, or a random one
    #[must_use]
    pub fn new(config: &NodeConfig) -> Self {
        Self {
            node_uuid: config.node_uuid.unwrap_or_else(Uuid::new_v4),
        }
    }
}

impl Default for DefaultPlatform {
    fn default() -> Self {
        Self::new(&NodeConfig::default())
    }
}

impl Platform for DefaultPlatform {
    fn node_uuid(&self) -> Uuid {
        self.node_uuid
    }

    fn process_id(&self) -> u64 {
        u64::from(std::process::id())
    }

    fn now(&self) -> u64 {
        chrono::Utc::now()
            .timestamp_nanos_opt()
            .and_then(|ns| u64::try_from(ns).ok())
            .unwrap_or_default()
    }
}
