//! Snapshot store configuration.

use snapstore_core::SnapshotError;
use snapstore_durability::DEFAULT_BLOCK_SIZE;

/// Snapshot store configuration parameters.
#[derive(Debug, Clone)]
pub struct SnapshotStoreConfig {
    /// Largest chunk handed out by chunk readers (default: whole file).
    ///
    /// Files larger than this are split into several chunks.
    pub max_chunk_size: Option<u64>,

    /// Read buffer size used when checksumming files (default: 64KB).
    pub checksum_block_size: usize,

    /// Ordinal of the node creating snapshots (default: 0).
    ///
    /// Stamped into the ids of transient snapshots taken on this node.
    pub node_ordinal: u32,

    /// Name of the store's actor thread, prefixed with `snapstore-`.
    pub actor_name: String,
}

impl Default for SnapshotStoreConfig {
    fn default() -> Self {
        SnapshotStoreConfig {
            max_chunk_size: None,
            checksum_block_size: DEFAULT_BLOCK_SIZE,
            node_ordinal: 0,
            actor_name: "store".to_string(),
        }
    }
}

impl SnapshotStoreConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum chunk size (builder pattern).
    pub fn with_max_chunk_size(mut self, size: u64) -> Self {
        self.max_chunk_size = Some(size);
        self
    }

    /// Set the checksum read buffer size (builder pattern).
    pub fn with_checksum_block_size(mut self, size: usize) -> Self {
        self.checksum_block_size = size;
        self
    }

    /// Set the node ordinal (builder pattern).
    pub fn with_node_ordinal(mut self, ordinal: u32) -> Self {
        self.node_ordinal = ordinal;
        self
    }

    /// Set the actor thread name (builder pattern).
    pub fn with_actor_name(mut self, name: impl Into<String>) -> Self {
        self.actor_name = name.into();
        self
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_chunk_size == Some(0) {
            return Err(ConfigError::ZeroChunkSize);
        }
        if self.checksum_block_size == 0 {
            return Err(ConfigError::ZeroBlockSize);
        }
        if self.actor_name.is_empty() {
            return Err(ConfigError::EmptyActorName);
        }
        Ok(())
    }

    /// Create a configuration for tests (tiny chunks and read buffers).
    pub fn for_testing() -> Self {
        SnapshotStoreConfig {
            max_chunk_size: Some(64),
            checksum_block_size: 16,
            node_ordinal: 0,
            actor_name: "test-store".to_string(),
        }
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A maximum chunk size of zero can never make progress.
    #[error("Maximum chunk size must be greater than zero")]
    ZeroChunkSize,

    /// Checksum block size is zero.
    #[error("Checksum block size must be greater than zero")]
    ZeroBlockSize,

    /// Actor name is empty.
    #[error("Actor name must not be empty")]
    EmptyActorName,
}

impl From<ConfigError> for SnapshotError {
    fn from(e: ConfigError) -> Self {
        SnapshotError::illegal_state(format!("invalid store configuration: {}", e))
    }
}
