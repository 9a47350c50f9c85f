//! Engine configuration.
//!
//! Configuration is stored as JSON. Every field is optional; missing fields
//! take the documented default. Durations are written in milliseconds.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

const MIB: usize = 1024 * 1024;

/// Errors raised while loading a configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Tunables for the transfer engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Maximum in-flight remote block operations per transfer.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Maximum transfers running at once through one client.
    #[serde(default = "default_max_concurrent_transfers")]
    pub max_concurrent_transfers: usize,

    /// Objects up to this many bytes move in a single request.
    #[serde(default = "default_single_shot_threshold")]
    pub single_shot_threshold: u64,

    #[serde(default = "default_download_block_size")]
    pub download_block_size: usize,

    #[serde(default = "default_upload_initial_block_size")]
    pub upload_initial_block_size: usize,

    #[serde(default = "default_upload_block_step")]
    pub upload_block_step: usize,

    #[serde(default = "default_upload_max_block_size")]
    pub upload_max_block_size: usize,

    #[serde(default = "default_max_download_blocks")]
    pub max_download_blocks: u64,

    #[serde(default = "default_max_upload_blocks")]
    pub max_upload_blocks: u64,

    /// Authorization failures tolerated per transfer before giving up.
    #[serde(default = "default_max_auth_retries")]
    pub max_auth_retries: u32,

    #[serde(default = "default_auth_retry_backoff", with = "duration_ms")]
    pub auth_retry_backoff: Duration,

    /// How long a freshly issued signature may keep answering 403.
    #[serde(default = "default_activation_deadline", with = "duration_ms")]
    pub activation_deadline: Duration,

    /// Pause when the buffer pool has no free buffer and nothing is in flight.
    #[serde(default = "default_backpressure_backoff", with = "duration_ms")]
    pub backpressure_backoff: Duration,

    /// Memory budget shared by all buffers of one block size.
    #[serde(default = "default_pool_budget_bytes")]
    pub pool_budget_bytes: u64,

    #[serde(default = "default_pool_max_cells")]
    pub pool_max_cells: usize,

    /// Drop idle pooled buffers after each chunked transfer.
    #[serde(default = "default_trim_pool_after_transfer")]
    pub trim_pool_after_transfer: bool,

    /// Connection limit handed to the connection tuner per endpoint.
    #[serde(default = "default_connections_per_endpoint")]
    pub connections_per_endpoint: usize,
}

fn default_concurrency() -> usize {
    std::thread::available_parallelism().map_or(1, |n| n.get()) * 8
}

fn default_max_concurrent_transfers() -> usize {
    2
}

fn default_single_shot_threshold() -> u64 {
    32 * MIB as u64
}

fn default_download_block_size() -> usize {
    4 * MIB
}

fn default_upload_initial_block_size() -> usize {
    MIB
}

fn default_upload_block_step() -> usize {
    MIB
}

fn default_upload_max_block_size() -> usize {
    4 * MIB
}

fn default_max_download_blocks() -> u64 {
    50_000
}

fn default_max_upload_blocks() -> u64 {
    49_999
}

fn default_max_auth_retries() -> u32 {
    30
}

fn default_auth_retry_backoff() -> Duration {
    Duration::from_secs(1)
}

fn default_activation_deadline() -> Duration {
    Duration::from_secs(35)
}

fn default_backpressure_backoff() -> Duration {
    Duration::from_millis(10)
}

fn default_pool_budget_bytes() -> u64 {
    if cfg!(target_pointer_width = "64") {
        16 * 1024 * MIB as u64
    } else {
        1024 * MIB as u64
    }
}

fn default_pool_max_cells() -> usize {
    8192
}

fn default_trim_pool_after_transfer() -> bool {
    true
}

fn default_connections_per_endpoint() -> usize {
    default_concurrency()
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            max_concurrent_transfers: default_max_concurrent_transfers(),
            single_shot_threshold: default_single_shot_threshold(),
            download_block_size: default_download_block_size(),
            upload_initial_block_size: default_upload_initial_block_size(),
            upload_block_step: default_upload_block_step(),
            upload_max_block_size: default_upload_max_block_size(),
            max_download_blocks: default_max_download_blocks(),
            max_upload_blocks: default_max_upload_blocks(),
            max_auth_retries: default_max_auth_retries(),
            auth_retry_backoff: default_auth_retry_backoff(),
            activation_deadline: default_activation_deadline(),
            backpressure_backoff: default_backpressure_backoff(),
            pool_budget_bytes: default_pool_budget_bytes(),
            pool_max_cells: default_pool_max_cells(),
            trim_pool_after_transfer: default_trim_pool_after_transfer(),
            connections_per_endpoint: default_connections_per_endpoint(),
        }
    }
}

impl TransferConfig {
    /// Loads configuration from a JSON file, or the defaults if it does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::warn!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: TransferConfig = serde_json::from_str(&content)?;
        config.validate()?;
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Saves the configuration as pretty-printed JSON.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    /// Rejects values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("concurrency", self.concurrency),
            ("max_concurrent_transfers", self.max_concurrent_transfers),
            ("download_block_size", self.download_block_size),
            ("upload_initial_block_size", self.upload_initial_block_size),
            ("upload_block_step", self.upload_block_step),
            ("pool_max_cells", self.pool_max_cells),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be positive")));
            }
        }
        if self.upload_max_block_size < self.upload_initial_block_size {
            return Err(ConfigError::Invalid(
                "upload_max_block_size is below upload_initial_block_size".into(),
            ));
        }
        if u32::try_from(self.download_block_size).is_err()
            || u32::try_from(self.upload_max_block_size).is_err()
        {
            return Err(ConfigError::Invalid("block sizes must fit in 32 bits".into()));
        }
        Ok(())
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
