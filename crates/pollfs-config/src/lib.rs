//! Configuration management for pollfs
//!
//! Settings are layered from three sources, later ones winning:
//!
//! - **Defaults**: every field has a sensible default
//! - **Files**: YAML, TOML or JSON, chosen by extension
//! - **Environment**: `POLLFS__<SECTION>__<KEY>` variables
//!
//! # Examples
//!
//! ```rust,no_run
//! use pollfs_config::ConfigBuilder;
//!
//! let config = ConfigBuilder::new()
//!     .add_defaults()
//!     .add_source_file("pollfs.yaml")
//!     .add_env_prefix("POLLFS")
//!     .build()
//!     .expect("Failed to load configuration");
//!
//! println!("Default mode: {}", config.io.default_mode);
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

use pollfs_types::{Alignment, FileMode, PollInterval, QueueDepth};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub mod builder;
pub mod error;
pub mod loader;

pub use builder::ConfigBuilder;
pub use error::{ConfigError, ConfigResult};
pub use loader::ConfigLoader;

/// Log levels accepted by [`LoggingConfig::level`]
pub const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for pollfs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Engine tunables
    pub io: IoConfig,
    /// Adaptive mode selection thresholds
    pub selection: SelectionConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Change watcher configuration
    pub watch: WatchConfig,
}

impl Config {
    /// Check cross-field constraints the field types cannot express
    pub fn validate(&self) -> ConfigResult<()> {
        if self.io.pool_block_size == 0 {
            return Err(ConfigError::invalid_value(
                "io.pool_block_size",
                "must be greater than 0",
            ));
        }

        if self.io.pool_block_size % self.io.direct_alignment.get() != 0 {
            return Err(ConfigError::invalid_value(
                "io.pool_block_size",
                format!(
                    "must be a multiple of the direct alignment ({})",
                    self.io.direct_alignment.get()
                ),
            ));
        }

        if self.selection.small_io_threshold == 0 {
            return Err(ConfigError::invalid_value(
                "selection.small_io_threshold",
                "must be greater than 0",
            ));
        }

        if !LOG_LEVELS.contains(&self.logging.level.to_ascii_lowercase().as_str()) {
            return Err(ConfigError::validation(
                "Log level must be one of: trace, debug, info, warn, error",
            ));
        }

        if let Err(message) = PollInterval::new(self.watch.poll_interval()) {
            return Err(ConfigError::invalid_value("watch.poll_interval_ms", message));
        }

        Ok(())
    }
}

/// Engine tunables
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IoConfig {
    /// Strategy used when a request asks for `auto`
    pub default_mode: FileMode,
    /// Submission queue depth of the ring
    pub ring_queue_depth: QueueDepth,
    /// Block alignment for unbuffered transfers
    pub direct_alignment: Alignment,
    /// Size of each block kept by the pooled allocator
    pub pool_block_size: usize,
    /// Number of blocks the pooled allocator keeps around
    pub pool_max_blocks: usize,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            default_mode: FileMode::Auto,
            ring_queue_depth: QueueDepth::default(),
            direct_alignment: Alignment::default(),
            pool_block_size: 1024 * 1024, // 1MB
            pool_max_blocks: 16,
        }
    }
}

/// Thresholds used by the adaptive selector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    /// Requests smaller than this go through plain positional I/O
    pub small_io_threshold: u64,
    /// Random access at or above this rate goes to the ring
    pub ring_iops_threshold: u32,
    /// Sequential working sets at or above this size bypass the page cache
    pub direct_working_set_threshold: u64,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            small_io_threshold: 16 * 1024,                     // 16KB
            ring_iops_threshold: 1000,
            direct_working_set_threshold: 256 * 1024 * 1024, // 256MB
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level, overridden by `RUST_LOG` when set
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Change watcher configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Milliseconds between two polls of the watched files
    pub poll_interval_ms: u64,
}

impl WatchConfig {
    /// Interval as a duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: PollInterval::DEFAULT.as_millis() as u64,
        }
    }
}
