//! Configuration file loading for techsage.
//!
//! This module handles file IO and merging of configuration from multiple
//! sources. The priority order (highest to lowest):
//!
//! 1. `TECHSAGE_*` environment variables
//! 2. `--config <path>` specified file
//! 3. Project root: `./techsage.toml` or `./.techsage.toml`
//! 4. XDG config: `$XDG_CONFIG_HOME/techsage/config.toml`
//! 5. Fallback: `~/.config/techsage/config.toml`
//! 6. Default values

mod file_config;
mod loader;

pub use file_config::{
    ConfigValidationError, FileAgentConfig, FileBackpressureConfig, FileCacheConfig, FileConfig,
    FileLogConfig, FilePoolConfig, FileRetryConfig, FileSessionsConfig, FileStreamingConfig,
    FileTechnologyConfig,
};
pub use loader::ConfigLoader;
