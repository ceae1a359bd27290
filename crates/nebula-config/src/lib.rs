//! Configuration system for the Nebula execution engine.
//!
//! Provides TOML-based configuration with:
//! - Engine tuning (`[engine]`): worker pool size, approval and step timeouts
//! - Plan store selection (`[store]`): in-memory or file-backed
//! - Remote step invocation (`[invoker.http]`)
//! - Logging output (`[logging]`)
//! - Config file layering (user config dir + project-local overrides)

pub mod discovery;
pub mod error;
pub mod types;

pub use discovery::{
    ConfigLoader, Layer, LayerReport, LayerStatus, LoadedConfig, user_config_dir,
};
pub use error::{ConfigError, Result};
pub use types::*;
