//! CLI command handlers.

pub mod config;
pub mod run;
pub mod validate;

use nebula_config::{ConfigLoader, LoadedConfig};

/// Shared context for all commands.
#[derive(Debug, Clone)]
pub struct Context {
    /// Merged configuration and the files it came from.
    pub config: LoadedConfig,
    /// Where the config layers live.
    pub loader: ConfigLoader,
    /// Verbose output enabled.
    pub verbose: bool,
}
