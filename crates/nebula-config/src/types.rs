//! Configuration types mapping to the TOML schema.
//!
//! Top-level config:
//! ```toml
//! [engine]          # worker pool and timeouts
//! [store]           # plan store backend
//! [invoker.http]    # remote data-plane invoker
//! [logging]         # log level and file output
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{ConfigError, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Top-level Config
// ─────────────────────────────────────────────────────────────────────────────

/// Root configuration structure.
///
/// All sections are optional so that partial configs (e.g. project-local
/// overrides) can be loaded and merged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NebulaConfig {
    /// Execution engine tuning.
    pub engine: Option<EngineSection>,

    /// Plan store backend.
    pub store: Option<StoreSection>,

    /// Step invoker configuration.
    pub invoker: Option<InvokerSection>,

    /// Logging configuration.
    pub logging: Option<LoggingSection>,
}

impl NebulaConfig {
    /// Create an empty config.
    pub fn new() -> Self {
        Self::default()
    }

    /// A config with the engine, store, and logging sections spelled out
    /// at their defaults.
    pub fn with_defaults() -> Self {
        Self {
            engine: Some(EngineSection::default()),
            store: Some(StoreSection::default()),
            invoker: None,
            logging: Some(LoggingSection::default()),
        }
    }

    /// Names of the sections this config sets, in schema order.
    pub fn sections(&self) -> Vec<&'static str> {
        [
            ("engine", self.engine.is_some()),
            ("store", self.store.is_some()),
            ("invoker", self.invoker.is_some()),
            ("logging", self.logging.is_some()),
        ]
        .into_iter()
        .filter_map(|(name, set)| set.then_some(name))
        .collect()
    }

    /// Parse from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Serialize to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Merge another config on top of this one (other takes priority).
    ///
    /// Sections are replaced wholesale; the HTTP invoker's capability list is
    /// not unioned across layers.
    pub fn merge(&mut self, other: NebulaConfig) {
        if other.engine.is_some() {
            self.engine = other.engine;
        }

        if other.store.is_some() {
            self.store = other.store;
        }

        if other.invoker.is_some() {
            self.invoker = other.invoker;
        }

        if other.logging.is_some() {
            self.logging = other.logging;
        }
    }

    /// Effective engine section (defaults when absent).
    pub fn engine(&self) -> EngineSection {
        self.engine.clone().unwrap_or_default()
    }

    /// Effective store section (defaults when absent).
    pub fn store(&self) -> StoreSection {
        self.store.clone().unwrap_or_default()
    }

    /// Effective logging section (defaults when absent).
    pub fn logging(&self) -> LoggingSection {
        self.logging.clone().unwrap_or_default()
    }

    /// The HTTP invoker section, if configured.
    pub fn http_invoker(&self) -> Option<&HttpInvokerSection> {
        self.invoker.as_ref().and_then(|i| i.http.as_ref())
    }

    /// Reject values that parse but cannot be used.
    pub fn validate(&self) -> Result<()> {
        let engine = self.engine();
        if engine.worker_pool_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "engine.worker_pool_size".into(),
                reason: "must be at least 1".into(),
            });
        }
        if engine.approval_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "engine.approval_timeout_secs".into(),
                reason: "must be at least 1".into(),
            });
        }
        if engine.default_step_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "engine.default_step_timeout_secs".into(),
                reason: "must be at least 1".into(),
            });
        }

        let store = self.store();
        if store.kind == StoreKind::File && store.path.is_none() {
            return Err(ConfigError::InvalidValue {
                field: "store.path".into(),
                reason: "required when store.kind = \"file\"".into(),
            });
        }

        if let Some(http) = self.http_invoker()
            && http.base_url.trim().is_empty()
        {
            return Err(ConfigError::InvalidValue {
                field: "invoker.http.base_url".into(),
                reason: "cannot be empty".into(),
            });
        }

        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Engine Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Execution engine configuration.
///
/// ```toml
/// [engine]
/// worker_pool_size = 10
/// approval_timeout_secs = 300
/// default_step_timeout_secs = 300
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    /// Fixed size of the worker pool shared by all runs.
    ///
    /// Runs blocked on approvals or pauses keep their slot, so size this for
    /// the maximum number of concurrently pending approvals.
    pub worker_pool_size: usize,
    /// How long an approval ticket waits for a decision.
    pub approval_timeout_secs: u64,
    /// Step timeout used when a step declares none.
    pub default_step_timeout_secs: u64,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            worker_pool_size: 10,
            approval_timeout_secs: 300,
            default_step_timeout_secs: 300,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Store Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Plan store backend kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    /// Process-local store; nothing survives a restart.
    #[default]
    Memory,
    /// Directory of plan files plus JSON run records.
    File,
}

/// Plan store configuration.
///
/// ```toml
/// [store]
/// kind = "file"
/// path = "./nebula-data"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    /// Backend kind.
    pub kind: StoreKind,
    /// Root directory for the file backend.
    pub path: Option<PathBuf>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Invoker Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Step invoker configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InvokerSection {
    /// Remote data-plane invoker.
    pub http: Option<HttpInvokerSection>,
}

/// Remote data-plane invoker.
///
/// ```toml
/// [invoker.http]
/// base_url = "http://localhost:8081"
/// capabilities = ["coder", "reviewer"]
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpInvokerSection {
    /// Base URL of the data plane.
    pub base_url: String,
    /// Capabilities routed to the data plane.
    #[serde(default)]
    pub capabilities: Vec<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Logging Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Logging configuration section.
///
/// ```toml
/// [logging]
/// level = "info"
/// file = true
/// dir = "./logs"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Default filter level for nebula targets.
    pub level: String,
    /// Also write JSON logs to a daily rolling file.
    pub file: bool,
    /// Directory for log files. Defaults to `<user config dir>/logs`.
    pub dir: Option<PathBuf>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: false,
            dir: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_defaults_round_trips_sections() {
        let config = NebulaConfig::with_defaults();
        assert_eq!(config.sections(), vec!["engine", "store", "logging"]);

        let reparsed = NebulaConfig::from_toml(&config.to_toml().unwrap()).unwrap();
        assert_eq!(reparsed.sections(), vec!["engine", "store", "logging"]);
        assert_eq!(reparsed.engine(), EngineSection::default());
        reparsed.validate().unwrap();
    }

    #[test]
    fn test_empty_config_defaults() {
        let config = NebulaConfig::from_toml("").unwrap();
        assert!(config.engine.is_none());
        assert_eq!(config.engine().worker_pool_size, 10);
        assert_eq!(config.engine().approval_timeout_secs, 300);
        assert_eq!(config.engine().default_step_timeout_secs, 300);
        assert_eq!(config.store().kind, StoreKind::Memory);
        assert_eq!(config.logging().level, "info");
        assert!(config.http_invoker().is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_full_config() {
        let config = NebulaConfig::from_toml(
            r#"
[engine]
worker_pool_size = 4
approval_timeout_secs = 60

[store]
kind = "file"
path = "/tmp/nebula"

[invoker.http]
base_url = "http://localhost:8081"
capabilities = ["coder", "reviewer"]

[logging]
level = "debug"
file = true
"#,
        )
        .unwrap();

        let engine = config.engine();
        assert_eq!(engine.worker_pool_size, 4);
        assert_eq!(engine.approval_timeout_secs, 60);
        // Unset fields fall back to defaults
        assert_eq!(engine.default_step_timeout_secs, 300);

        assert_eq!(config.store().kind, StoreKind::File);
        assert_eq!(config.store().path, Some(PathBuf::from("/tmp/nebula")));

        let http = config.http_invoker().unwrap();
        assert_eq!(http.base_url, "http://localhost:8081");
        assert_eq!(http.capabilities, vec!["coder", "reviewer"]);

        assert_eq!(config.logging().level, "debug");
        assert!(config.logging().file);
        config.validate().unwrap();
    }

    #[test]
    fn test_merge_overrides_sections() {
        let mut base = NebulaConfig::from_toml(
            r#"
[engine]
worker_pool_size = 4

[logging]
level = "warn"
"#,
        )
        .unwrap();
        let overlay = NebulaConfig::from_toml(
            r#"
[engine]
worker_pool_size = 16
"#,
        )
        .unwrap();

        base.merge(overlay);
        assert_eq!(base.engine().worker_pool_size, 16);
        // Sections absent from the overlay are kept
        assert_eq!(base.logging().level, "warn");
    }

    #[test]
    fn test_validate_zero_pool() {
        let config = NebulaConfig::from_toml("[engine]\nworker_pool_size = 0\n").unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("engine.worker_pool_size"));
    }

    #[test]
    fn test_validate_file_store_without_path() {
        let config = NebulaConfig::from_toml("[store]\nkind = \"file\"\n").unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("store.path"));
    }

    #[test]
    fn test_validate_empty_base_url() {
        let config = NebulaConfig::from_toml("[invoker.http]\nbase_url = \"  \"\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_store_kind_rejected() {
        assert!(NebulaConfig::from_toml("[store]\nkind = \"postgres\"\n").is_err());
    }

    #[test]
    fn test_toml_roundtrip() {
        let mut config = NebulaConfig::new();
        config.engine = Some(EngineSection {
            worker_pool_size: 3,
            ..Default::default()
        });
        let text = config.to_toml().unwrap();
        let parsed = NebulaConfig::from_toml(&text).unwrap();
        assert_eq!(parsed.engine(), config.engine());
    }
}
