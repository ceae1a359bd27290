//! Locating and layering nebula config files.
//!
//! Two layers are read, lowest precedence first:
//!
//! | Layer     | File                                                          |
//! |-----------|---------------------------------------------------------------|
//! | `user`    | `$NEBULA_CONFIG_DIR/config.toml`, else `<platform config>/nebula/config.toml` |
//! | `project` | `<project dir>/nebula.toml`                                   |
//!
//! A section set by a higher layer replaces the lower layer's section
//! wholesale. A layer that fails to read or parse is skipped with a warning.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::{ConfigError, NebulaConfig, Result};

const CONFIG_DIR_ENV: &str = "NEBULA_CONFIG_DIR";

/// A config file layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    User,
    Project,
}

impl Layer {
    /// All layers, lowest precedence first.
    pub const ALL: [Layer; 2] = [Layer::User, Layer::Project];

    pub fn as_str(self) -> &'static str {
        match self {
            Layer::User => "user",
            Layer::Project => "project",
        }
    }

    fn file_name(self) -> &'static str {
        match self {
            Layer::User => "config.toml",
            Layer::Project => "nebula.toml",
        }
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// What happened to one layer during loading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayerStatus {
    /// No file at the layer's path.
    Missing,
    /// Merged; lists the sections the layer set.
    Loaded { sections: Vec<&'static str> },
    /// Present but unreadable or not valid TOML; ignored.
    Malformed { error: String },
}

/// One layer's path and load result.
#[derive(Debug, Clone)]
pub struct LayerReport {
    pub layer: Layer,
    pub path: PathBuf,
    pub status: LayerStatus,
}

impl LayerReport {
    pub fn is_loaded(&self) -> bool {
        matches!(self.status, LayerStatus::Loaded { .. })
    }
}

/// The merged config and a report per layer that had a resolvable path.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: NebulaConfig,
    pub layers: Vec<LayerReport>,
}

impl LoadedConfig {
    /// Paths of the layers that were merged, lowest precedence first.
    pub fn loaded_from(&self) -> Vec<&Path> {
        self.layers
            .iter()
            .filter(|r| r.is_loaded())
            .map(|r| r.path.as_path())
            .collect()
    }

    /// One line per malformed layer.
    pub fn warnings(&self) -> Vec<String> {
        self.layers
            .iter()
            .filter_map(|r| match &r.status {
                LayerStatus::Malformed { error } => Some(format!(
                    "ignoring {} config {}: {}",
                    r.layer,
                    r.path.display(),
                    error
                )),
                _ => None,
            })
            .collect()
    }

    pub fn layer(&self, layer: Layer) -> Option<&LayerReport> {
        self.layers.iter().find(|r| r.layer == layer)
    }

    /// The layer that supplied `section`, if any layer set it.
    pub fn section_origin(&self, section: &str) -> Option<Layer> {
        self.layers.iter().rev().find_map(|r| match &r.status {
            LayerStatus::Loaded { sections } if sections.iter().any(|s| *s == section) => {
                Some(r.layer)
            }
            _ => None,
        })
    }
}

/// Resolves layer paths and loads or initializes them.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    user_dir: Option<PathBuf>,
    project_dir: PathBuf,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self {
            user_dir: user_config_dir(),
            project_dir: PathBuf::from("."),
        }
    }
}

impl ConfigLoader {
    /// Loader for the current directory and the resolved user config dir.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the user layer from `dir` instead of the resolved default.
    pub fn with_user_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.user_dir = Some(dir.into());
        self
    }

    pub fn with_project_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.project_dir = dir.into();
        self
    }

    pub fn user_dir(&self) -> Option<&Path> {
        self.user_dir.as_deref()
    }

    /// Where a layer's file lives. `None` only for the user layer when no
    /// config directory can be resolved.
    pub fn layer_path(&self, layer: Layer) -> Option<PathBuf> {
        match layer {
            Layer::User => self.user_dir.as_ref().map(|d| d.join(layer.file_name())),
            Layer::Project => Some(self.project_dir.join(layer.file_name())),
        }
    }

    /// Merge every layer that exists. Never fails on a bad layer; see
    /// [`LoadedConfig::warnings`].
    pub fn load(&self) -> LoadedConfig {
        let mut config = NebulaConfig::new();
        let mut layers = Vec::new();

        for layer in Layer::ALL {
            let Some(path) = self.layer_path(layer) else {
                continue;
            };
            let status = if !path.is_file() {
                LayerStatus::Missing
            } else {
                match read_layer(&path) {
                    Ok(layer_config) => {
                        let sections = layer_config.sections();
                        config.merge(layer_config);
                        LayerStatus::Loaded { sections }
                    }
                    Err(e) => LayerStatus::Malformed {
                        error: e.to_string(),
                    },
                }
            };
            layers.push(LayerReport {
                layer,
                path,
                status,
            });
        }

        LoadedConfig { config, layers }
    }

    /// Write a layer file holding the default engine, store, and logging
    /// sections. Refuses to overwrite an existing file.
    pub fn init(&self, layer: Layer) -> Result<PathBuf> {
        let path = self
            .layer_path(layer)
            .ok_or(ConfigError::NoConfigDir)?;
        if path.exists() {
            return Err(ConfigError::AlreadyExists {
                path: path.display().to_string(),
            });
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::WriteFile {
                path: parent.display().to_string(),
                source: e,
            })?;
        }

        let contents = NebulaConfig::with_defaults().to_toml()?;
        std::fs::write(&path, contents).map_err(|e| ConfigError::WriteFile {
            path: path.display().to_string(),
            source: e,
        })?;
        Ok(path)
    }
}

/// The user config directory: `NEBULA_CONFIG_DIR` when set and non-empty,
/// else the platform config directory joined with `nebula`.
pub fn user_config_dir() -> Option<PathBuf> {
    match std::env::var(CONFIG_DIR_ENV) {
        Ok(dir) if !dir.is_empty() => Some(PathBuf::from(dir)),
        _ => dirs::config_dir().map(|d| d.join("nebula")),
    }
}

fn read_layer(path: &Path) -> Result<NebulaConfig> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.display().to_string(),
        source: e,
    })?;
    NebulaConfig::from_toml(&contents)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
