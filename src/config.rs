//! Project configuration management for `rulescope.toml`.
//!
//! # Sections
//!
//! | Section     | Purpose                                                |
//! |-------------|--------------------------------------------------------|
//! | `[project]` | Source root, generated dir, manifest name, extension   |
//! | `[sync]`    | Quiesce timing, log history capacity, runtime endpoint |
//!
//! The project root is the parent directory of the config file; relative
//! paths inside the file resolve against it.

use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;

use crate::log;

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error when reading `{0}`")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("Config file parsing error")]
    Toml(#[from] toml::de::Error),

    #[error("Config validation error: {0}")]
    Validation(String),
}

// ============================================================================
// root configuration
// ============================================================================

/// Root configuration structure representing rulescope.toml
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Absolute path to the config file (internal use only)
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Project root directory - parent of config file (internal use only)
    #[serde(skip)]
    pub root: PathBuf,

    /// Project layout settings
    #[serde(default)]
    pub project: ProjectSection,

    /// Synchronization settings
    #[serde(default)]
    pub sync: SyncSection,
}

/// `[project]` - where sources and generated output live
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectSection {
    /// Directory containing dialogue-rule source files
    pub source_root: PathBuf,
    /// Directory the compiler writes generated output into
    pub generated_dir: PathBuf,
    /// Well-known manifest filename inside `generated_dir`
    pub manifest_name: String,
    /// Recognized source file extension (without dot)
    pub source_extension: String,
}

impl Default for ProjectSection {
    fn default() -> Self {
        Self {
            source_root: PathBuf::from("dialogs"),
            generated_dir: PathBuf::from("generated"),
            manifest_name: "rules.json".into(),
            source_extension: "rules".into(),
        }
    }
}

/// `[sync]` - timing and runtime-link settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSection {
    /// Idle window after the last manifest write before a reload fires (ms)
    pub manifest_idle_ms: u64,
    /// Number of interpreter log entries retained in memory
    pub log_history: usize,
    /// Interpreter endpoint, e.g. `ws://127.0.0.1:9151`
    pub runtime_url: Option<String>,
    /// Connect to the interpreter as soon as the project opens
    pub autoconnect: bool,
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            manifest_idle_ms: 500,
            log_history: 256,
            runtime_url: None,
            autoconnect: false,
        }
    }
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            config_path: PathBuf::new(),
            root: PathBuf::new(),
            project: ProjectSection::default(),
            sync: SyncSection::default(),
        }
    }
}

impl ProjectConfig {
    /// Parse configuration from TOML string
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        Ok(config)
    }

    /// Load configuration from file path with unknown field detection.
    ///
    /// Unknown fields are collected and logged; they never abort the load
    /// (this is a library - there is nobody to prompt).
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let path = expand_path(path);
        let content =
            fs::read_to_string(&path).map_err(|err| ConfigError::Io(path.clone(), err))?;

        let (mut config, ignored) = Self::parse_with_ignored(&content)?;

        if !ignored.is_empty() {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string());
            log!("warning"; "unknown fields in {}: {}", name, ignored.join(", "));
        }

        config.config_path = crate::watch::normalize_path(&path);
        config.root = config
            .config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();

        config.validate()?;
        Ok(config)
    }

    /// Parse TOML content, collecting any unknown fields.
    fn parse_with_ignored(content: &str) -> Result<(Self, Vec<String>), ConfigError> {
        let mut ignored = Vec::new();
        let deserializer = toml::Deserializer::new(content);
        let config = serde_ignored::deserialize(deserializer, |path: serde_ignored::Path| {
            ignored.push(path.to_string());
        })?;
        Ok((config, ignored))
    }

    /// Validate field values that cannot be expressed in the type system.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.project.manifest_name.trim().is_empty() {
            return Err(ConfigError::Validation(
                "project.manifest_name must not be empty".into(),
            ));
        }
        if self.project.manifest_name.contains(['/', '\\']) {
            return Err(ConfigError::Validation(format!(
                "project.manifest_name must be a bare filename, got `{}`",
                self.project.manifest_name
            )));
        }
        if self.project.source_extension.trim().is_empty() {
            return Err(ConfigError::Validation(
                "project.source_extension must not be empty".into(),
            ));
        }
        if self.sync.manifest_idle_ms == 0 {
            return Err(ConfigError::Validation(
                "sync.manifest_idle_ms must be positive".into(),
            ));
        }
        if self.sync.log_history == 0 {
            return Err(ConfigError::Validation(
                "sync.log_history must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Absolute path of the watched source root.
    pub fn source_root(&self) -> PathBuf {
        self.root_join(&self.project.source_root)
    }

    /// Absolute path of the generated-output directory.
    pub fn generated_dir(&self) -> PathBuf {
        self.root_join(&self.project.generated_dir)
    }

    /// Absolute path of the manifest file.
    pub fn manifest_path(&self) -> PathBuf {
        self.generated_dir().join(&self.project.manifest_name)
    }

    /// Join a path with the project root (absolute paths pass through).
    pub fn root_join(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    /// Check whether a path has the recognized source extension.
    pub fn is_source_path(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case(&self.project.source_extension))
    }
}

/// Expand `~` in user-supplied paths.
fn expand_path(path: &Path) -> PathBuf {
    let expanded = shellexpand::tilde(path.to_str().unwrap_or_default()).into_owned();
    PathBuf::from(expanded)
}
