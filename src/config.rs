use crate::error::{FfiError, Result};
use crate::interop::{BindingMode, LoadFlags, Visibility};
use crate::logging::{self, LogConfig, LogFormat, LogOutput};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

const CONFIG_FILE: &str = "ffidyn.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FfiConfig {
    #[serde(default)]
    pub layout: LayoutConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Libraries opened when a context is built from this config
    #[serde(default, rename = "library")]
    pub libraries: Vec<LibraryConfig>,

    /// Types defined, in order, when a context is built from this config
    #[serde(default, rename = "typedef")]
    pub typedefs: Vec<TypedefConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LayoutConfig {
    #[serde(default)]
    pub mismatch: MismatchPolicy,
}

/// Treatment of an aggregate whose local layout disagrees with the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MismatchPolicy {
    #[default]
    Error,
    Warn,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,

    /// "stderr", "stdout", or a file path
    #[serde(default = "default_output")]
    pub output: String,

    #[serde(default = "default_false")]
    pub span_events: bool,

    #[serde(default)]
    pub filter: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibraryConfig {
    pub path: String,

    #[serde(default)]
    pub binding: Option<BindingMode>,

    #[serde(default)]
    pub visibility: Option<Visibility>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypedefConfig {
    pub name: String,
    pub elements: Vec<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: LogFormat::default(),
            output: default_output(),
            span_events: false,
            filter: None,
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}

fn default_output() -> String {
    "stderr".to_string()
}

fn default_false() -> bool {
    false
}

impl LoggingConfig {
    pub fn to_log_config(&self) -> LogConfig {
        let output = match self.output.as_str() {
            "stderr" => LogOutput::Stderr,
            "stdout" => LogOutput::Stdout,
            path => logging::file_output(path),
        };
        LogConfig {
            level: logging::parse_level(&self.level).unwrap_or(tracing::Level::INFO),
            format: self.format,
            output,
            span_events: self.span_events,
            filter: self.filter.clone(),
        }
    }
}

impl LibraryConfig {
    pub fn flags(&self) -> LoadFlags {
        LoadFlags { binding: self.binding, visibility: self.visibility }
    }
}

impl FfiConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| FfiError::Config(format!("failed to read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| FfiError::Config(format!("failed to parse config: {}", e)))
    }

    /// Find `ffidyn.toml` in the current directory or its parents
    pub fn discover() -> Self {
        let mut current = std::env::current_dir().ok();

        while let Some(dir) = current {
            let candidate = dir.join(CONFIG_FILE);
            if candidate.exists() {
                if let Ok(config) = Self::from_file(&candidate) {
                    return config;
                }
            }
            current = dir.parent().map(|p| p.to_path_buf());
        }

        Self::default()
    }
}
