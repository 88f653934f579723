// This module handles config.toml.
// Every section is optional, and a missing file means "use the defaults".
// The config is read once at startup and handed to the predictor; nothing re-reads it.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PredictorConfig {
    pub server: ServerConfig,
    pub paths: PathsConfig,
    pub nodes: NodesConfig,
    pub patch: PatchConfig,
    pub fetch: FetchConfig,
    pub packaging: PackagingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// If false, we attach to a server somebody else started.
    pub launch: bool,
    pub comfyui_dir: PathBuf,
    pub python: String,
    pub startup_attempts: usize,
    pub startup_interval_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8188,
            launch: true,
            comfyui_dir: PathBuf::from("ComfyUI"),
            python: "python".to_string(),
            startup_attempts: 120,
            startup_interval_ms: 500,
        }
    }
}

impl ServerConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub workflow: PathBuf,
    pub output_dir: PathBuf,
    pub input_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub models_dir: PathBuf,
    pub package_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            workflow: PathBuf::from("workflow_api.json"),
            output_dir: PathBuf::from("/tmp/outputs"),
            input_dir: PathBuf::from("/tmp/inputs"),
            temp_dir: PathBuf::from("ComfyUI/temp"),
            models_dir: PathBuf::from("ComfyUI/models/checkpoints"),
            package_dir: PathBuf::from("/tmp/packaged"),
        }
    }
}

impl PathsConfig {
    /// Directories wiped at the start of every request.
    pub fn scratch_dirs(&self) -> Vec<PathBuf> {
        vec![
            self.output_dir.clone(),
            self.input_dir.clone(),
            self.temp_dir.clone(),
            self.package_dir.clone(),
        ]
    }
}

/// Node IDs inside workflow_api.json.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NodesConfig {
    pub loader: String,
    pub builder: String,
}

impl Default for NodesConfig {
    fn default() -> Self {
        Self {
            loader: "4".to_string(),
            builder: "3".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PatchConfig {
    pub round_to_multiple_of_8: bool,
    /// Reject min > opt > max instead of just warning about it.
    pub strict_ranges: bool,
    pub prefix_style: PrefixStyle,
}

/// What goes in the builder's `filename_prefix`, and so in the engine filenames.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PrefixStyle {
    /// The checkpoint name as resolved, extension and all.
    #[default]
    Checkpoint,
    /// `<checkpoint stem>_DYN`.
    Dyn,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FetchConfig {
    pub program: String,
    /// Extra arguments, placed before the URL and destination.
    pub args: Vec<String>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            program: "pget".to_string(),
            args: vec![],
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PackagingMode {
    #[default]
    Files,
    Chunked,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PackagingConfig {
    pub mode: PackagingMode,
    pub extension: String,
    pub archive_name: String,
    pub chunk_size: u64,
}

pub const DEFAULT_CHUNK_SIZE: u64 = 500 * 1024 * 1024;

impl Default for PackagingConfig {
    fn default() -> Self {
        Self {
            mode: PackagingMode::Files,
            extension: ".engine".to_string(),
            archive_name: "engines.zip".to_string(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

pub fn read_config(path: &Path) -> Result<PredictorConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Error reading {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("Error parsing {}", path.display()))
}

/// Loads the config file, or falls back to defaults when no path was given.
pub fn load(path: Option<&Path>) -> Result<PredictorConfig> {
    match path {
        Some(path) => read_config(path),
        None => Ok(PredictorConfig::default()),
    }
}

#[cfg(test)]
pub fn testconfig() -> PredictorConfig {
    toml::from_str(include_str!("../testdata/config.toml")).unwrap()
}
