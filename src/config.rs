use crate::error::{Result, ShimError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShimConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub native: NativeConfig,
    #[serde(default)]
    pub translation: TranslationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NativeConfig {
    #[serde(default = "default_native_url")]
    pub base_url: String,
    /// Request timeout towards the native server. Unset means no timeout.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

/// Knobs for the translation engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslationConfig {
    /// Multiplier applied to the public `temperature` before it reaches the runtime.
    #[serde(default = "default_temperature_scale")]
    pub temperature_scale: f64,
    /// Report whitespace-estimated usage (flagged `approximate`) when the runtime sends no counts.
    #[serde(default)]
    pub estimate_usage: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    11435
}

fn default_native_url() -> String {
    "http://127.0.0.1:11434".to_string()
}

fn default_temperature_scale() -> f64 {
    1.0
}

impl Default for ShimConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            native: NativeConfig::default(),
            translation: TranslationConfig::default(),
            log_file: None,
        }
    }
}

impl Default for NativeConfig {
    fn default() -> Self {
        Self {
            base_url: default_native_url(),
            timeout_secs: None,
        }
    }
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self {
            temperature_scale: default_temperature_scale(),
            estimate_usage: false,
        }
    }
}

impl ShimConfig {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ShimError::config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Search standard locations for a config file, falling back to defaults.
    /// Priority: CLI arg > CWD > XDG config > home dir
    pub fn find_and_load(explicit_path: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit_path {
            return Self::load(path);
        }

        for candidate in config_search_paths() {
            if candidate.exists() {
                tracing::info!(path = %candidate.display(), "Loading config");
                return Self::load(&candidate);
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    pub fn validate(&self) -> Result<()> {
        let scale = self.translation.temperature_scale;
        if !scale.is_finite() || scale <= 0.0 {
            return Err(ShimError::config(format!(
                "translation.temperature_scale must be a positive number, got {scale}"
            )));
        }
        if !(self.native.base_url.starts_with("http://")
            || self.native.base_url.starts_with("https://"))
        {
            return Err(ShimError::config(format!(
                "native.base_url must be an http(s) URL, got '{}'",
                self.native.base_url
            )));
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

pub fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("openai-shim.toml")];

    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        paths.push(PathBuf::from(xdg).join("openai-shim").join("config.toml"));
    }
    if let Some(home) = home_dir() {
        paths.push(home.join(".config").join("openai-shim").join("config.toml"));
        paths.push(home.join(".openai-shim.toml"));
    }

    paths
}

fn home_dir() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
