//! Engine settings stored as TOML.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Environment variable overriding [`Settings::default_model`].
pub const MODEL_ENV: &str = "LLM_MODEL";
/// Environment variable overriding [`Settings::endpoint`].
pub const ENDPOINT_ENV: &str = "LLM_API_ENDPOINT";

/// How the commands of one task are dispatched to the shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dispatch {
    /// One at a time, stopping at the first failure.
    #[default]
    Sequential,
    /// All at once on worker threads, joined before the task finishes.
    Parallel,
}

/// Operating system the generated commands target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Macos,
    Linux,
    Windows,
}

impl Platform {
    pub fn host() -> Self {
        if cfg!(target_os = "macos") {
            Platform::Macos
        } else if cfg!(windows) {
            Platform::Windows
        } else {
            Platform::Linux
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Platform::Macos => "macos",
            Platform::Linux => "linux",
            Platform::Windows => "windows",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Platform::Macos => "macOS",
            Platform::Linux => "Linux",
            Platform::Windows => "Windows",
        }
    }
}

impl Default for Platform {
    fn default() -> Self {
        Platform::host()
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Engine settings (TOML).
///
/// Loaded once at startup. Missing fields fall back to defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Settings {
    /// Model used for task and command generation.
    pub default_model: String,
    /// Model used for image analysis.
    pub vision_model: String,
    /// Whether goals may call the vision model.
    pub vision_enabled: bool,
    /// Tracing filter used when `RUST_LOG` is unset.
    pub log_level: String,
    /// Base URL of the model server.
    pub endpoint: String,
    /// Generation attempts per task.
    pub max_retries: u32,
    pub shell_timeout_secs: u64,
    pub model_timeout_secs: u64,
    /// Truncate captured command stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,
    /// Upper bound for a rendered system prompt.
    pub prompt_budget_bytes: usize,
    /// User/assistant exchanges kept in the chat history.
    pub history_max_exchanges: usize,
    pub dispatch: Dispatch,
    pub platform: Platform,
    /// JSONL file receiving one record per task attempt. Unset disables it.
    pub execution_log: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_model: "llama3.2".to_string(),
            vision_model: "gemma3:12b".to_string(),
            vision_enabled: false,
            log_level: "info".to_string(),
            endpoint: "http://localhost:11434".to_string(),
            max_retries: 3,
            shell_timeout_secs: 20,
            model_timeout_secs: 60,
            output_limit_bytes: 64_000,
            prompt_budget_bytes: 16_000,
            history_max_exchanges: 8,
            dispatch: Dispatch::Sequential,
            platform: Platform::host(),
            execution_log: None,
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        if self.default_model.trim().is_empty() {
            return Err(anyhow!("default_model must not be empty"));
        }
        if self.vision_enabled && self.vision_model.trim().is_empty() {
            return Err(anyhow!("vision_model must be set when vision_enabled is true"));
        }
        if !self.endpoint.starts_with("http://") && !self.endpoint.starts_with("https://") {
            return Err(anyhow!("endpoint must be an http(s) URL"));
        }
        if self.max_retries == 0 {
            return Err(anyhow!("max_retries must be > 0"));
        }
        if self.shell_timeout_secs == 0 {
            return Err(anyhow!("shell_timeout_secs must be > 0"));
        }
        if self.model_timeout_secs == 0 {
            return Err(anyhow!("model_timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.prompt_budget_bytes == 0 {
            return Err(anyhow!("prompt_budget_bytes must be > 0"));
        }
        if self.history_max_exchanges == 0 {
            return Err(anyhow!("history_max_exchanges must be > 0"));
        }
        Ok(())
    }

    /// Apply `LLM_MODEL` / `LLM_API_ENDPOINT` when they are set and non-empty.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(
            std::env::var(MODEL_ENV).ok(),
            std::env::var(ENDPOINT_ENV).ok(),
        );
    }

    fn apply_overrides(&mut self, model: Option<String>, endpoint: Option<String>) {
        if let Some(model) = model.filter(|value| !value.trim().is_empty()) {
            debug!(model = %model, "model overridden from environment");
            self.default_model = model;
        }
        if let Some(endpoint) = endpoint.filter(|value| !value.trim().is_empty()) {
            debug!(endpoint = %endpoint, "endpoint overridden from environment");
            self.endpoint = endpoint;
        }
    }
}

/// Default settings location: `<config dir>/engine/settings.toml`, falling
/// back to `.engine/settings.toml` when the platform has no config dir.
pub fn default_settings_path() -> PathBuf {
    dirs::config_dir()
        .map(|dir| dir.join("engine"))
        .unwrap_or_else(|| PathBuf::from(".engine"))
        .join("settings.toml")
}

/// Load settings from a TOML file.
///
/// If the file is missing, returns `Settings::default()`.
pub fn load_settings(path: &Path) -> Result<Settings> {
    if !path.exists() {
        debug!(path = %path.display(), "settings file missing, using defaults");
        let settings = Settings::default();
        settings.validate()?;
        return Ok(settings);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let settings: Settings =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    settings
        .validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(settings)
}

/// Atomically write settings to disk (temp file + rename).
pub fn write_settings(path: &Path, settings: &Settings) -> Result<()> {
    settings.validate()?;
    let mut buf = toml::to_string_pretty(settings).context("serialize settings toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("settings path missing parent {}", path.display()))?;
    if !parent.as_os_str().is_empty() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp settings {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace settings {}", path.display()))?;
    Ok(())
}
