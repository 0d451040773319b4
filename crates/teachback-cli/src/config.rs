//! Configuration loading from TOML files.
//!
//! Lookup order:
//! 1. `$TEACHBACK_CONFIG` environment variable
//! 2. `~/.config/teachback/config.toml`
//! 3. Built-in defaults (everything is optional)

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;

use teachback_core::gemini::{DEFAULT_BASE_URL, DEFAULT_MODEL};
use teachback_core::{QuizVariant, StageDurations};

/// Top-level configuration.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store: StoreConfig,
    pub provider: ProviderConfig,
    pub experiment: ExperimentConfig,
    pub server: ServerConfig,
}

/// Database storage settings.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite database path. Default: platform-specific data dir.
    pub path: Option<String>,
}

/// Text-completion provider.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub base_url: String,
    /// Model used by in-process sessions.
    pub model: String,
    /// Model used behind the HTTP proxy.
    pub proxy_model: String,
    /// Environment variable holding the API key. The key itself never lives in the file.
    pub api_key_env: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    pub teach_back: bool,
    pub quiz_variant: QuizVariant,
    pub teaching_secs: u32,
    pub teach_back_secs: u32,
    pub quiz_secs: u32,
}

/// Proxy listener.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

// --- Defaults ---

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.into(),
            model: DEFAULT_MODEL.into(),
            proxy_model: "gemini-2.5-flash".into(),
            api_key_env: "GEMINI_API_KEY".into(),
            timeout_secs: 60,
        }
    }
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        let durations = StageDurations::default();
        Self {
            teach_back: true,
            quiz_variant: QuizVariant::default(),
            teaching_secs: durations.teaching,
            teach_back_secs: durations.teach_back,
            quiz_secs: durations.quiz,
        }
    }
}

impl ExperimentConfig {
    pub fn durations(&self) -> StageDurations {
        StageDurations {
            teaching: self.teaching_secs,
            teach_back: self.teach_back_secs,
            quiz: self.quiz_secs,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 3001,
        }
    }
}

impl ServerConfig {
    /// Port from `API_PORT` when set and valid, else the configured one.
    pub fn effective_port(&self) -> u16 {
        std::env::var("API_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(self.port)
    }
}

/// Load config from disk. Returns defaults if no config file exists.
pub fn load_config() -> Result<Config> {
    let path = config_path();

    if let Some(p) = &path {
        if p.exists() {
            let content =
                std::fs::read_to_string(p).with_context(|| format!("reading {}", p.display()))?;
            let config: Config =
                toml::from_str(&content).with_context(|| format!("parsing {}", p.display()))?;
            return Ok(config);
        }
    }

    Ok(Config::default())
}

/// Resolve the config file path.
fn config_path() -> Option<PathBuf> {
    if let Ok(p) = std::env::var("TEACHBACK_CONFIG") {
        return Some(PathBuf::from(p));
    }

    directories::BaseDirs::new().map(|dirs| {
        dirs.home_dir()
            .join(".config")
            .join("teachback")
            .join("config.toml")
    })
}

/// Show the active config path (for `teachback config`).
pub fn show_config_path() -> String {
    match config_path() {
        Some(p) if p.exists() => format!("{} (loaded)", p.display()),
        Some(p) => format!("{} (not found, using defaults)", p.display()),
        None => "no config path resolved (using defaults)".into(),
    }
}
