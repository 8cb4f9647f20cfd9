//! # Service Configuration
//!
//! Configuration for the HTTP surface, artifact directories, external tools,
//! the process runner and the relay client.
//!
//! ## Example: TOML Configuration
//!
//! ```toml
//! [server]
//! port = 2304
//!
//! [paths]
//! uploads_dir = "/src/uploads"
//! profiles_dir = "/src/profiles"
//!
//! [tools]
//! tweaker = ["python3", "/src/Tweaker-3/Tweaker.py"]
//! slicer_candidates = ["/Slic3r/slic3r-dist/bin/prusa-slicer"]
//!
//! [runner]
//! poll_interval_ms = 500
//!
//! [relay]
//! timeout_secs = 5
//! ```
//!
//! Every field has a default, so an empty file is a valid configuration.

// src/config.rs - Single configuration file
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main configuration struct for the service.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub relay: RelayConfig,
}

/// HTTP listener settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Larger meshes make tweaking impractically slow.
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

/// Where uploaded models, produced artifacts and profiles live.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PathsConfig {
    #[serde(default = "default_uploads_dir")]
    pub uploads_dir: PathBuf,
    #[serde(default = "default_profiles_dir")]
    pub profiles_dir: PathBuf,
    /// File name inside `profiles_dir`.
    #[serde(default = "default_profile")]
    pub default_profile: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            uploads_dir: default_uploads_dir(),
            profiles_dir: default_profiles_dir(),
            default_profile: default_profile(),
        }
    }
}

impl PathsConfig {
    pub fn default_profile_path(&self) -> PathBuf {
        self.profiles_dir.join(&self.default_profile)
    }
}

/// External tool locations.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ToolsConfig {
    /// Program and leading arguments of the tweak tool.
    #[serde(default = "default_tweaker")]
    pub tweaker: Vec<String>,
    /// Searched in order; the first existing file is used.
    #[serde(default = "default_slicer_candidates")]
    pub slicer_candidates: Vec<PathBuf>,
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            tweaker: default_tweaker(),
            slicer_candidates: default_slicer_candidates(),
            allowed_extensions: default_allowed_extensions(),
        }
    }
}

impl ToolsConfig {
    /// First slicer candidate that exists on disk.
    pub fn resolve_slicer(&self) -> Option<PathBuf> {
        let found = self.slicer_candidates.iter().find(|p| p.is_file()).cloned();
        match &found {
            Some(path) => tracing::info!("Slicer was loaded from '{}'", path.display()),
            None => {
                tracing::warn!("The slicer can't be found, make sure it is available in one of these paths:");
                tracing::warn!("{:?}", self.slicer_candidates);
                tracing::warn!("The slicing functionality can't be used.");
            }
        }
        found
    }

    /// Whether the tweak tool's program (and its script, if any) can be found.
    pub fn tweaker_available(&self) -> bool {
        let Some(program) = self.tweaker.first() else {
            return false;
        };
        let program_ok = if program.contains(std::path::MAIN_SEPARATOR) {
            Path::new(program).is_file()
        } else {
            find_in_path(program).is_some()
        };
        let script_ok = self
            .tweaker
            .get(1)
            .filter(|arg| !arg.starts_with('-'))
            .map(|script| Path::new(script).is_file())
            .unwrap_or(true);
        program_ok && script_ok
    }
}

fn find_in_path(program: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

/// Polling cadence for external tool jobs.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunnerConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// How long a terminated tool may take to exit before it is killed.
    #[serde(default = "default_terminate_grace_ms")]
    pub terminate_grace_ms: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            terminate_grace_ms: default_terminate_grace_ms(),
        }
    }
}

impl RunnerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }
}

/// Remote print server uploads.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RelayConfig {
    #[serde(default = "default_relay_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_relay_timeout_secs(),
        }
    }
}

impl RelayConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Config {
    /// Reject settings the service cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.runner.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("runner.poll_interval_ms must be > 0".to_string()));
        }
        if self.relay.timeout_secs == 0 {
            return Err(ConfigError::Invalid("relay.timeout_secs must be > 0".to_string()));
        }
        if self.tools.tweaker.is_empty() {
            return Err(ConfigError::Invalid("tools.tweaker must name a program".to_string()));
        }
        if self.tools.allowed_extensions.is_empty() {
            return Err(ConfigError::Invalid("tools.allowed_extensions must not be empty".to_string()));
        }
        Ok(())
    }
}

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 2304 }
fn default_max_upload_bytes() -> usize { 100 * 1024 * 1024 }
fn default_uploads_dir() -> PathBuf { PathBuf::from("uploads") }
fn default_profiles_dir() -> PathBuf { PathBuf::from("profiles") }
fn default_profile() -> String { "profile_015mm_none.ini".to_string() }
fn default_tweaker() -> Vec<String> { vec!["python3".to_string(), "Tweaker-3/Tweaker.py".to_string()] }
fn default_slicer_candidates() -> Vec<PathBuf> { vec![PathBuf::from("/Slic3r/slic3r-dist/bin/prusa-slicer")] }
fn default_allowed_extensions() -> Vec<String> { vec!["stl".to_string(), "3mf".to_string(), "obj".to_string()] }
fn default_poll_interval_ms() -> u64 { 500 }
fn default_terminate_grace_ms() -> u64 { 5000 }
fn default_relay_timeout_secs() -> u64 { 5 }

/// Load configuration from a TOML file at the given path.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => match toml::from_str::<Config>(&contents) {
            Ok(config) => {
                config.validate()?;
                Ok(config)
            }
            Err(e) => {
                tracing::error!("Failed to parse config TOML: {}", e);
                Err(ConfigError::Toml(e))
            }
        },
        Err(e) => {
            tracing::error!("Failed to read config file '{}': {}", path.display(), e);
            Err(ConfigError::Io(e))
        }
    }
}
