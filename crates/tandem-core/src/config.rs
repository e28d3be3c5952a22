//! Configuration management for Tandem
//!
//! Handles loading, saving, and managing configuration: the assistant CLI
//! to launch, PTY and agent session timings, storage location, and the
//! credential profiles sessions are started with.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tandem_process::EscalationPolicy;

use crate::error::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Assistant CLI settings
    #[serde(default)]
    pub cli: CliConfig,
    /// Terminal-style session settings
    #[serde(default)]
    pub pty: PtyConfig,
    /// Streaming agent session settings
    #[serde(default)]
    pub agent: AgentConfig,
    /// Session record storage
    #[serde(default)]
    pub storage: StorageConfig,
    /// Credential profiles
    #[serde(default)]
    pub profiles: Vec<CredentialProfile>,
    /// Id of the profile new sessions use
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_profile: Option<String>,
}

impl Config {
    /// Get the active credential profile, if one is configured
    pub fn active_profile(&self) -> Option<&CredentialProfile> {
        let id = self.active_profile.as_deref()?;
        self.profiles.iter().find(|p| p.id == id)
    }

    /// Get a profile by id
    pub fn get_profile(&self, id: &str) -> Option<&CredentialProfile> {
        self.profiles.iter().find(|p| p.id == id)
    }
}

/// Assistant CLI configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Program to launch (looked up on PATH)
    pub program: String,
    /// Extra arguments appended to every launch
    pub extra_args: Vec<String>,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            program: "claude".to_string(),
            extra_args: Vec::new(),
        }
    }
}

/// PTY session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PtyConfig {
    /// Shell to host the assistant in (falls back to $SHELL)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
    pub cols: u16,
    pub rows: u16,
    /// Delay between spawning the shell and typing the launch command
    pub launch_delay_ms: u64,
    /// Wait after the first interrupt of a graceful close
    pub first_interrupt_wait_ms: u64,
    /// Wait after the second interrupt, before force-killing
    pub second_interrupt_wait_ms: u64,
}

impl Default for PtyConfig {
    fn default() -> Self {
        Self {
            shell: None,
            cols: 120,
            rows: 32,
            launch_delay_ms: 500,
            first_interrupt_wait_ms: 500,
            second_interrupt_wait_ms: 1000,
        }
    }
}

impl PtyConfig {
    pub fn launch_delay(&self) -> Duration {
        Duration::from_millis(self.launch_delay_ms)
    }

    pub fn escalation_policy(&self) -> EscalationPolicy {
        EscalationPolicy {
            first_wait: Duration::from_millis(self.first_interrupt_wait_ms),
            second_wait: Duration::from_millis(self.second_interrupt_wait_ms),
        }
    }

    /// Resolve the shell: configured value, then $SHELL, then a platform default
    pub fn resolve_shell(&self) -> String {
        if let Some(shell) = self.shell.as_ref().filter(|s| !s.is_empty()) {
            return shell.clone();
        }
        #[cfg(windows)]
        {
            std::env::var("COMSPEC").unwrap_or_else(|_| "cmd.exe".to_string())
        }
        #[cfg(not(windows))]
        {
            std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
        }
    }
}

/// Agent session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Bound on waiting for a dispatch loop to finish during close
    pub close_timeout_ms: u64,
    /// Parent of per-session working directories when none is given
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sessions_root: Option<PathBuf>,
    /// Kind tag for sessions created without one
    pub default_kind: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            close_timeout_ms: 3000,
            sessions_root: None,
            default_kind: "chat".to_string(),
        }
    }
}

impl AgentConfig {
    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    pub fn sessions_root(&self) -> PathBuf {
        self.sessions_root.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .map(|p| p.join("tandem"))
                .unwrap_or_else(|| PathBuf::from(".tandem"))
                .join("workspaces")
        })
    }
}

/// Storage configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory of the JSON session store
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

impl StorageConfig {
    pub fn sessions_dir(&self) -> PathBuf {
        self.dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .map(|p| p.join("tandem"))
                .unwrap_or_else(|| PathBuf::from(".tandem"))
                .join("sessions")
        })
    }
}

/// Credentials and endpoint a session is started with
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialProfile {
    pub id: String,
    pub name: String,
    /// Endpoint override (ANTHROPIC_BASE_URL)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Environment variable to read the API key from
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    /// Additional environment for child processes
    pub env: HashMap<String, String>,
}

impl CredentialProfile {
    /// Get the API key, checking the environment variable if not set directly
    pub fn get_api_key(&self) -> Option<String> {
        if let Some(key) = self.api_key.as_ref().filter(|k| !k.is_empty()) {
            return Some(key.clone());
        }
        let env_name = self.api_key_env.as_ref()?;
        std::env::var(env_name).ok().filter(|k| !k.is_empty())
    }
}

/// Configuration manager for loading and saving config
pub struct ConfigManager {
    config_path: PathBuf,
    config: Config,
}

impl ConfigManager {
    /// Create a new config manager with default path
    pub fn new() -> Result<Self> {
        let config_path = Self::default_config_path()?;
        Self::with_path(config_path)
    }

    /// Create a config manager with a specific path
    pub fn with_path(config_path: PathBuf) -> Result<Self> {
        let config = if config_path.exists() {
            Self::load_from_path(&config_path)?
        } else {
            Config::default()
        };

        Ok(Self { config_path, config })
    }

    /// Get the default config path
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| Error::Config("Could not find config directory".to_string()))?;

        Ok(config_dir.join("tandem").join("config.toml"))
    }

    fn load_from_path(path: &Path) -> Result<Config> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Save the current configuration to disk
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Config(format!("Failed to create config dir: {}", e)))?;
        }

        let content = toml::to_string_pretty(&self.config)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(&self.config_path, content)
            .map_err(|e| Error::Config(format!("Failed to write config: {}", e)))?;

        Ok(())
    }

    /// Add or replace a profile
    pub fn set_profile(&mut self, profile: CredentialProfile) {
        self.config.profiles.retain(|p| p.id != profile.id);
        self.config.profiles.push(profile);
    }

    /// Select the profile new sessions use
    pub fn set_active_profile(&mut self, id: &str) -> Result<()> {
        if self.config.get_profile(id).is_none() {
            return Err(Error::Config(format!("Unknown profile: {}", id)));
        }
        self.config.active_profile = Some(id.to_string());
        Ok(())
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("config.toml"),
            config: Config::default(),
        }
    }
}
