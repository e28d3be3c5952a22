//! Child process environment and credential profiles

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::{Config, CredentialProfile};

/// Builds the environment a session child process is launched with.
///
/// Opaque to the registries: they hand over the profile and use the map.
pub trait EnvironmentBuilder: Send + Sync {
    fn build_env(&self, profile: Option<&CredentialProfile>) -> HashMap<String, String>;
}

/// Source of the currently active credential profile
pub trait ProfileSource: Send + Sync {
    fn active_profile(&self) -> Option<CredentialProfile>;
}

/// Inherits the current process environment and applies the profile on top
#[derive(Debug, Default, Clone)]
pub struct ProfileEnvironment {
    /// Variables removed from the inherited environment
    strip: Vec<String>,
}

impl ProfileEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Do not pass `name` through from the parent environment
    pub fn without(mut self, name: impl Into<String>) -> Self {
        self.strip.push(name.into());
        self
    }
}

impl EnvironmentBuilder for ProfileEnvironment {
    fn build_env(&self, profile: Option<&CredentialProfile>) -> HashMap<String, String> {
        let mut env: HashMap<String, String> = std::env::vars()
            .filter(|(k, _)| !self.strip.iter().any(|s| s == k))
            .collect();

        if let Some(profile) = profile {
            if let Some(key) = profile.get_api_key() {
                env.insert("ANTHROPIC_API_KEY".to_string(), key);
            }
            if let Some(url) = profile.base_url.as_ref().filter(|u| !u.is_empty()) {
                env.insert("ANTHROPIC_BASE_URL".to_string(), url.clone());
            }
            for (k, v) in &profile.env {
                env.insert(k.clone(), v.clone());
            }
        }

        env
    }
}

/// Profile source backed by configuration, switchable at runtime
#[derive(Debug, Default, Clone)]
pub struct StaticProfiles {
    active: Arc<RwLock<Option<CredentialProfile>>>,
}

impl StaticProfiles {
    pub fn new(active: Option<CredentialProfile>) -> Self {
        Self {
            active: Arc::new(RwLock::new(active)),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.active_profile().cloned())
    }

    /// Replace the active profile
    pub fn set_active(&self, profile: Option<CredentialProfile>) {
        *self.active.write() = profile;
    }
}

impl ProfileSource for StaticProfiles {
    fn active_profile(&self) -> Option<CredentialProfile> {
        self.active.read().clone()
    }
}
