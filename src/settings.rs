use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use crate::session::DEFAULT_RESULTS;

pub const SETTINGS_FILE: &str = "settings.json";

fn default_tenant() -> String {
    "default_tenant".to_string()
}

fn default_database() -> String {
    "default_database".to_string()
}

fn default_results() -> u32 {
    DEFAULT_RESULTS
}

// One Chroma server the app can talk to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionProfile {
    pub id: String,
    pub name: String,
    pub url: String,
    #[serde(default = "default_tenant")]
    pub tenant: String,
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

impl ConnectionProfile {
    pub fn local() -> Self {
        Self {
            id: "local".to_string(),
            name: "Local".to_string(),
            url: "http://localhost:8000".to_string(),
            tenant: default_tenant(),
            database: default_database(),
            auth_token: None,
        }
    }
}

// OpenAI-compatible embeddings endpoint, registered under embedding-function `id`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddingProviderSettings {
    pub id: String,
    pub base_url: String,
    pub model: String,
    /// Name of the environment variable holding the API key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
}

// App settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default)]
    pub profiles: Vec<ConnectionProfile>,
    #[serde(default)]
    pub active_profile_id: Option<String>,
    #[serde(default)]
    pub embedding_providers: Vec<EmbeddingProviderSettings>,
    #[serde(default = "default_results")]
    pub default_results: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            profiles: vec![ConnectionProfile::local()],
            active_profile_id: Some("local".to_string()),
            embedding_providers: Vec::new(),
            default_results: DEFAULT_RESULTS,
        }
    }
}

impl Settings {
    pub fn profile(&self, id: &str) -> Option<&ConnectionProfile> {
        self.profiles.iter().find(|p| p.id == id)
    }

    /// The active profile, falling back to the first one.
    pub fn active_profile(&self) -> Option<&ConnectionProfile> {
        self.active_profile_id
            .as_deref()
            .and_then(|id| self.profile(id))
            .or_else(|| self.profiles.first())
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for profile in &self.profiles {
            if profile.id.trim().is_empty() {
                bail!("Profile \"{}\" has an empty id", profile.name);
            }
            if !seen.insert(profile.id.as_str()) {
                bail!("Profile id \"{}\" is used more than once", profile.id);
            }
            url::Url::parse(&profile.url)
                .with_context(|| format!("Profile \"{}\" has an invalid URL", profile.id))?;
        }
        if let Some(active) = &self.active_profile_id {
            if self.profile(active).is_none() {
                bail!("Active profile \"{}\" does not exist", active);
            }
        }
        for provider in &self.embedding_providers {
            url::Url::parse(&provider.base_url).with_context(|| {
                format!("Embedding provider \"{}\" has an invalid URL", provider.id)
            })?;
        }
        if self.default_results == 0 {
            bail!("Default result count must be at least 1");
        }
        Ok(())
    }
}

// Load settings from disk, falling back to defaults
pub fn load_settings_from(path: &Path) -> Settings {
    if !path.exists() {
        return Settings::default();
    }
    let loaded = std::fs::read_to_string(path)
        .context("reading settings")
        .and_then(|content| serde_json::from_str::<Settings>(&content).context("parsing settings"))
        .and_then(|settings| settings.validate().map(|()| settings));
    match loaded {
        Ok(settings) => settings,
        Err(err) => {
            tracing::warn!(path = %path.display(), "ignoring settings file: {:#}", err);
            Settings::default()
        }
    }
}

// Save settings to disk
pub fn save_settings_to(path: &Path, settings: &Settings) -> Result<()> {
    settings.validate()?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = serde_json::to_string_pretty(settings)?;
    std::fs::write(path, content)?;
    Ok(())
}
