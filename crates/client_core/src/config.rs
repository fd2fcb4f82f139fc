use std::{fs, path::Path};

use anyhow::{Context, Result};
use serde::Deserialize;

pub const DEFAULT_CONFIG_FILE: &str = "client.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub api_base_url: String,
    pub user_id: Option<i64>,
    /// Text of the synthetic assistant turn shown when a send fails.
    pub error_reply: String,
    pub event_buffer: usize,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8000".into(),
            user_id: None,
            error_reply: "An error occurred while processing your request.".into(),
            event_buffer: 1024,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    api_base_url: Option<String>,
    user_id: Option<i64>,
    error_reply: Option<String>,
    event_buffer: Option<usize>,
}

/// Defaults, then `client.toml` in the working directory, then environment.
pub fn load_settings() -> ClientSettings {
    let path = Path::new(DEFAULT_CONFIG_FILE);
    let mut settings = ClientSettings::default();
    if path.exists() {
        if let Err(err) = apply_file(&mut settings, path) {
            tracing::warn!(error = %err, "ignoring unreadable client config");
        }
    }
    apply_env(&mut settings, |key| std::env::var(key).ok());
    settings
}

/// Like [`load_settings`] but with an explicit config file that must parse.
pub fn load_settings_from(path: &Path) -> Result<ClientSettings> {
    let mut settings = ClientSettings::default();
    apply_file(&mut settings, path)?;
    apply_env(&mut settings, |key| std::env::var(key).ok());
    Ok(settings)
}

pub fn apply_file(settings: &mut ClientSettings, path: &Path) -> Result<()> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file '{}'", path.display()))?;
    apply_toml(settings, &raw)
        .with_context(|| format!("failed to parse config file '{}'", path.display()))
}

pub fn apply_toml(settings: &mut ClientSettings, raw: &str) -> Result<()> {
    let file_cfg: FileSettings = toml::from_str(raw)?;
    if let Some(v) = file_cfg.api_base_url {
        settings.api_base_url = v;
    }
    if let Some(v) = file_cfg.user_id {
        settings.user_id = Some(v);
    }
    if let Some(v) = file_cfg.error_reply {
        settings.error_reply = v;
    }
    if let Some(v) = file_cfg.event_buffer {
        settings.event_buffer = v.max(1);
    }
    Ok(())
}

pub fn apply_env(settings: &mut ClientSettings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("CHAT_API_BASE_URL") {
        settings.api_base_url = v;
    }
    if let Some(v) = lookup("APP__API_BASE_URL") {
        settings.api_base_url = v;
    }

    if let Some(v) = lookup("CHAT_USER_ID") {
        if let Ok(parsed) = v.parse::<i64>() {
            settings.user_id = Some(parsed);
        }
    }
    if let Some(v) = lookup("APP__USER_ID") {
        if let Ok(parsed) = v.parse::<i64>() {
            settings.user_id = Some(parsed);
        }
    }

    if let Some(v) = lookup("APP__ERROR_REPLY") {
        settings.error_reply = v;
    }

    settings.api_base_url = normalize_base_url(&settings.api_base_url);
}

pub fn normalize_base_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return ClientSettings::default().api_base_url;
    }
    if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    }
}
