use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Context};
use tracing::warn;

pub const SETTINGS_FILE: &str = "tiktop.toml";
pub const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.5-flash-image";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub gemini_api_key: Option<String>,
    pub gemini_model: String,
    pub gemini_base_url: String,
    pub supabase_url: Option<String>,
    pub supabase_anon_key: Option<String>,
    pub data_dir: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            gemini_api_key: None,
            gemini_model: DEFAULT_GEMINI_MODEL.into(),
            gemini_base_url: DEFAULT_GEMINI_BASE_URL.into(),
            supabase_url: None,
            supabase_anon_key: None,
            data_dir: None,
        }
    }
}

impl Settings {
    pub fn auth_configured(&self) -> bool {
        self.supabase_url.is_some() && self.supabase_anon_key.is_some()
    }

    pub fn resolve_data_dir(&self) -> anyhow::Result<PathBuf> {
        if let Some(dir) = &self.data_dir {
            return Ok(dir.clone());
        }
        let base = dirs::data_local_dir()
            .ok_or_else(|| anyhow!("unable to resolve local app data dir"))?;
        Ok(base.join("tiktop"))
    }
}

/// Defaults, then `tiktop.toml` in the working directory, then environment.
pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string(SETTINGS_FILE) {
        if let Err(error) = apply_file(&mut settings, &raw) {
            warn!(file = SETTINGS_FILE, %error, "ignoring unreadable settings file");
        }
    }

    apply_env(&mut settings, |key| std::env::var(key).ok());

    if !settings.auth_configured() {
        warn!("Supabase URL or anon key is missing; sign-in is unavailable until both are set");
    }
    settings
}

pub fn load_settings_from(path: &Path) -> anyhow::Result<Settings> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read settings file '{}'", path.display()))?;
    let mut settings = Settings::default();
    apply_file(&mut settings, &raw)?;
    apply_env(&mut settings, |key| std::env::var(key).ok());
    Ok(settings)
}

fn apply_file(settings: &mut Settings, raw: &str) -> anyhow::Result<()> {
    let file_cfg = toml::from_str::<HashMap<String, String>>(raw)
        .context("settings file must be a flat table of string values")?;

    if let Some(v) = non_empty(file_cfg.get("gemini_api_key").cloned()) {
        settings.gemini_api_key = Some(v);
    }
    if let Some(v) = non_empty(file_cfg.get("gemini_model").cloned()) {
        settings.gemini_model = v;
    }
    if let Some(v) = non_empty(file_cfg.get("gemini_base_url").cloned()) {
        settings.gemini_base_url = v;
    }
    if let Some(v) = non_empty(file_cfg.get("supabase_url").cloned()) {
        settings.supabase_url = Some(v);
    }
    if let Some(v) = non_empty(file_cfg.get("supabase_anon_key").cloned()) {
        settings.supabase_anon_key = Some(v);
    }
    if let Some(v) = non_empty(file_cfg.get("data_dir").cloned()) {
        settings.data_dir = Some(PathBuf::from(v));
    }
    Ok(())
}

fn apply_env(settings: &mut Settings, var: impl Fn(&str) -> Option<String>) {
    let var = |key: &str| non_empty(var(key));

    if let Some(v) = var("GEMINI_API_KEY") {
        settings.gemini_api_key = Some(v);
    }
    if let Some(v) = var("APP__GEMINI_API_KEY") {
        settings.gemini_api_key = Some(v);
    }

    if let Some(v) = var("GEMINI_MODEL") {
        settings.gemini_model = v;
    }
    if let Some(v) = var("GEMINI_BASE_URL") {
        settings.gemini_base_url = v;
    }

    if let Some(v) = var("VITE_SUPABASE_URL") {
        settings.supabase_url = Some(v);
    }
    if let Some(v) = var("SUPABASE_URL") {
        settings.supabase_url = Some(v);
    }

    if let Some(v) = var("VITE_SUPABASE_ANON_KEY") {
        settings.supabase_anon_key = Some(v);
    }
    if let Some(v) = var("SUPABASE_ANON_KEY") {
        settings.supabase_anon_key = Some(v);
    }

    if let Some(v) = var("APP__DATA_DIR") {
        settings.data_dir = Some(PathBuf::from(v));
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn default_download_dir() -> PathBuf {
    dirs::download_dir()
        .or_else(dirs::desktop_dir)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
