use std::{fs, path::Path, time::Duration};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use url::Url;

pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 10 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub api_base_url: String,
    /// Realtime endpoint; derived from `api_base_url` when unset.
    pub push_url: Option<String>,
    pub cache_database_url: String,
    pub page_size: u32,
    pub typing_idle_ms: u64,
    pub max_upload_bytes: u64,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
    pub call_base_url: String,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            api_base_url: "http://127.0.0.1:8080".into(),
            push_url: None,
            cache_database_url: "sqlite://./data/cache.db".into(),
            page_size: DEFAULT_PAGE_SIZE,
            typing_idle_ms: 3_000,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            reconnect_initial_ms: 500,
            reconnect_max_ms: 30_000,
            call_base_url: "https://call.example.com/index.html".into(),
        }
    }
}

impl ClientSettings {
    pub fn typing_idle(&self) -> Duration {
        Duration::from_millis(self.typing_idle_ms)
    }

    pub fn reconnect_initial(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_ms.max(1))
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms.max(self.reconnect_initial_ms.max(1)))
    }

    /// `http(s)://host/...` becomes `ws(s)://host/.../messaging` unless a push
    /// url is configured explicitly.
    pub fn resolved_push_url(&self) -> Result<String> {
        if let Some(url) = &self.push_url {
            return Ok(url.clone());
        }
        let base = self.api_base_url.trim_end_matches('/');
        let ws_base = if base.starts_with("https://") {
            base.replacen("https://", "wss://", 1)
        } else if base.starts_with("http://") {
            base.replacen("http://", "ws://", 1)
        } else {
            return Err(anyhow!("api_base_url must start with http:// or https://"));
        };
        Ok(format!("{ws_base}/messaging"))
    }

    fn validate(&self) -> Result<()> {
        Url::parse(&self.api_base_url)
            .with_context(|| format!("invalid api_base_url '{}'", self.api_base_url))?;
        if self.page_size == 0 {
            return Err(anyhow!("page_size must be positive"));
        }
        Ok(())
    }
}

/// Defaults, then `client.toml` (if present), then environment variables.
pub fn load_settings() -> Result<ClientSettings> {
    let mut settings = load_settings_file(Path::new("client.toml"))?;
    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    settings.cache_database_url = prepare_database_url(&settings.cache_database_url);
    settings.validate()?;
    Ok(settings)
}

pub fn load_settings_file(path: &Path) -> Result<ClientSettings> {
    match fs::read_to_string(path) {
        Ok(raw) => toml::from_str::<ClientSettings>(&raw)
            .with_context(|| format!("failed to parse settings file '{}'", path.display())),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(ClientSettings::default()),
        Err(err) => Err(err)
            .with_context(|| format!("failed to read settings file '{}'", path.display())),
    }
}

pub fn apply_env_overrides(settings: &mut ClientSettings, lookup: impl Fn(&str) -> Option<String>) {
    let first = |keys: &[&str]| keys.iter().find_map(|key| lookup(*key));

    if let Some(v) = first(&["APP__API_BASE_URL", "PULSE_API_URL"]) {
        settings.api_base_url = v;
    }
    if let Some(v) = first(&["APP__PUSH_URL", "PULSE_PUSH_URL"]) {
        settings.push_url = Some(v);
    }
    if let Some(v) = first(&["APP__CACHE_DATABASE_URL", "PULSE_CACHE_DB"]) {
        settings.cache_database_url = v;
    }
    if let Some(v) = first(&["APP__PAGE_SIZE"]).and_then(|v| v.parse().ok()) {
        settings.page_size = v;
    }
    if let Some(v) = first(&["APP__TYPING_IDLE_MS"]).and_then(|v| v.parse().ok()) {
        settings.typing_idle_ms = v;
    }
    if let Some(v) = first(&["APP__MAX_UPLOAD_BYTES"]).and_then(|v| v.parse().ok()) {
        settings.max_upload_bytes = v;
    }
    if let Some(v) = first(&["APP__RECONNECT_INITIAL_MS"]).and_then(|v| v.parse().ok()) {
        settings.reconnect_initial_ms = v;
    }
    if let Some(v) = first(&["APP__RECONNECT_MAX_MS"]).and_then(|v| v.parse().ok()) {
        settings.reconnect_max_ms = v;
    }
    if let Some(v) = first(&["APP__CALL_BASE_URL"]) {
        settings.call_base_url = v;
    }
}

/// Accepts plain file paths as well as sqlite urls.
pub fn prepare_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return ClientSettings::default().cache_database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:")
        || raw_database_url.starts_with("sqlite://")
        || raw_database_url.contains("://")
    {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        return format!("sqlite://{}", path.replace('\\', "/"));
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}
