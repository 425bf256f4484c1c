use std::{collections::HashMap, fs, path::Path, time::Duration};

use serde::Deserialize;

pub const DEFAULT_SETTINGS_FILE: &str = "sync.toml";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SyncSettings {
    pub cursor_database_url: String,
    pub fetch_timeout_ms: u64,
    pub event_capacity: usize,
    pub outbox_capacity: usize,
    pub message_page_size: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            cursor_database_url: "sqlite://./data/sync.db".into(),
            fetch_timeout_ms: 30_000,
            event_capacity: 1024,
            outbox_capacity: 64,
            message_page_size: 50,
        }
    }
}

impl SyncSettings {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms.max(1))
    }

    /// The cursor database as an sqlx url; a bare path is read as a sqlite file.
    pub fn cursor_store_url(&self) -> String {
        let raw = self.cursor_database_url.trim();
        if raw.is_empty() {
            return Self::default().cursor_database_url;
        }
        if raw.starts_with("sqlite::memory:") || raw.contains("://") {
            return raw.to_string();
        }
        let path = raw.strip_prefix("sqlite:").unwrap_or(raw);
        format!("sqlite://{}", path.replace('\\', "/"))
    }
}

pub fn load_settings() -> SyncSettings {
    let mut settings = load_settings_file(Path::new(DEFAULT_SETTINGS_FILE));
    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    settings
}

/// Reads flat `key = "value"` pairs; a missing or malformed file yields defaults.
pub fn load_settings_file(path: &Path) -> SyncSettings {
    let mut settings = SyncSettings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, toml::Value>>(&raw) {
            let text = |key: &str| file_cfg.get(key).map(value_to_string);
            if let Some(v) = text("cursor_database_url") {
                settings.cursor_database_url = v;
            }
            set_parsed(&mut settings.fetch_timeout_ms, text("fetch_timeout_ms"));
            set_parsed(&mut settings.event_capacity, text("event_capacity"));
            set_parsed(&mut settings.outbox_capacity, text("outbox_capacity"));
            set_parsed(&mut settings.message_page_size, text("message_page_size"));
        }
    }

    settings
}

pub fn apply_env_overrides(settings: &mut SyncSettings, var: impl Fn(&str) -> Option<String>) {
    if let Some(v) = var("SYNC_CURSOR_DATABASE_URL") {
        settings.cursor_database_url = v;
    }
    if let Some(v) = var("APP__CURSOR_DATABASE_URL") {
        settings.cursor_database_url = v;
    }
    set_parsed(&mut settings.fetch_timeout_ms, var("APP__FETCH_TIMEOUT_MS"));
    set_parsed(&mut settings.event_capacity, var("APP__EVENT_CAPACITY"));
    set_parsed(&mut settings.outbox_capacity, var("APP__OUTBOX_CAPACITY"));
    set_parsed(&mut settings.message_page_size, var("APP__MESSAGE_PAGE_SIZE"));
}

fn set_parsed<T: std::str::FromStr>(slot: &mut T, raw: Option<String>) {
    if let Some(parsed) = raw.and_then(|v| v.trim().parse::<T>().ok()) {
        *slot = parsed;
    }
}

fn value_to_string(value: &toml::Value) -> String {
    match value {
        toml::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
