use super::*;

use std::{
    env,
    time::{SystemTime, UNIX_EPOCH},
};

fn temp_root(label: &str) -> std::path::PathBuf {
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    env::temp_dir().join(format!("sync_core_{label}_{suffix}"))
}

#[test]
fn defaults_apply_without_file_or_env() {
    let settings = load_settings_file(Path::new("/definitely/not/here/sync.toml"));
    assert_eq!(settings, SyncSettings::default());
    assert_eq!(settings.fetch_timeout(), Duration::from_secs(30));
}

#[test]
fn file_values_override_defaults() {
    let root = temp_root("settings_file");
    fs::create_dir_all(&root).expect("temp root");
    let path = root.join("sync.toml");
    fs::write(
        &path,
        "cursor_database_url = \"sqlite::memory:\"\nfetch_timeout_ms = 250\nevent_capacity = \"16\"\n",
    )
    .expect("write settings");

    let settings = load_settings_file(&path);
    assert_eq!(settings.cursor_database_url, "sqlite::memory:");
    assert_eq!(settings.fetch_timeout_ms, 250);
    assert_eq!(settings.event_capacity, 16);
    assert_eq!(settings.outbox_capacity, 64);

    fs::remove_dir_all(root).expect("cleanup");
}

#[test]
fn env_overrides_win_and_bad_numbers_are_ignored() {
    let mut settings = SyncSettings::default();
    apply_env_overrides(&mut settings, |key| match key {
        "SYNC_CURSOR_DATABASE_URL" => Some("sqlite://./first.db".into()),
        "APP__CURSOR_DATABASE_URL" => Some("sqlite://./second.db".into()),
        "APP__FETCH_TIMEOUT_MS" => Some("not-a-number".into()),
        "APP__MESSAGE_PAGE_SIZE" => Some(" 10 ".into()),
        _ => None,
    });
    assert_eq!(settings.cursor_database_url, "sqlite://./second.db");
    assert_eq!(settings.fetch_timeout_ms, 30_000);
    assert_eq!(settings.message_page_size, 10);
}

#[test]
fn zero_timeout_is_clamped() {
    let settings = SyncSettings {
        fetch_timeout_ms: 0,
        ..SyncSettings::default()
    };
    assert_eq!(settings.fetch_timeout(), Duration::from_millis(1));
}

#[test]
fn cursor_store_url_accepts_plain_paths() {
    let url = |raw: &str| {
        SyncSettings {
            cursor_database_url: raw.into(),
            ..SyncSettings::default()
        }
        .cursor_store_url()
    };
    assert_eq!(url("./data/test.db"), "sqlite://./data/test.db");
    assert_eq!(url("sqlite:./data/test.db"), "sqlite://./data/test.db");
    assert_eq!(url(r"data\sync.db"), "sqlite://data/sync.db");
    assert_eq!(url("sqlite::memory:"), "sqlite::memory:");
    assert_eq!(url("   "), SyncSettings::default().cursor_database_url);
}
