use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use shared::protocol::ChangeCursor;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use tokio::sync::Mutex;

use crate::CursorStore;

pub const NOTIFICATION_CURSOR_SCOPE: &str = "notifications";

#[derive(Clone)]
pub struct SqliteCursorStore {
    pool: Pool<Sqlite>,
    scope: String,
}

impl SqliteCursorStore {
    pub async fn new(database_url: &str) -> Result<Self> {
        Self::with_scope(database_url, NOTIFICATION_CURSOR_SCOPE).await
    }

    pub async fn with_scope(database_url: &str, scope: impl Into<String>) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // One connection: an in-memory database is private to its connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect_options)
            .await?;
        let store = Self {
            pool,
            scope: scope.into(),
        };
        store.ensure_cursor_table().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    async fn ensure_cursor_table(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_cursor (
                scope      TEXT PRIMARY KEY,
                token      BLOB NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure sync_cursor table exists")?;
        Ok(())
    }
}

#[async_trait]
impl CursorStore for SqliteCursorStore {
    async fn load_cursor(&self) -> Result<Option<ChangeCursor>> {
        let row = sqlx::query("SELECT token FROM sync_cursor WHERE scope = ?")
            .bind(&self.scope)
            .fetch_optional(&self.pool)
            .await
            .context("failed to load change cursor")?;
        Ok(row.map(|r| ChangeCursor(r.get::<Vec<u8>, _>(0))))
    }

    async fn save_cursor(&self, cursor: &ChangeCursor) -> Result<()> {
        sqlx::query(
            "INSERT INTO sync_cursor (scope, token, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(scope) DO UPDATE SET token = excluded.token, updated_at = excluded.updated_at",
        )
        .bind(&self.scope)
        .bind(cursor.as_bytes())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .context("failed to save change cursor")?;
        Ok(())
    }

    async fn clear_cursor(&self) -> Result<()> {
        sqlx::query("DELETE FROM sync_cursor WHERE scope = ?")
            .bind(&self.scope)
            .execute(&self.pool)
            .await
            .context("failed to clear change cursor")?;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryCursorStore {
    cursor: Mutex<Option<ChangeCursor>>,
}

impl MemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cursor(cursor: ChangeCursor) -> Self {
        Self {
            cursor: Mutex::new(Some(cursor)),
        }
    }
}

#[async_trait]
impl CursorStore for MemoryCursorStore {
    async fn load_cursor(&self) -> Result<Option<ChangeCursor>> {
        Ok(self.cursor.lock().await.clone())
    }

    async fn save_cursor(&self, cursor: &ChangeCursor) -> Result<()> {
        *self.cursor.lock().await = Some(cursor.clone());
        Ok(())
    }

    async fn clear_cursor(&self) -> Result<()> {
        *self.cursor.lock().await = None;
        Ok(())
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/cursor_tests.rs"]
mod tests;
