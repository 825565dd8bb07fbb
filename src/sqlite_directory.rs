// ABOUTME: SQLite-backed bot directory storing each bot's default-tags JSON blob.
// ABOUTME: The connection sits behind a mutex; queries run on the blocking pool.

use anyhow::{Context, Result};
use async_trait::async_trait;
use opera_core::traits::Directory;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Arc, Mutex};

#[derive(Clone)]
pub struct SqliteDirectory {
    db: Arc<Mutex<Connection>>,
}

impl SqliteDirectory {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS bot_tags (
                bot_id TEXT PRIMARY KEY,
                tags TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let conn = db.lock().unwrap_or_else(|e| e.into_inner());
            f(&conn)
        })
        .await
        .context("directory query panicked")?
    }
}

#[async_trait]
impl Directory for SqliteDirectory {
    async fn default_tags(&self, bot_id: &str) -> Result<Option<String>> {
        let bot_id = bot_id.to_string();
        self.with_conn(move |conn| {
            let row = conn.query_row(
                "SELECT tags FROM bot_tags WHERE bot_id = ?1",
                params![bot_id],
                |row| row.get::<_, String>(0),
            );
            match row {
                Ok(tags) => Ok(Some(tags)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn set_default_tags(&self, bot_id: &str, tags: &str) -> Result<()> {
        let bot_id = bot_id.to_string();
        let tags = tags.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO bot_tags (bot_id, tags, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(bot_id) DO UPDATE SET tags = excluded.tags, updated_at = excluded.updated_at",
                params![bot_id, tags, chrono::Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
        .await
    }
}
