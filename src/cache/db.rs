// SPDX-License-Identifier: MPL-2.0

use crate::cache::CacheError;
use crate::cache::schema::{SCHEMA, SCHEMA_VERSION};
use crate::model::UserId;
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// Handle to the cache database for a specific user
#[derive(Clone)]
pub struct CacheDb {
    conn: Arc<Mutex<Connection>>,
}

impl CacheDb {
    /// Open or create cache database for user
    /// Path: ~/.local/share/ecoquest-sync/{user_id}/cache.db
    pub fn open(user: &UserId) -> Result<Self, CacheError> {
        let path = Self::cache_path(user)?;
        Self::open_at(&path)
    }

    pub fn open_at(path: &Path) -> Result<Self, CacheError> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| CacheError::Path(format!("failed to create cache dir: {}", e)))?;
        }

        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// A throwaway cache, for tests and one-shot tools
    pub fn open_in_memory() -> Result<Self, CacheError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, CacheError> {
        Self::migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run schema migrations
    fn migrate(conn: &Connection) -> Result<(), CacheError> {
        let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if (1..SCHEMA_VERSION).contains(&version) {
            // Saved positions are cheap to rebuild.
            conn.execute_batch("DROP TABLE IF EXISTS feed_state;")?;
        }
        // Execute the schema (all CREATE IF NOT EXISTS)
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    /// Get XDG data directory for cache
    fn cache_path(user: &UserId) -> Result<PathBuf, CacheError> {
        let data_dir = dirs::data_dir()
            .ok_or_else(|| CacheError::Path("could not find data directory".to_string()))?;

        // Keep the id usable as a single path component
        let safe_id: String = user
            .as_str()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();

        Ok(data_dir.join("ecoquest-sync").join(safe_id).join("cache.db"))
    }

    /// Access connection for operations
    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Get current unix timestamp
    pub fn now() -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }

    /// Cleanup old entries:
    /// - Feed items and state: older than `max_age_secs` (feed order goes stale)
    /// - Posts: no longer referenced by any feed
    pub fn cleanup_stale(&self, max_age_secs: i64) -> Result<(), CacheError> {
        let conn = self.conn();
        let cutoff = Self::now() - max_age_secs;

        conn.execute("DELETE FROM feed_items WHERE fetched_at < ?", [cutoff])?;
        conn.execute(
            "DELETE FROM feed_state WHERE last_refresh_at < ?",
            [cutoff],
        )?;
        conn.execute(
            "DELETE FROM posts WHERE id NOT IN (SELECT post_id FROM feed_items)",
            (),
        )?;

        Ok(())
    }
}
