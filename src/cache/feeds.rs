// SPDX-License-Identifier: MPL-2.0

use crate::cache::{CacheDb, CacheError, PostCache};
use crate::feed::PageCursor;
use crate::model::{Post, PostId};
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};

/// Saved pagination position of a feed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedState {
    /// Limit requested by the last growing-limit fetch
    pub requested_limit: usize,
    /// Oldest post fetched in cursor mode
    pub cursor: Option<PageCursor>,
    pub exhausted: bool,
    /// When we last saved this feed
    pub last_refresh_at: Option<i64>,
}

/// Cache operations for feeds
pub struct FeedCache<'a> {
    db: &'a CacheDb,
}

impl<'a> FeedCache<'a> {
    pub fn new(db: &'a CacheDb) -> Self {
        Self { db }
    }

    /// Replace the stored snapshot of a feed with `posts` in display order
    pub fn store_snapshot(&self, feed_key: &str, posts: &[Post]) -> Result<(), CacheError> {
        let mut conn = self.db.conn();
        let tx = conn.transaction()?;
        let now = CacheDb::now();

        PostCache::store_in(&tx, posts, now)?;
        tx.execute("DELETE FROM feed_items WHERE feed_key = ?", [feed_key])?;
        for (position, post) in posts.iter().enumerate() {
            tx.execute(
                r#"
                INSERT INTO feed_items (feed_key, post_id, position, fetched_at)
                VALUES (?1, ?2, ?3, ?4)
                "#,
                params![feed_key, post.id.0, position as i64, now],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Get the cached posts of a feed in display order
    pub fn load(&self, feed_key: &str) -> Result<Vec<Post>, CacheError> {
        let conn = self.db.conn();

        let mut stmt = conn.prepare(
            r#"
            SELECT p.post_json
            FROM feed_items fi
            JOIN posts p ON fi.post_id = p.id
            WHERE fi.feed_key = ?
            ORDER BY fi.position ASC
            "#,
        )?;

        let mut rows = stmt.query([feed_key])?;
        let mut posts = Vec::new();

        while let Some(row) = rows.next()? {
            let json: String = row.get(0)?;
            posts.push(serde_json::from_str(&json)?);
        }

        Ok(posts)
    }

    /// Get feed state (limit, cursor, exhaustion)
    pub fn get_state(&self, feed_key: &str) -> Result<Option<FeedState>, CacheError> {
        let conn = self.db.conn();

        let state = conn
            .query_row(
                r#"
                SELECT requested_limit, cursor, cursor_id, exhausted, last_refresh_at
                FROM feed_state
                WHERE feed_key = ?
                "#,
                [feed_key],
                |row| {
                    let at: Option<String> = row.get(1)?;
                    let id: Option<i64> = row.get(2)?;
                    let cursor = match (at.and_then(|c| c.parse::<DateTime<Utc>>().ok()), id) {
                        (Some(created_at), Some(id)) => Some(PageCursor {
                            created_at,
                            id: PostId(id),
                        }),
                        _ => None,
                    };
                    Ok(FeedState {
                        requested_limit: row.get::<_, i64>(0)?.max(0) as usize,
                        cursor,
                        exhausted: row.get::<_, i32>(3)? != 0,
                        last_refresh_at: row.get(4)?,
                    })
                },
            )
            .optional()?;

        Ok(state)
    }

    /// Update feed state
    pub fn set_state(&self, feed_key: &str, state: &FeedState) -> Result<(), CacheError> {
        let conn = self.db.conn();

        conn.execute(
            r#"
            INSERT INTO feed_state
                (feed_key, requested_limit, cursor, cursor_id, exhausted, last_refresh_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(feed_key) DO UPDATE SET
                requested_limit = excluded.requested_limit,
                cursor = excluded.cursor,
                cursor_id = excluded.cursor_id,
                exhausted = excluded.exhausted,
                last_refresh_at = excluded.last_refresh_at
            "#,
            params![
                feed_key,
                state.requested_limit as i64,
                state.cursor.map(|c| c.created_at.to_rfc3339()),
                state.cursor.map(|c| c.id.0),
                state.exhausted as i32,
                state.last_refresh_at.unwrap_or_else(CacheDb::now),
            ],
        )?;

        Ok(())
    }

    /// Clear a feed (on sign-out or full refresh)
    pub fn clear_feed(&self, feed_key: &str) -> Result<(), CacheError> {
        let conn = self.db.conn();

        conn.execute("DELETE FROM feed_items WHERE feed_key = ?", [feed_key])?;
        conn.execute("DELETE FROM feed_state WHERE feed_key = ?", [feed_key])?;

        Ok(())
    }

    /// Get count of cached items for feed
    pub fn count(&self, feed_key: &str) -> Result<usize, CacheError> {
        let conn = self.db.conn();

        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM feed_items WHERE feed_key = ?",
            [feed_key],
            |row| row.get(0),
        )?;

        Ok(count as usize)
    }

    /// Check if the feed was saved recently
    pub fn is_fresh(&self, feed_key: &str, max_age_secs: i64) -> bool {
        if let Ok(Some(state)) = self.get_state(feed_key)
            && let Some(last_refresh) = state.last_refresh_at
        {
            return (CacheDb::now() - last_refresh) < max_age_secs;
        }
        false
    }
}
