// SPDX-License-Identifier: MPL-2.0

use crate::cache::{CacheDb, CacheError};
use crate::model::{Post, PostId};
use rusqlite::{OptionalExtension, Transaction, params};

/// Cache operations for posts
pub struct PostCache<'a> {
    db: &'a CacheDb,
}

impl<'a> PostCache<'a> {
    pub fn new(db: &'a CacheDb) -> Self {
        Self { db }
    }

    /// Store multiple posts in a transaction
    pub fn store_batch(&self, posts: &[Post]) -> Result<(), CacheError> {
        let mut conn = self.db.conn();
        let tx = conn.transaction()?;
        Self::store_in(&tx, posts, CacheDb::now())?;
        tx.commit()?;
        Ok(())
    }

    /// Upsert posts inside an open transaction
    pub(crate) fn store_in(tx: &Transaction<'_>, posts: &[Post], now: i64) -> Result<(), CacheError> {
        for post in posts {
            let json = serde_json::to_string(post)?;
            tx.execute(
                r#"
                INSERT INTO posts (id, author_id, created_at, post_json, fetched_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(id) DO UPDATE SET
                    author_id = excluded.author_id,
                    created_at = excluded.created_at,
                    post_json = excluded.post_json,
                    fetched_at = excluded.fetched_at
                "#,
                params![
                    post.id.0,
                    post.author_id.as_str(),
                    post.created_at.to_rfc3339(),
                    json,
                    now,
                ],
            )?;
        }
        Ok(())
    }

    /// Get a cached post by id
    pub fn get(&self, id: PostId) -> Result<Option<Post>, CacheError> {
        let conn = self.db.conn();
        let json: Option<String> = conn
            .query_row("SELECT post_json FROM posts WHERE id = ?", [id.0], |row| {
                row.get(0)
            })
            .optional()?;
        json.map(|j| serde_json::from_str(&j))
            .transpose()
            .map_err(CacheError::from)
    }

    pub fn remove(&self, id: PostId) -> Result<(), CacheError> {
        let conn = self.db.conn();
        conn.execute("DELETE FROM feed_items WHERE post_id = ?", [id.0])?;
        conn.execute("DELETE FROM posts WHERE id = ?", [id.0])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Like, UserId, UserProfile};
    use chrono::{TimeZone, Utc};

    fn post(id: i64) -> Post {
        Post {
            id: PostId(id),
            author_id: UserId::new("u-1"),
            body: "<p>hello</p>".into(),
            media: Some(crate::model::MediaRef::from_path("/postImages/1.png")),
            created_at: Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap(),
            likes: vec![Like::new(UserId::new("u-2"), PostId(id))],
            comment_count: 3,
            author: Some(UserProfile {
                id: UserId::new("u-1"),
                name: Some("Ada".into()),
                image: None,
            }),
        }
    }

    #[test]
    fn test_store_and_get() {
        let db = CacheDb::open_in_memory().unwrap();
        let cache = PostCache::new(&db);
        cache.store_batch(&[post(1), post(2)]).unwrap();

        assert_eq!(cache.get(PostId(1)).unwrap(), Some(post(1)));
        assert_eq!(cache.get(PostId(9)).unwrap(), None);

        cache.remove(PostId(1)).unwrap();
        assert_eq!(cache.get(PostId(1)).unwrap(), None);
    }
}
