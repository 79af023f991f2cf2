// SPDX-License-Identifier: MPL-2.0

/// Bumped whenever a table changes shape; must match the pragma below.
pub const SCHEMA_VERSION: i64 = 2;

/// SQL schema for the cache database
pub const SCHEMA: &str = r#"
-- Database version for migrations
PRAGMA user_version = 2;

-- posts: id-keyed, the full record as JSON
CREATE TABLE IF NOT EXISTS posts (
    id INTEGER PRIMARY KEY,
    author_id TEXT NOT NULL,
    created_at TEXT NOT NULL,
    post_json TEXT NOT NULL,
    fetched_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_posts_author ON posts(author_id);
CREATE INDEX IF NOT EXISTS idx_posts_fetched_at ON posts(fetched_at);

-- feed_items: display position of each post per feed
CREATE TABLE IF NOT EXISTS feed_items (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    feed_key TEXT NOT NULL,
    post_id INTEGER NOT NULL,
    position INTEGER NOT NULL,
    fetched_at INTEGER NOT NULL,
    UNIQUE(feed_key, post_id)
);

CREATE INDEX IF NOT EXISTS idx_feed_items_feed_key ON feed_items(feed_key, position);

-- feed_state: pagination position per feed
CREATE TABLE IF NOT EXISTS feed_state (
    feed_key TEXT PRIMARY KEY,
    requested_limit INTEGER NOT NULL DEFAULT 0,
    cursor TEXT,
    cursor_id INTEGER,
    exhausted INTEGER NOT NULL DEFAULT 0,
    last_refresh_at INTEGER
);
"#;
