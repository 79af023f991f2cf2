// SPDX-License-Identifier: MPL-2.0

//! SQLite snapshot of the feeds, used to show something before the first
//! network fetch finishes.

mod db;
mod feeds;
mod posts;
mod schema;

pub use db::CacheDb;
pub use feeds::{FeedCache, FeedState};
pub use posts::PostCache;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("database path error: {0}")]
    Path(String),
}
