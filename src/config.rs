// SPDX-License-Identifier: MPL-2.0

pub const APP_ID: &str = "io.github.ecoquest.Sync";
pub const APP_NAME: &str = "EcoQuest Sync";

/// Rows added to the requested limit on every page fetch.
pub const PAGE_INCREMENT: usize = 4;

/// Storage bucket holding post media.
pub const MEDIA_BUCKET: &str = "uploads";
pub const POST_MEDIA_FOLDER: &str = "postImages";

pub const DEFAULT_STORAGE_URL: &str = "https://ecoquest.supabase.co";

pub const LIKE_POINTS: i64 = 1;
pub const COMMENT_TIMEOUT_MS: u64 = 15_000;

pub const RESUBSCRIBE_BASE_MS: u64 = 500;
pub const RESUBSCRIBE_MAX_MS: u64 = 30_000;
/// Attempts before a dropped change stream is reported as lost.
pub const RESUBSCRIBE_MAX_ATTEMPTS: u32 = 8;

/// Feed snapshots older than this are dropped from the cache.
pub const CACHE_MAX_AGE_SECS: i64 = 7 * 24 * 60 * 60;
