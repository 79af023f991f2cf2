// SPDX-License-Identifier: MPL-2.0

use crate::config::{
    APP_ID, COMMENT_TIMEOUT_MS, DEFAULT_STORAGE_URL, LIKE_POINTS, PAGE_INCREMENT,
    RESUBSCRIBE_BASE_MS, RESUBSCRIBE_MAX_MS,
};
use crate::feed::{ExhaustionPolicy, PageMode};
use crate::goals::DayBoundary;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Persistent sync settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Posts added per page fetch
    pub page_increment: usize,
    pub page_mode: PageMode,
    pub exhaustion: ExhaustionPolicy,
    pub day_boundary: DayBoundary,
    pub comment_timeout_ms: u64,
    /// Points awarded to a post's author per like
    pub like_points: i64,
    pub resubscribe_base_ms: u64,
    pub resubscribe_max_ms: u64,
    /// Base URL of the hosted backend, used for public media URLs
    pub storage_url: String,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            page_increment: PAGE_INCREMENT,
            page_mode: PageMode::default(),
            exhaustion: ExhaustionPolicy::default(),
            day_boundary: DayBoundary::default(),
            comment_timeout_ms: COMMENT_TIMEOUT_MS,
            like_points: LIKE_POINTS,
            resubscribe_base_ms: RESUBSCRIBE_BASE_MS,
            resubscribe_max_ms: RESUBSCRIBE_MAX_MS,
            storage_url: DEFAULT_STORAGE_URL.to_string(),
        }
    }
}

impl SyncSettings {
    /// Get the settings file path (~/.config/io.github.ecoquest.Sync/settings.json)
    pub fn settings_path() -> Option<PathBuf> {
        dirs::config_dir().map(|mut p| {
            p.push(APP_ID);
            p.push("settings.json");
            p
        })
    }

    /// Load settings from disk, or return defaults if not found
    pub fn load() -> Self {
        match Self::settings_path() {
            Some(path) => Self::load_from(&path),
            None => Self::default(),
        }
    }

    pub fn load_from(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable settings");
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    /// Save settings to disk
    pub fn save(&self) -> Result<(), String> {
        let path = Self::settings_path().ok_or("Could not determine config directory")?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create config directory: {e}"))?;
        }

        let json = serde_json::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize settings: {e}"))?;

        std::fs::write(path, json).map_err(|e| format!("Failed to write settings: {e}"))?;

        Ok(())
    }

    pub fn comment_timeout(&self) -> Duration {
        Duration::from_millis(self.comment_timeout_ms)
    }

    /// Delay before resubscription attempt `attempt` (0-based): doubles
    /// from the base and is capped at the maximum.
    pub fn resubscribe_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
        let ms = self
            .resubscribe_base_ms
            .saturating_mul(factor)
            .min(self.resubscribe_max_ms);
        Duration::from_millis(ms)
    }
}
