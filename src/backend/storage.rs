// SPDX-License-Identifier: MPL-2.0

use crate::backend::BackendError;
use crate::config::MEDIA_BUCKET;
use crate::model::MediaKind;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use url::Url;

/// File/object storage for post media.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Store `bytes` at `path` and return the stored path.
    async fn upload(
        &self,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, BackendError>;

    fn public_url(&self, stored_path: &str) -> Result<Url, BackendError>;
}

/// Storage path for a fresh upload: `/{folder}/{unix_millis}.{ext}`.
pub fn media_path(folder: &str, kind: MediaKind, now: DateTime<Utc>) -> String {
    format!("/{}/{}.{}", folder, now.timestamp_millis(), kind.extension())
}

/// Public URL of a stored object:
/// `{base}/storage/v1/object/public/{bucket}/{path}`.
pub fn public_media_url(base: &Url, stored_path: &str) -> Result<Url, BackendError> {
    let path = stored_path.trim_start_matches('/');
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| BackendError::InvalidRow(format!("cannot-be-a-base url: {base}")))?
        .pop_if_empty()
        .extend(["storage", "v1", "object", "public", MEDIA_BUCKET])
        .extend(path.split('/').filter(|s| !s.is_empty()));
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_media_path() {
        let now = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        assert_eq!(
            media_path("postImages", MediaKind::Video, now),
            "/postImages/1700000000123.mp4"
        );
    }

    #[test]
    fn test_public_media_url() {
        let base = Url::parse("https://example.supabase.co").unwrap();
        let url = public_media_url(&base, "/postImages/1.png").unwrap();
        assert_eq!(
            url.as_str(),
            "https://example.supabase.co/storage/v1/object/public/uploads/postImages/1.png"
        );
    }
}
