// SPDX-License-Identifier: MPL-2.0

use crate::model::serde_helpers::count_from_value;
use crate::model::types::{Like, MediaRef, Post, UserProfile};
use chrono::{DateTime, Utc};
use serde_json::Value;

/// A partial update to a [`Post`]. `None` leaves the field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PostPatch {
    pub body: Option<String>,
    /// `Some(None)` clears the attachment.
    pub media: Option<Option<MediaRef>>,
    pub created_at: Option<DateTime<Utc>>,
    pub likes: Option<Vec<Like>>,
    pub comment_count: Option<u32>,
    pub author: Option<UserProfile>,
}

impl PostPatch {
    pub fn body(body: impl Into<String>) -> Self {
        Self {
            body: Some(body.into()),
            ..Self::default()
        }
    }

    pub fn comment_count(count: u32) -> Self {
        Self {
            comment_count: Some(count),
            ..Self::default()
        }
    }

    pub fn likes(likes: Vec<Like>) -> Self {
        Self {
            likes: Some(likes),
            ..Self::default()
        }
    }

    pub fn author(author: UserProfile) -> Self {
        Self {
            author: Some(author),
            ..Self::default()
        }
    }

    /// Build a patch from the columns present in a backend row.
    ///
    /// Change-event rows only carry the table's own columns, so embedded
    /// relations (likes, comment counts, author) are patched only when the
    /// row actually contains them.
    pub fn from_row(row: &Value) -> Self {
        let Some(obj) = row.as_object() else {
            return Self::default();
        };

        let mut patch = Self::default();
        if let Some(body) = obj.get("body") {
            patch.body = Some(body.as_str().unwrap_or_default().to_string());
        }
        if let Some(file) = obj.get("file") {
            patch.media = Some(
                file.as_str()
                    .filter(|p| !p.is_empty())
                    .map(MediaRef::from_path),
            );
        }
        if let Some(ts) = obj.get("created_at").and_then(Value::as_str) {
            patch.created_at = ts.parse().ok();
        }
        if let Some(likes) = obj.get("postLikes") {
            patch.likes = serde_json::from_value(likes.clone()).ok();
        }
        if let Some(comments) = obj.get("comments") {
            patch.comment_count = Some(count_from_value(comments));
        }
        if let Some(user) = obj.get("user") {
            patch.author = serde_json::from_value(user.clone()).ok();
        }
        patch
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn apply(self, post: &mut Post) {
        if let Some(body) = self.body {
            post.body = body;
        }
        if let Some(media) = self.media {
            post.media = media;
        }
        if let Some(created_at) = self.created_at {
            post.created_at = created_at;
        }
        if let Some(likes) = self.likes {
            post.likes = likes;
        }
        if let Some(count) = self.comment_count {
            post.comment_count = count;
        }
        if let Some(author) = self.author {
            post.author = Some(author);
        }
    }
}

impl From<&Post> for PostPatch {
    /// Every field of `post`, used to merge a re-observed post by id.
    fn from(post: &Post) -> Self {
        Self {
            body: Some(post.body.clone()),
            media: Some(post.media.clone()),
            created_at: Some(post.created_at),
            likes: Some(post.likes.clone()),
            comment_count: Some(post.comment_count),
            author: post.author.clone(),
        }
    }
}
