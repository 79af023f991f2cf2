// SPDX-License-Identifier: MPL-2.0

use crate::model::serde_helpers;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Server-assigned post identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PostId(pub i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommentId(pub i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GoalId(pub i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NotificationId(pub i64);

/// Auth user id (a UUID string on the backend, kept opaque here).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for CommentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for GoalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Minimal profile embedded into posts, comments and notifications.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    #[serde(default)]
    pub id: UserId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    pub fn extension(self) -> &'static str {
        match self {
            MediaKind::Image => "png",
            MediaKind::Video => "mp4",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            MediaKind::Image => "image/*",
            MediaKind::Video => "video/*",
        }
    }
}

/// Stored media attached to a post.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaRef {
    pub kind: MediaKind,
    pub path: String,
}

impl MediaRef {
    /// Infer the media kind from a stored path.
    ///
    /// The extension wins when it is recognizable; otherwise anything stored
    /// under the post image folder is an image and everything else a video.
    pub fn from_path(path: impl Into<String>) -> Self {
        let path = path.into();
        let lower = path.to_ascii_lowercase();
        let kind = match lower.rsplit_once('.').map(|(_, ext)| ext) {
            Some("png" | "jpg" | "jpeg" | "gif" | "webp" | "heic") => MediaKind::Image,
            Some("mp4" | "mov" | "m4v" | "webm") => MediaKind::Video,
            _ if lower.contains("postimage") => MediaKind::Image,
            _ => MediaKind::Video,
        };
        Self { kind, path }
    }
}

/// A like record. Identity is the `(user_id, post_id)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Like {
    #[serde(rename = "userId")]
    pub user_id: UserId,
    #[serde(rename = "postId")]
    pub post_id: PostId,
}

impl Like {
    pub fn new(user_id: UserId, post_id: PostId) -> Self {
        Self { user_id, post_id }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub id: PostId,
    #[serde(rename = "userId")]
    pub author_id: UserId,
    #[serde(default, deserialize_with = "serde_helpers::null_as_default")]
    pub body: String,
    #[serde(rename = "file", default, with = "serde_helpers::media_path")]
    pub media: Option<MediaRef>,
    pub created_at: DateTime<Utc>,
    #[serde(
        rename = "postLikes",
        default,
        deserialize_with = "serde_helpers::null_as_default"
    )]
    pub likes: Vec<Like>,
    #[serde(
        rename = "comments",
        default,
        deserialize_with = "serde_helpers::embedded_count"
    )]
    pub comment_count: u32,
    #[serde(
        rename = "user",
        default,
        deserialize_with = "serde_helpers::lenient_profile",
        skip_serializing_if = "Option::is_none"
    )]
    pub author: Option<UserProfile>,
}

impl Post {
    pub fn like_count(&self) -> usize {
        self.likes.len()
    }

    pub fn is_liked_by(&self, user_id: &UserId) -> bool {
        self.likes.iter().any(|like| &like.user_id == user_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: CommentId,
    #[serde(rename = "postId")]
    pub post_id: PostId,
    #[serde(rename = "userId")]
    pub author_id: UserId,
    #[serde(default, deserialize_with = "serde_helpers::null_as_default")]
    pub text: String,
    pub created_at: DateTime<Utc>,
    #[serde(
        rename = "user",
        default,
        deserialize_with = "serde_helpers::lenient_profile",
        skip_serializing_if = "Option::is_none"
    )]
    pub author: Option<UserProfile>,
}

/// Content the daily goal asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GoalKind {
    Image,
    Video,
    Text,
}

impl GoalKind {
    /// Whether a post carrying `media` satisfies this goal kind.
    pub fn accepts(self, media: Option<&MediaRef>) -> bool {
        match (self, media) {
            (GoalKind::Text, _) => true,
            (GoalKind::Image, Some(m)) => m.kind == MediaKind::Image,
            (GoalKind::Video, Some(m)) => m.kind == MediaKind::Video,
            _ => false,
        }
    }
}

/// Today's challenge, selected from the schedule by calendar date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "serde_helpers::GoalScheduleRow")]
pub struct GoalAssignment {
    pub date: NaiveDate,
    pub goal_id: GoalId,
    pub kind: GoalKind,
    pub title: String,
}

/// Marks that a user satisfied a goal. Identity is `(user_id, goal_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoalCompletion {
    #[serde(rename = "userid")]
    pub user_id: UserId,
    #[serde(rename = "goalid")]
    pub goal_id: GoalId,
    #[serde(rename = "postid")]
    pub post_id: PostId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Score {
    #[serde(rename = "userid")]
    pub user_id: UserId,
    #[serde(default)]
    pub score: i64,
    #[serde(
        rename = "user",
        default,
        deserialize_with = "serde_helpers::lenient_profile",
        skip_serializing_if = "Option::is_none"
    )]
    pub user: Option<UserProfile>,
}

/// Where a notification points (decoded from its `data` column).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationTarget {
    #[serde(rename = "postId")]
    pub post_id: PostId,
    #[serde(rename = "commentId", default, skip_serializing_if = "Option::is_none")]
    pub comment_id: Option<CommentId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: NotificationId,
    #[serde(rename = "senderId")]
    pub sender_id: UserId,
    #[serde(rename = "receiverId")]
    pub receiver_id: UserId,
    #[serde(default, deserialize_with = "serde_helpers::null_as_default")]
    pub title: String,
    #[serde(default, deserialize_with = "serde_helpers::json_or_string")]
    pub data: Option<NotificationTarget>,
    pub created_at: DateTime<Utc>,
    #[serde(
        default,
        deserialize_with = "serde_helpers::lenient_profile",
        skip_serializing_if = "Option::is_none"
    )]
    pub sender: Option<UserProfile>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_post_from_backend_row() {
        let post: Post = serde_json::from_value(json!({
            "id": 7,
            "userId": "u-1",
            "body": "<p>planted a tree</p>",
            "file": "/postImages/1700000000000.png",
            "created_at": "2024-05-01T08:30:00+00:00",
            "postLikes": [{ "userId": "u-2", "postId": 7 }],
            "comments": [{ "count": 3 }],
            "user": { "id": "u-1", "name": "Ada", "image": null }
        }))
        .unwrap();

        assert_eq!(post.id, PostId(7));
        assert_eq!(post.comment_count, 3);
        assert_eq!(post.like_count(), 1);
        assert!(post.is_liked_by(&UserId::new("u-2")));
        assert_eq!(post.media.as_ref().map(|m| m.kind), Some(MediaKind::Image));
        assert_eq!(post.author.as_ref().and_then(|a| a.name.as_deref()), Some("Ada"));
    }

    #[test]
    fn test_post_from_change_event_row() {
        // Change-event rows carry no embedded relations.
        let post: Post = serde_json::from_value(json!({
            "id": 8,
            "userId": "u-1",
            "body": null,
            "file": null,
            "created_at": "2024-05-01T08:30:00+00:00"
        }))
        .unwrap();

        assert_eq!(post.body, "");
        assert!(post.media.is_none());
        assert!(post.likes.is_empty());
        assert_eq!(post.comment_count, 0);
        assert!(post.author.is_none());
    }

    #[test]
    fn test_media_kind_inference() {
        assert_eq!(MediaRef::from_path("/postImages/1.mp4").kind, MediaKind::Video);
        assert_eq!(MediaRef::from_path("/postImages/1.PNG").kind, MediaKind::Image);
        assert_eq!(MediaRef::from_path("/postImages/blob").kind, MediaKind::Image);
        assert_eq!(MediaRef::from_path("/clips/blob").kind, MediaKind::Video);
    }

    #[test]
    fn test_goal_kind_accepts() {
        let image = MediaRef::from_path("/postImages/1.png");
        assert!(GoalKind::Image.accepts(Some(&image)));
        assert!(!GoalKind::Video.accepts(Some(&image)));
        assert!(!GoalKind::Image.accepts(None));
        assert!(GoalKind::Text.accepts(None));
    }

    #[test]
    fn test_goal_assignment_from_schedule_row() {
        let goal: GoalAssignment = serde_json::from_value(json!({
            "date": "2024-05-01",
            "goalid": 3,
            "goals": { "title": "Photograph a bird", "type": "image" }
        }))
        .unwrap();

        assert_eq!(goal.goal_id, GoalId(3));
        assert_eq!(goal.kind, GoalKind::Image);
        assert_eq!(goal.title, "Photograph a bird");
    }

    #[test]
    fn test_notification_data_as_string() {
        let notification: Notification = serde_json::from_value(json!({
            "id": 1,
            "senderId": "u-2",
            "receiverId": "u-1",
            "title": "Commented on your post",
            "data": "{\"postId\":7,\"commentId\":12}",
            "created_at": "2024-05-01T08:30:00+00:00"
        }))
        .unwrap();

        let target = notification.data.unwrap();
        assert_eq!(target.post_id, PostId(7));
        assert_eq!(target.comment_id, Some(CommentId(12)));
    }
}
