// SPDX-License-Identifier: MPL-2.0

//! Notification list and unread badge.

use crate::backend::{Backend, BackendError, Query, Table, decode, decode_all};
use crate::model::{CommentId, Notification, NotificationId, PostId, UserId};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;

pub const NOTIFICATION_SELECT: &str = "*, sender: senderId (id, name, image)";

pub const COMMENT_NOTIFICATION_TITLE: &str = "Commented on your post";

/// Client-side notification state. Lives for one session; never persisted.
#[derive(Debug, Clone)]
pub struct NotificationCenter {
    unread: u32,
    foreground: bool,
    seen: HashSet<NotificationId>,
    items: Vec<Notification>,
}

impl Default for NotificationCenter {
    fn default() -> Self {
        Self {
            unread: 0,
            foreground: true,
            seen: HashSet::new(),
            items: Vec::new(),
        }
    }
}

impl NotificationCenter {
    pub fn unread(&self) -> u32 {
        self.unread
    }

    pub fn items(&self) -> &[Notification] {
        &self.items
    }

    pub fn set_foreground(&mut self, foreground: bool) {
        self.foreground = foreground;
    }

    /// An inserted notification arrived. Counts toward the badge once per
    /// id, and only while the app is in the foreground. Returns whether the
    /// badge moved.
    pub fn received(&mut self, notification: Notification) -> bool {
        if !self.seen.insert(notification.id) {
            return false;
        }
        self.items.insert(0, notification);
        if !self.foreground {
            return false;
        }
        self.unread += 1;
        true
    }

    /// The user opened the notification list.
    pub fn mark_seen(&mut self) {
        self.unread = 0;
    }

    /// Replace the list with a fetched one, newest first. The badge is not
    /// touched.
    pub fn load(&mut self, items: Vec<Notification>) {
        self.seen.extend(items.iter().map(|n| n.id));
        self.items = items;
    }
}

/// Backend reads and writes for notifications.
pub struct NotificationService {
    backend: Arc<dyn Backend>,
}

impl NotificationService {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    /// Notifications addressed to `receiver`, newest first.
    pub async fn fetch(&self, receiver: &UserId) -> Result<Vec<Notification>, BackendError> {
        let rows = self
            .backend
            .query(
                Query::on(Table::Notifications)
                    .select(NOTIFICATION_SELECT)
                    .eq("receiverId", receiver)
                    .order("created_at", false),
            )
            .await?;
        decode_all(rows)
    }

    /// Tell a post's author about a new comment on it.
    pub async fn comment_posted(
        &self,
        sender: &UserId,
        receiver: &UserId,
        post: PostId,
        comment: CommentId,
    ) -> Result<Notification, BackendError> {
        let row = self
            .backend
            .insert(
                Table::Notifications,
                json!({
                    "senderId": sender,
                    "receiverId": receiver,
                    "title": COMMENT_NOTIFICATION_TITLE,
                    "data": { "postId": post, "commentId": comment },
                }),
            )
            .await?;
        decode(row)
    }
}
