// SPDX-License-Identifier: MPL-2.0

mod patch;
mod serde_helpers;
mod types;

pub use patch::PostPatch;
pub use types::{
    Comment, CommentId, GoalAssignment, GoalCompletion, GoalId, GoalKind, Like, MediaKind,
    MediaRef, Notification, NotificationId, NotificationTarget, Post, PostId, Score, UserId,
    UserProfile,
};
