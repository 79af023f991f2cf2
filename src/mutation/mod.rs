// SPDX-License-Identifier: MPL-2.0

//! User-initiated writes: applied locally first, confirmed or reverted
//! when the backend answers.

mod coordinator;
mod queue;

pub use coordinator::{
    MediaSource, MutationOptions, OptimisticMutationCoordinator, PostDraft, PostOutcome,
};
pub use queue::{QueueTicket, WriteQueue};

use crate::backend::BackendError;
use crate::model::PostId;
use std::time::Duration;
use thiserror::Error;

/// Client-side checks that block a submission. Never fatal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Please choose an image or write something")]
    EmptyPost,
    #[error("Comment cannot be empty")]
    EmptyComment,
    #[error("Today's goal is already completed")]
    GoalAlreadyCompleted,
    #[error("Not signed in")]
    SignedOut,
    #[error("Post {0} is not loaded")]
    UnknownPost(PostId),
    #[error("Only the author can do that")]
    NotPermitted,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MutationError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("no response after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("session ended before the write resolved")]
    SessionEnded,
}

/// Which user action failed, for wording the alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Like,
    Unlike,
    Comment,
    Post,
    Delete,
}

impl Action {
    fn title(self) -> &'static str {
        match self {
            Action::Like | Action::Unlike | Action::Post | Action::Delete => "Post",
            Action::Comment => "Comment",
        }
    }

    fn failure(self) -> &'static str {
        match self {
            Action::Like => "Couldn't like the post!",
            Action::Unlike => "Couldn't unlike the post!",
            Action::Comment => "Couldn't add your comment",
            Action::Post => "Post couldn't be uploaded!",
            Action::Delete => "Couldn't delete it",
        }
    }
}

/// A blocking, dismissable message for the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserAlert {
    pub title: String,
    pub message: String,
}

impl MutationError {
    pub fn alert(&self, action: Action) -> UserAlert {
        let message = match self {
            MutationError::Validation(e) => e.to_string(),
            MutationError::Timeout(_) => format!("{} (timed out)", action.failure()),
            MutationError::Backend(_) | MutationError::SessionEnded => action.failure().to_string(),
        };
        UserAlert {
            title: action.title().to_string(),
            message,
        }
    }
}
