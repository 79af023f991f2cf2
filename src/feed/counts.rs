// SPDX-License-Identifier: MPL-2.0

use crate::backend::ChangeKind;
use crate::feed::FeedStore;
use crate::model::{CommentId, Like, Post, PostId};
use std::collections::HashMap;
use tracing::debug;

/// What an incremental update did to the held counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountOutcome {
    Applied,
    /// Already reflected, or about a post that is not held.
    Ignored,
    /// Applied as well as possible, but a full refetch should follow.
    RefetchRequired,
}

/// Position of a [`CountReconciler`] when a full fetch was issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FetchMark(u64);

/// Keeps the denormalized counters of held posts consistent with the
/// backend.
///
/// Comment counts move by +1/-1 on change events and are overwritten by
/// every full fetch. Like counts are the length of each post's like list,
/// so membership and count can never disagree. A comment delete asks for
/// a refetch because decrements drift after missed events, and so does any
/// comment change that lands while a full fetch is in flight.
#[derive(Debug, Clone, Default)]
pub struct CountReconciler {
    /// Comments counted incrementally since the last full fetch, with the
    /// epoch they were counted at.
    counted: HashMap<CommentId, (PostId, u64)>,
    refetch: bool,
    /// Bumped by every incremental comment change. Never reset.
    epoch: u64,
}

impl CountReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take before issuing a full fetch and hand back to [`apply_fetch`](Self::apply_fetch).
    pub fn mark(&self) -> FetchMark {
        FetchMark(self.epoch)
    }

    /// Overwrite counts and like lists of held posts with a full fetch
    /// issued at `mark`.
    ///
    /// Posts for which `is_pending` holds keep their local like list: an
    /// optimistic toggle on them has not resolved yet. Comment changes
    /// counted after `mark` may be missing from `fetched`; they stay
    /// deduplicated and leave a refetch requested.
    pub fn apply_fetch(
        &mut self,
        store: &mut FeedStore,
        fetched: &[Post],
        mark: FetchMark,
        is_pending: impl Fn(PostId) -> bool,
    ) -> usize {
        let mut touched = 0;
        for source in fetched {
            let Some(post) = store.get_mut(source.id) else {
                continue;
            };
            post.comment_count = source.comment_count;
            if !is_pending(source.id) {
                post.likes = source.likes.clone();
            }
            touched += 1;
        }
        let raced = self.epoch > mark.0;
        self.counted.retain(|_, (_, epoch)| *epoch > mark.0);
        self.refetch = raced;
        debug!(touched, raced, "counts overwritten from fetch");
        touched
    }

    pub fn comment_inserted(
        &mut self,
        store: &mut FeedStore,
        comment: CommentId,
        post_id: PostId,
    ) -> CountOutcome {
        if self.counted.contains_key(&comment) {
            return CountOutcome::Ignored;
        }
        self.epoch += 1;
        self.counted.insert(comment, (post_id, self.epoch));
        match store.get_mut(post_id) {
            Some(post) => {
                post.comment_count += 1;
                CountOutcome::Applied
            }
            None => CountOutcome::Ignored,
        }
    }

    /// `post_id` comes from the delete payload when the backend sends the
    /// full old row; otherwise it is recovered from earlier inserts.
    pub fn comment_deleted(
        &mut self,
        store: &mut FeedStore,
        comment: CommentId,
        post_id: Option<PostId>,
    ) -> CountOutcome {
        let counted = self.counted.remove(&comment).map(|(id, _)| id);
        let post_id = post_id.or(counted);
        self.epoch += 1;
        if let Some(post) = post_id.and_then(|id| store.get_mut(id)) {
            post.comment_count = post.comment_count.saturating_sub(1);
        }
        self.refetch = true;
        CountOutcome::RefetchRequired
    }

    /// Apply a like-record insert or delete. Applying the same change twice
    /// is a no-op.
    pub fn like_changed(&mut self, store: &mut FeedStore, kind: ChangeKind, like: &Like) -> CountOutcome {
        let Some(post) = store.get_mut(like.post_id) else {
            return CountOutcome::Ignored;
        };
        let present = post.is_liked_by(&like.user_id);
        match kind {
            ChangeKind::Insert | ChangeKind::Update if !present => {
                post.likes.push(like.clone());
                CountOutcome::Applied
            }
            ChangeKind::Delete if present => {
                post.likes.retain(|l| l.user_id != like.user_id);
                CountOutcome::Applied
            }
            _ => CountOutcome::Ignored,
        }
    }

    /// Whether a comment delete has asked for a refetch since the last one.
    pub fn refetch_requested(&self) -> bool {
        self.refetch
    }

    /// Forget incremental state after the held posts were replaced.
    pub fn reset(&mut self) {
        self.counted.clear();
        self.refetch = false;
    }
}
