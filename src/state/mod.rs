// SPDX-License-Identifier: MPL-2.0

//! In-memory state shared by the event handlers and the mutation
//! coordinator, plus the persisted settings.

pub mod settings;

pub use settings::SyncSettings;

use crate::feed::{FeedScope, FeedSession, PostThread};
use crate::goals::GoalStatus;
use crate::model::{Like, Post, PostId, UserId};
use crate::notifications::NotificationCenter;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

/// Everything the client holds for the signed-in user.
///
/// Guarded by a plain mutex that is never held across an `.await`: every
/// handler runs to completion on it, and interleaving only happens between
/// backend calls.
#[derive(Debug, Default)]
pub struct SyncState {
    user: Option<UserId>,
    /// Bumped on every session change; async work captures it and
    /// discards its result when it no longer matches.
    generation: u64,
    pub feeds: BTreeMap<FeedScope, FeedSession>,
    pub thread: Option<PostThread>,
    pub notifications: NotificationCenter,
    pub goal: Option<GoalStatus>,
    /// Like writes issued but not yet resolved, per `(user, post)` pair,
    /// as correlation ids in issue order.
    pending_likes: HashMap<Like, Vec<Uuid>>,
}

pub type SharedState = Arc<Mutex<SyncState>>;

/// Lock the shared state, recovering from a poisoned guard.
pub fn lock(state: &Mutex<SyncState>) -> MutexGuard<'_, SyncState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

impl SyncState {
    pub fn user(&self) -> Option<&UserId> {
        self.user.as_ref()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.generation == generation
    }

    /// Drop everything held for the previous user and start a new session.
    pub fn reset(&mut self, user: Option<UserId>) {
        *self = Self {
            user,
            generation: self.generation + 1,
            ..Self::default()
        };
    }

    /// Any held copy of a post: feeds first, then the open thread.
    pub fn find_post(&self, id: PostId) -> Option<&Post> {
        self.feeds
            .values()
            .find_map(|session| session.store.get(id))
            .or_else(|| {
                self.thread
                    .as_ref()
                    .and_then(|t| t.post().filter(|p| p.id == id))
            })
    }

    /// Run `f` on every held copy of a post. Returns how many were touched.
    pub fn update_post(&mut self, id: PostId, mut f: impl FnMut(&mut Post)) -> usize {
        let mut touched = 0;
        for session in self.feeds.values_mut() {
            if let Some(post) = session.store.get_mut(id) {
                f(post);
                touched += 1;
            }
        }
        if let Some(post) = self
            .thread
            .as_mut()
            .and_then(|t| t.post_mut())
            .filter(|p| p.id == id)
        {
            f(post);
            touched += 1;
        }
        touched
    }

    /// Record a like write. The returned id resolves it again.
    pub fn begin_like_write(&mut self, like: &Like) -> Uuid {
        let correlation = Uuid::new_v4();
        self.pending_likes
            .entry(like.clone())
            .or_default()
            .push(correlation);
        correlation
    }

    /// Resolve the write issued as `correlation`. Returns `false` when it
    /// is not pending, e.g. after a session reset.
    pub fn end_like_write(&mut self, like: &Like, correlation: Uuid) -> bool {
        let Some(writes) = self.pending_likes.get_mut(like) else {
            return false;
        };
        let before = writes.len();
        writes.retain(|id| *id != correlation);
        let resolved = writes.len() < before;
        if writes.is_empty() {
            self.pending_likes.remove(like);
        }
        resolved
    }

    pub fn like_write_pending(&self, like: &Like) -> bool {
        self.pending_likes.contains_key(like)
    }

    /// Correlation ids of the unresolved writes on `like`, oldest first.
    pub fn like_writes(&self, like: &Like) -> &[Uuid] {
        self.pending_likes
            .get(like)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Whether any like write on `post` is unresolved.
    pub fn post_has_pending_likes(&self, post: PostId) -> bool {
        self.pending_likes.keys().any(|like| like.post_id == post)
    }
}

/// Make `like` present or absent in a post's like list.
pub fn set_liked(post: &mut Post, like: &Like, liked: bool) {
    let present = post.is_liked_by(&like.user_id);
    if liked && !present {
        post.likes.push(like.clone());
    } else if !liked && present {
        post.likes.retain(|l| l.user_id != like.user_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::{ExhaustionPolicy, PageMode, store::tests::post};

    fn state_with_post() -> SyncState {
        let mut state = SyncState::default();
        state.reset(Some(UserId::new("me")));
        let mut session = FeedSession::new(FeedScope::Home, PageMode::Cursor, 4, ExhaustionPolicy::SameLength);
        session.store.prepend(post(1, 0));
        state.feeds.insert(FeedScope::Home, session);
        let mut thread = PostThread::new(PostId(1));
        thread.load(Some(post(1, 0)), Vec::new());
        state.thread = Some(thread);
        state
    }

    #[test]
    fn test_update_post_touches_every_copy() {
        let mut state = state_with_post();
        let like = Like::new(UserId::new("me"), PostId(1));
        assert_eq!(state.update_post(PostId(1), |p| set_liked(p, &like, true)), 2);
        assert_eq!(state.update_post(PostId(9), |_| {}), 0);
        assert!(state.thread.as_ref().unwrap().post().unwrap().is_liked_by(&like.user_id));
    }

    #[test]
    fn test_pending_ledger_resolves_by_correlation() {
        let mut state = state_with_post();
        let like = Like::new(UserId::new("me"), PostId(1));
        let first = state.begin_like_write(&like);
        let second = state.begin_like_write(&like);
        assert_ne!(first, second);
        assert_eq!(state.like_writes(&like), [first, second]);

        // Writes may resolve out of issue order.
        assert!(state.end_like_write(&like, second));
        assert!(!state.end_like_write(&like, second));
        assert_eq!(state.like_writes(&like), [first]);
        assert!(state.post_has_pending_likes(PostId(1)));

        assert!(state.end_like_write(&like, first));
        assert!(!state.like_write_pending(&like));
        assert!(state.like_writes(&like).is_empty());
    }

    #[test]
    fn test_reset_drops_pending_writes() {
        let mut state = state_with_post();
        let like = Like::new(UserId::new("me"), PostId(1));
        let correlation = state.begin_like_write(&like);
        state.reset(Some(UserId::new("me")));
        assert!(!state.end_like_write(&like, correlation));
        assert!(!state.post_has_pending_likes(PostId(1)));
    }

    #[test]
    fn test_reset_bumps_generation() {
        let mut state = state_with_post();
        let generation = state.generation();
        state.reset(None);
        assert!(!state.is_current(generation));
        assert!(state.feeds.is_empty());
        assert!(state.thread.is_none());
        assert!(state.user().is_none());
    }
}
