// SPDX-License-Identifier: MPL-2.0

use crate::backend::{
    Backend, BackendError, Filter, ObjectStorage, Query, Table, decode, media_path,
};
use crate::config::POST_MEDIA_FOLDER;
use crate::goals::{DayBoundary, GoalTracker};
use crate::model::{Comment, CommentId, Like, MediaKind, MediaRef, Post, PostId, PostPatch, UserId};
use crate::mutation::{MutationError, ValidationError, WriteQueue};
use crate::notifications::NotificationService;
use crate::score::ScoreService;
use crate::state::{SharedState, SyncSettings, lock, set_liked};
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

static MARKUP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<[^>]*>|&nbsp;").expect("markup pattern is valid"));

/// Rich-text body reduced to its visible text.
fn visible_text(body: &str) -> String {
    MARKUP.replace_all(body, " ").trim().to_string()
}

#[derive(Debug, Clone)]
pub struct MutationOptions {
    pub comment_timeout: Duration,
    pub like_points: i64,
    pub media_folder: String,
    pub day_boundary: DayBoundary,
}

impl From<&SyncSettings> for MutationOptions {
    fn from(settings: &SyncSettings) -> Self {
        Self {
            comment_timeout: settings.comment_timeout(),
            like_points: settings.like_points,
            media_folder: POST_MEDIA_FOLDER.to_string(),
            day_boundary: settings.day_boundary,
        }
    }
}

impl Default for MutationOptions {
    fn default() -> Self {
        Self::from(&SyncSettings::default())
    }
}

/// Media attached to a post being submitted.
#[derive(Debug, Clone, PartialEq)]
pub enum MediaSource {
    /// Local bytes, uploaded before the post is written.
    Upload { bytes: Vec<u8>, kind: MediaKind },
    /// Already stored (editing a post keeps its attachment).
    Stored(MediaRef),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PostDraft {
    /// Set when editing an existing post.
    pub id: Option<PostId>,
    pub body: String,
    pub media: Option<MediaSource>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PostOutcome {
    pub post: Post,
    pub goal_credited: bool,
    /// The goal-completion write failed after the post was saved. The post
    /// stays; the goal stays incomplete.
    pub goal_error: Option<BackendError>,
}

/// Applies user mutations to local state immediately, writes them to the
/// backend, and reverts the local change if the write fails.
pub struct OptimisticMutationCoordinator {
    backend: Arc<dyn Backend>,
    storage: Arc<dyn ObjectStorage>,
    state: SharedState,
    likes: WriteQueue<Like>,
    scores: Arc<ScoreService>,
    goals: GoalTracker,
    notifications: NotificationService,
    options: MutationOptions,
}

impl OptimisticMutationCoordinator {
    pub fn new(
        backend: Arc<dyn Backend>,
        storage: Arc<dyn ObjectStorage>,
        state: SharedState,
        scores: Arc<ScoreService>,
        options: MutationOptions,
    ) -> Self {
        Self {
            goals: GoalTracker::new(backend.clone(), options.day_boundary),
            notifications: NotificationService::new(backend.clone()),
            backend,
            storage,
            state,
            likes: WriteQueue::new(),
            scores,
            options,
        }
    }

    /// Flip the current user's like on a post. Returns whether the post is
    /// now liked.
    ///
    /// The local like list changes before this function first yields.
    /// Writes for the same `(user, post)` pair go out in call order, so two
    /// rapid toggles leave the backend where it started.
    pub async fn toggle_like(&self, post_id: PostId) -> Result<bool, MutationError> {
        let (like, liked, author, correlation, generation, mut ticket) = {
            let mut state = lock(&self.state);
            let user = state.user().cloned().ok_or(ValidationError::SignedOut)?;
            let post = state
                .find_post(post_id)
                .ok_or(ValidationError::UnknownPost(post_id))?;
            let liked = !post.is_liked_by(&user);
            let author = post.author_id.clone();
            let like = Like::new(user, post_id);

            state.update_post(post_id, |p| set_liked(p, &like, liked));
            let correlation = state.begin_like_write(&like);
            let ticket = self.likes.enqueue(like.clone());
            (like, liked, author, correlation, state.generation(), ticket)
        };

        ticket.wait_turn().await;
        debug!(%correlation, post = %post_id, liked, "writing like");
        let result = if liked {
            let record = json!({ "userId": like.user_id, "postId": like.post_id });
            match self.backend.insert(Table::PostLikes, record).await {
                Ok(_) | Err(BackendError::Conflict(_)) => Ok(()),
                Err(e) => Err(e),
            }
        } else {
            self.backend
                .delete(
                    Table::PostLikes,
                    vec![
                        Filter::eq("userId", &like.user_id),
                        Filter::eq("postId", post_id),
                    ],
                )
                .await
        };

        {
            let mut state = lock(&self.state);
            if !state.is_current(generation) {
                return Err(MutationError::SessionEnded);
            }
            state.end_like_write(&like, correlation);
            if result.is_err() {
                state.update_post(post_id, |p| set_liked(p, &like, !liked));
            }
        }
        drop(ticket);

        match result {
            Ok(()) => {
                let delta = if liked {
                    self.options.like_points
                } else {
                    -self.options.like_points
                };
                self.scores.award_quietly(&author, delta).await;
                Ok(liked)
            }
            Err(e) => {
                warn!(%correlation, post = %post_id, error = %e, "like write failed, reverted");
                Err(e.into())
            }
        }
    }

    /// Insert a comment. The comment is not shown locally: it enters the
    /// thread when its change event arrives.
    pub async fn submit_comment(&self, post_id: PostId, text: &str) -> Result<Comment, MutationError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ValidationError::EmptyComment.into());
        }
        let (user, known_author) = {
            let state = lock(&self.state);
            let user = state.user().cloned().ok_or(ValidationError::SignedOut)?;
            let author = state.find_post(post_id).map(|p| p.author_id.clone());
            (user, author)
        };

        let timeout = self.options.comment_timeout;
        let insert = self.backend.insert(
            Table::Comments,
            json!({ "postId": post_id, "userId": user, "text": text }),
        );
        let row = tokio::time::timeout(timeout, insert)
            .await
            .map_err(|_| MutationError::Timeout(timeout))??;
        let comment: Comment = decode(row)?;
        info!(comment = %comment.id, post = %post_id, "comment submitted");

        let author = match known_author {
            Some(author) => Some(author),
            None => self.post_author(post_id).await,
        };
        if let Some(author) = author.filter(|a| a != &user)
            && let Err(e) = self
                .notifications
                .comment_posted(&user, &author, post_id, comment.id)
                .await
        {
            warn!(post = %post_id, error = %e, "comment notification not sent");
        }
        Ok(comment)
    }

    async fn post_author(&self, post_id: PostId) -> Option<UserId> {
        let rows = self
            .backend
            .query(Query::on(Table::Posts).select("userId").eq("id", post_id).limit(1))
            .await
            .ok()?;
        rows.first()?
            .get("userId")
            .and_then(Value::as_str)
            .map(UserId::new)
    }

    /// Create or edit a post, then credit today's goal for new posts.
    ///
    /// The two writes are not atomic. When the goal write fails the post
    /// is kept and the failure is reported in the outcome.
    pub async fn submit_post(&self, draft: PostDraft) -> Result<PostOutcome, MutationError> {
        if visible_text(&draft.body).is_empty() && draft.media.is_none() {
            return Err(ValidationError::EmptyPost.into());
        }
        let editing = draft.id.is_some();
        let (user, goal, generation) = {
            let state = lock(&self.state);
            let user = state.user().cloned().ok_or(ValidationError::SignedOut)?;
            if let Some(post) = draft.id.and_then(|id| state.find_post(id))
                && post.author_id != user
            {
                return Err(ValidationError::NotPermitted.into());
            }
            (user, state.goal.clone(), state.generation())
        };
        if !editing && goal.as_ref().is_some_and(|g| g.completed) {
            return Err(ValidationError::GoalAlreadyCompleted.into());
        }

        let media = match draft.media {
            Some(MediaSource::Upload { bytes, kind }) => {
                let path = media_path(&self.options.media_folder, kind, Utc::now());
                let stored = self.storage.upload(&path, bytes, kind.content_type()).await?;
                Some(MediaRef { kind, path: stored })
            }
            Some(MediaSource::Stored(media)) => Some(media),
            None => None,
        };

        let mut record = json!({
            "userId": user,
            "body": draft.body,
            "file": media.as_ref().map(|m| m.path.as_str()),
        });
        if let (Some(id), Some(obj)) = (draft.id, record.as_object_mut()) {
            obj.insert("id".into(), json!(id));
        }
        let post: Post = decode(self.backend.upsert(Table::Posts, record).await?)?;
        info!(post = %post.id, editing, "post saved");

        {
            let mut state = lock(&self.state);
            if !state.is_current(generation) {
                return Err(MutationError::SessionEnded);
            }
            for session in state.feeds.values_mut() {
                let held = session.store.contains(post.id);
                if held || (!editing && session.scope.admits(&post)) {
                    session.store.prepend(post.clone());
                }
            }
            if let Some(thread_post) = state
                .thread
                .as_mut()
                .and_then(|t| t.post_mut())
                .filter(|p| p.id == post.id)
            {
                PostPatch {
                    likes: None,
                    comment_count: None,
                    author: None,
                    ..PostPatch::from(&post)
                }
                .apply(thread_post);
            }
        }

        let mut outcome = PostOutcome {
            post,
            goal_credited: false,
            goal_error: None,
        };
        let Some(goal) = goal.filter(|g| !editing && g.credits(outcome.post.media.as_ref())) else {
            return Ok(outcome);
        };
        match self
            .goals
            .record_completion(&user, &goal.assignment, outcome.post.id)
            .await
        {
            Ok(_) => {
                let mut state = lock(&self.state);
                if state.is_current(generation)
                    && let Some(status) = state.goal.as_mut()
                {
                    status.completed = true;
                }
                outcome.goal_credited = true;
            }
            Err(e) => {
                warn!(post = %outcome.post.id, goal = %goal.assignment.goal_id, error = %e,
                    "goal completion not recorded; post kept");
                outcome.goal_error = Some(e);
            }
        }
        Ok(outcome)
    }

    /// Delete one of the current user's posts, then drop it locally.
    pub async fn delete_post(&self, post_id: PostId) -> Result<(), MutationError> {
        {
            let state = lock(&self.state);
            let user = state.user().ok_or(ValidationError::SignedOut)?;
            if let Some(post) = state.find_post(post_id)
                && &post.author_id != user
            {
                return Err(ValidationError::NotPermitted.into());
            }
        }
        self.backend
            .delete(Table::Posts, vec![Filter::eq("id", post_id)])
            .await?;

        let mut state = lock(&self.state);
        for session in state.feeds.values_mut() {
            session.store.remove_by_id(post_id);
        }
        if state.thread.as_ref().is_some_and(|t| t.post_id() == post_id) {
            state.thread = None;
        }
        Ok(())
    }

    /// Delete a comment from the open thread. Allowed for the comment's
    /// author and the post's author.
    pub async fn delete_comment(&self, comment_id: CommentId) -> Result<(), MutationError> {
        {
            let state = lock(&self.state);
            let user = state.user().ok_or(ValidationError::SignedOut)?;
            if let Some(thread) = &state.thread {
                let comment_author = thread
                    .comments()
                    .iter()
                    .find(|c| c.id == comment_id)
                    .map(|c| &c.author_id);
                let post_author = thread.post().map(|p| &p.author_id);
                if comment_author.is_some()
                    && comment_author != Some(user)
                    && post_author != Some(user)
                {
                    return Err(ValidationError::NotPermitted.into());
                }
            }
        }
        self.backend
            .delete(Table::Comments, vec![Filter::eq("id", comment_id)])
            .await?;

        if let Some(thread) = lock(&self.state).thread.as_mut() {
            thread.remove_comment(comment_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryBackend, MemoryStorage, Operation};
    use crate::feed::{ExhaustionPolicy, FeedScope, FeedSession, PageMode, PostThread};
    use crate::goals::GoalStatus;
    use crate::model::{GoalAssignment, GoalId, GoalKind};
    use crate::state::SyncState;
    use chrono::NaiveDate;
    use std::sync::Mutex;
    use url::Url;

    struct Fixture {
        backend: Arc<MemoryBackend>,
        storage: Arc<MemoryStorage>,
        state: SharedState,
        coordinator: Arc<OptimisticMutationCoordinator>,
    }

    fn fixture() -> Fixture {
        let backend = Arc::new(MemoryBackend::new());
        backend.seed(
            Table::Posts,
            [json!({ "id": 1, "userId": "author", "body": "hello", "created_at": "2024-05-01T00:00:00Z" })],
        );
        backend.seed(Table::Scores, [json!({ "userid": "author", "score": 0 })]);
        let storage = Arc::new(MemoryStorage::new(Url::parse("https://example.test").unwrap()));

        let mut initial = SyncState::default();
        initial.reset(Some(UserId::new("me")));
        let mut session =
            FeedSession::new(FeedScope::Home, PageMode::Cursor, 4, ExhaustionPolicy::SameLength);
        session.store.prepend(crate::feed::store::tests::post(1, 0));
        initial.feeds.insert(FeedScope::Home, session);
        let state = Arc::new(Mutex::new(initial));

        let coordinator = Arc::new(OptimisticMutationCoordinator::new(
            backend.clone(),
            storage.clone(),
            state.clone(),
            Arc::new(ScoreService::new(backend.clone())),
            MutationOptions::default(),
        ));
        Fixture {
            backend,
            storage,
            state,
            coordinator,
        }
    }

    fn liked(state: &SharedState) -> bool {
        lock(state)
            .find_post(PostId(1))
            .unwrap()
            .is_liked_by(&UserId::new("me"))
    }

    fn goal(completed: bool) -> GoalStatus {
        GoalStatus {
            assignment: GoalAssignment {
                date: NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
                goal_id: GoalId(3),
                kind: GoalKind::Text,
                title: "Say something".into(),
            },
            completed,
        }
    }

    #[tokio::test]
    async fn test_like_applies_locally_and_remotely() {
        let f = fixture();
        assert!(f.coordinator.toggle_like(PostId(1)).await.unwrap());
        assert!(liked(&f.state));
        assert_eq!(f.backend.rows(Table::PostLikes).len(), 1);
        assert_eq!(f.backend.rows(Table::Scores)[0]["score"], 1);
    }

    #[tokio::test]
    async fn test_failed_like_is_rolled_back() {
        let f = fixture();
        f.backend.fail_next(Operation::Insert, Table::PostLikes);
        let err = f.coordinator.toggle_like(PostId(1)).await.unwrap_err();
        assert!(matches!(err, MutationError::Backend(_)));
        assert!(!liked(&f.state));
        assert!(!lock(&f.state).post_has_pending_likes(PostId(1)));
        assert_eq!(f.backend.rows(Table::Scores)[0]["score"], 0);
    }

    #[tokio::test]
    async fn test_rapid_double_toggle_is_a_no_op() {
        let f = fixture();
        f.backend.hold_writes();

        let first = tokio::spawn({
            let c = f.coordinator.clone();
            async move { c.toggle_like(PostId(1)).await }
        });
        let second = tokio::spawn({
            let c = f.coordinator.clone();
            async move { c.toggle_like(PostId(1)).await }
        });
        // Let both tasks apply their local change and block on the backend.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(!liked(&f.state));
        let like = Like::new(UserId::new("me"), PostId(1));
        let writes = lock(&f.state).like_writes(&like).to_vec();
        assert_eq!(writes.len(), 2);
        assert_ne!(writes[0], writes[1]);

        f.backend.release_writes();
        assert!(first.await.unwrap().unwrap());
        assert!(!second.await.unwrap().unwrap());

        assert!(!liked(&f.state));
        assert!(f.backend.rows(Table::PostLikes).is_empty());
        assert!(!lock(&f.state).post_has_pending_likes(PostId(1)));
    }

    #[tokio::test]
    async fn test_comment_is_not_shown_optimistically() {
        let f = fixture();
        {
            let mut state = lock(&f.state);
            let mut thread = PostThread::new(PostId(1));
            thread.load(Some(crate::feed::store::tests::post(1, 0)), Vec::new());
            state.thread = Some(thread);
        }

        let comment = f.coordinator.submit_comment(PostId(1), "  nice  ").await.unwrap();
        assert_eq!(comment.text, "nice");
        assert!(lock(&f.state).thread.as_ref().unwrap().comments().is_empty());

        // The post author is notified.
        let notifications = f.backend.rows(Table::Notifications);
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0]["receiverId"], "author");
    }

    #[tokio::test]
    async fn test_empty_comment_rejected() {
        let f = fixture();
        let err = f.coordinator.submit_comment(PostId(1), "   ").await.unwrap_err();
        assert_eq!(err, MutationError::Validation(ValidationError::EmptyComment));
    }

    #[tokio::test(start_paused = true)]
    async fn test_comment_timeout() {
        let f = fixture();
        f.backend.hold_writes();
        let err = f.coordinator.submit_comment(PostId(1), "hi").await.unwrap_err();
        assert!(matches!(err, MutationError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_empty_post_rejected() {
        let f = fixture();
        let draft = PostDraft {
            body: "<p>&nbsp;</p>".into(),
            ..PostDraft::default()
        };
        let err = f.coordinator.submit_post(draft).await.unwrap_err();
        assert_eq!(err, MutationError::Validation(ValidationError::EmptyPost));
    }

    #[tokio::test]
    async fn test_goal_failure_keeps_post_and_goal_incomplete() {
        let f = fixture();
        lock(&f.state).goal = Some(goal(false));
        f.backend.fail_next(Operation::Upsert, Table::GoalCompletions);

        let outcome = f
            .coordinator
            .submit_post(PostDraft {
                body: "<p>planted a tree</p>".into(),
                ..PostDraft::default()
            })
            .await
            .unwrap();

        assert!(!outcome.goal_credited);
        assert!(outcome.goal_error.is_some());
        let state = lock(&f.state);
        assert_eq!(state.feeds[&FeedScope::Home].store.posts()[0].id, outcome.post.id);
        assert!(!state.goal.as_ref().unwrap().completed);
        assert!(f.backend.rows(Table::GoalCompletions).is_empty());
    }

    #[tokio::test]
    async fn test_post_with_upload_credits_goal() {
        let f = fixture();
        lock(&f.state).goal = Some(goal(false));

        let outcome = f
            .coordinator
            .submit_post(PostDraft {
                body: String::new(),
                media: Some(MediaSource::Upload {
                    bytes: vec![1, 2, 3],
                    kind: MediaKind::Image,
                }),
                ..PostDraft::default()
            })
            .await
            .unwrap();

        assert!(outcome.goal_credited);
        let media = outcome.post.media.unwrap();
        assert_eq!(media.kind, MediaKind::Image);
        assert!(f.storage.contains(&media.path));
        assert!(lock(&f.state).goal.as_ref().unwrap().completed);

        let err = f
            .coordinator
            .submit_post(PostDraft {
                body: "again".into(),
                ..PostDraft::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err, MutationError::Validation(ValidationError::GoalAlreadyCompleted));
    }

    #[tokio::test]
    async fn test_edit_merges_in_place() {
        let f = fixture();
        f.backend.seed(
            Table::Posts,
            [json!({ "id": 2, "userId": "me", "body": "draft", "created_at": "2024-05-01T00:05:00Z" })],
        );
        {
            let mut state = lock(&f.state);
            let store = &mut state.feeds.get_mut(&FeedScope::Home).unwrap().store;
            let mut mine = crate::feed::store::tests::post(2, 5);
            mine.author_id = UserId::new("me");
            store.prepend(mine);
            store.prepend(crate::feed::store::tests::post(3, 10));
        }

        f.coordinator
            .submit_post(PostDraft {
                id: Some(PostId(2)),
                body: "edited".into(),
                media: None,
            })
            .await
            .unwrap();

        let state = lock(&f.state);
        let store = &state.feeds[&FeedScope::Home].store;
        assert_eq!(store.ids(), vec![PostId(3), PostId(2), PostId(1)]);
        assert_eq!(store.get(PostId(2)).unwrap().body, "edited");
        assert_eq!(f.backend.rows(Table::Posts).len(), 2);
    }

    #[tokio::test]
    async fn test_edit_of_other_users_post_rejected() {
        let f = fixture();
        let err = f
            .coordinator
            .submit_post(PostDraft {
                id: Some(PostId(1)),
                body: "mine now".into(),
                media: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err, MutationError::Validation(ValidationError::NotPermitted));
    }

    #[tokio::test]
    async fn test_delete_post_of_other_user_rejected() {
        let f = fixture();
        let err = f.coordinator.delete_post(PostId(1)).await.unwrap_err();
        assert_eq!(err, MutationError::Validation(ValidationError::NotPermitted));
        assert_eq!(f.backend.rows(Table::Posts).len(), 1);
    }
}
