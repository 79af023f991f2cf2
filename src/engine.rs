// SPDX-License-Identifier: MPL-2.0

//! Wires the change-event bus, the feed sessions and the mutation
//! coordinator to one backend for the signed-in user.

use crate::backend::{
    Backend, BackendError, ChangeKind, Filter, ObjectStorage, Query, SubscriptionSpec, Table,
    decode,
};
use crate::cache::{CacheDb, CacheError, FeedCache, FeedState};
use crate::config::{CACHE_MAX_AGE_SECS, RESUBSCRIBE_MAX_ATTEMPTS};
use crate::events::{ChangeEvent, ChangeEventBus, SubscriptionError};
use crate::feed::{
    COMMENT_SELECT, CountOutcome, FeedScope, FeedSession, FetchMark, POST_SELECT, PageCursor,
    PageMode, PageState, PostThread, Prepended,
};
use crate::goals::GoalTracker;
use crate::model::{
    Comment, CommentId, Like, MediaRef, Notification, Post, PostId, PostPatch, Score, UserId,
    UserProfile,
};
use crate::mutation::{MutationOptions, OptimisticMutationCoordinator};
use crate::notifications::NotificationService;
use crate::score::ScoreService;
use crate::session::SessionEvent;
use crate::state::{SharedState, SyncSettings, SyncState, lock, set_liked};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

/// Count fetches per refresh while comment changes keep racing them.
const COUNT_REFRESH_ROUNDS: usize = 3;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Subscription(#[from] SubscriptionError),
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
    #[error("not signed in")]
    SignedOut,
    #[error("feed {0} is not open")]
    FeedClosed(String),
    #[error("session changed while the request was in flight")]
    Stale,
}

/// Work an event leaves behind for after the state lock is released.
#[derive(Debug)]
enum FollowUp {
    PostAuthor(PostId, UserId),
    CommentAuthor(CommentId, UserId),
    RefreshCounts,
}

/// The sync engine for one client.
///
/// Change events and user mutations both land in [`SyncState`]; neither
/// path holds the state lock across a backend call, so their effects
/// interleave only at suspension points.
pub struct SyncEngine {
    backend: Arc<dyn Backend>,
    storage: Arc<dyn ObjectStorage>,
    settings: SyncSettings,
    state: SharedState,
    bus: ChangeEventBus,
    mutations: OptimisticMutationCoordinator,
    scores: Arc<ScoreService>,
    goals: GoalTracker,
    notifications: NotificationService,
    profiles: Mutex<HashMap<UserId, UserProfile>>,
    cache: Mutex<Option<CacheDb>>,
    disk_cache: bool,
}

impl SyncEngine {
    pub fn new(
        backend: Arc<dyn Backend>,
        storage: Arc<dyn ObjectStorage>,
        settings: SyncSettings,
    ) -> Self {
        let state: SharedState = Arc::new(Mutex::new(SyncState::default()));
        let scores = Arc::new(ScoreService::new(backend.clone()));
        let mutations = OptimisticMutationCoordinator::new(
            backend.clone(),
            storage.clone(),
            state.clone(),
            scores.clone(),
            MutationOptions::from(&settings),
        );
        Self {
            bus: ChangeEventBus::new(backend.clone()),
            goals: GoalTracker::new(backend.clone(), settings.day_boundary),
            notifications: NotificationService::new(backend.clone()),
            backend,
            storage,
            settings,
            state,
            mutations,
            scores,
            profiles: Mutex::new(HashMap::new()),
            cache: Mutex::new(None),
            disk_cache: false,
        }
    }

    /// Keep a per-user feed snapshot in the data directory.
    pub fn with_disk_cache(mut self) -> Self {
        self.disk_cache = true;
        self
    }

    /// Use `db` for feed snapshots until the next sign-out.
    pub fn attach_cache(&self, db: CacheDb) {
        *self.cache_slot() = Some(db);
    }

    fn cache_slot(&self) -> MutexGuard<'_, Option<CacheDb>> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn cache_db(&self) -> Option<CacheDb> {
        self.cache_slot().clone()
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub fn mutations(&self) -> &OptimisticMutationCoordinator {
        &self.mutations
    }

    pub fn bus(&self) -> &ChangeEventBus {
        &self.bus
    }

    pub fn state(&self) -> SharedState {
        self.state.clone()
    }

    /// Read the current state under the lock.
    pub fn with_state<R>(&self, f: impl FnOnce(&SyncState) -> R) -> R {
        f(&lock(&self.state))
    }

    /// Posts of an open feed, in display order.
    pub fn snapshot(&self, scope: &FeedScope) -> Option<Vec<Post>> {
        lock(&self.state)
            .feeds
            .get(scope)
            .map(|session| session.store.posts().to_vec())
    }

    pub fn page_state(&self, scope: &FeedScope) -> Option<PageState> {
        lock(&self.state)
            .feeds
            .get(scope)
            .map(|session| session.pages.state())
    }

    pub fn media_url(&self, media: &MediaRef) -> Result<Url, BackendError> {
        self.storage.public_url(&media.path)
    }

    // Session lifecycle

    pub async fn handle_session(&self, event: SessionEvent) -> Result<(), SyncError> {
        match event {
            SessionEvent::SignedIn(user) => self.start(user).await,
            SessionEvent::SignedOut => {
                self.stop();
                Ok(())
            }
        }
    }

    /// Start syncing for `user`: subscribe, load the home feed, then the
    /// goal status and notification list.
    ///
    /// Subscriptions are opened before the first fetch so that nothing
    /// inserted in between is missed; posts seen both ways merge by id.
    pub async fn start(&self, user: UserId) -> Result<(), SyncError> {
        self.bus.teardown();
        lock(&self.state).reset(Some(user.clone()));

        if self.disk_cache {
            match CacheDb::open(&user) {
                Ok(db) => {
                    if let Err(e) = db.cleanup_stale(CACHE_MAX_AGE_SECS) {
                        warn!(error = %e, "feed cache cleanup failed");
                    }
                    self.attach_cache(db);
                }
                Err(e) => warn!(%user, error = %e, "feed cache unavailable"),
            }
        }

        self.subscribe_all(&user)?;
        info!(%user, "sync started");

        self.open_feed(FeedScope::Home).await?;
        if let Err(e) = self.refresh_goal().await {
            warn!(error = %e, "goal status not loaded");
        }
        if let Err(e) = self.refresh_notifications().await {
            warn!(error = %e, "notifications not loaded");
        }
        Ok(())
    }

    /// Tear down every subscription and drop everything held for the user.
    /// Work still in flight is discarded when it resolves.
    pub fn stop(&self) {
        if let Err(e) = self.save_cache() {
            warn!(error = %e, "feed snapshot not saved on sign-out");
        }
        let specs = self.bus.teardown();
        self.cache_slot().take();
        self.profiles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        lock(&self.state).reset(None);
        info!(subscriptions = specs.len(), "sync stopped");
    }

    fn subscribe_all(&self, user: &UserId) -> Result<(), SubscriptionError> {
        let specs = [
            SubscriptionSpec::all(Table::Posts),
            SubscriptionSpec::all(Table::PostLikes),
            SubscriptionSpec::all(Table::Comments),
            SubscriptionSpec::new(Table::Notifications, [ChangeKind::Insert])
                .with_filter(Filter::eq("receiverId", user)),
        ];
        for spec in specs {
            self.bus.subscribe(spec)?;
        }
        Ok(())
    }

    // Feeds

    /// Mount a feed. A cached snapshot is shown first when one exists, then
    /// refreshed; otherwise the first page is fetched.
    pub async fn open_feed(&self, scope: FeedScope) -> Result<PageState, SyncError> {
        let cached = self.cached_feed(&scope);
        let warm = {
            let mut state = lock(&self.state);
            if state.user().is_none() {
                return Err(SyncError::SignedOut);
            }
            if let Some(session) = state.feeds.get(&scope) {
                return Ok(session.pages.state());
            }
            let mut session = FeedSession::new(
                scope.clone(),
                self.settings.page_mode,
                self.settings.page_increment,
                self.settings.exhaustion,
            );
            let warm = cached.is_some();
            if let Some((posts, saved)) = cached {
                session.store.reload(posts);
                session.store.set_exhausted(saved.exhausted);
                session
                    .pages
                    .restore(saved.requested_limit, saved.cursor, saved.exhausted);
            }
            state.feeds.insert(scope.clone(), session);
            warm
        };

        if warm {
            debug!(feed = %scope.cache_key(), "warm start from cache");
            self.refresh_feed(&scope).await?;
            Ok(self.page_state(&scope).unwrap_or(PageState::Idle))
        } else {
            self.load_more(&scope).await
        }
    }

    /// Unmount a feed. Its pagination state goes with it.
    pub fn close_feed(&self, scope: &FeedScope) {
        self.save_feed_quietly(scope);
        lock(&self.state).feeds.remove(scope);
    }

    /// Scroll threshold reached: fetch the next page unless one is running
    /// or the feed is exhausted.
    pub async fn load_more(&self, scope: &FeedScope) -> Result<PageState, SyncError> {
        let (request, generation) = {
            let mut state = lock(&self.state);
            let generation = state.generation();
            let session = state
                .feeds
                .get_mut(scope)
                .ok_or_else(|| SyncError::FeedClosed(scope.cache_key()))?;
            match session.pages.begin() {
                Some(request) => (request, generation),
                None => return Ok(session.pages.state()),
            }
        };

        let fetched = self.fetch_posts(scope.page_query(&request)).await;

        let page_state = {
            let mut state = lock(&self.state);
            if !state.is_current(generation) {
                return Err(SyncError::Stale);
            }
            let mut posts = match fetched {
                Ok(posts) => posts,
                Err(e) => {
                    if let Some(session) = state.feeds.get_mut(scope) {
                        session.pages.fail(&request);
                    }
                    warn!(feed = %scope.cache_key(), error = %e, "page fetch failed");
                    return Err(e.into());
                }
            };
            keep_pending_likes(&state, &mut posts);
            let session = state
                .feeds
                .get_mut(scope)
                .ok_or_else(|| SyncError::FeedClosed(scope.cache_key()))?;
            let page_state = session.pages.complete(&request, &mut session.store, posts);
            if session.pages.mode() == PageMode::GrowingLimit {
                // A replace-all page carries fresh counts.
                session.counts.reset();
            }
            page_state
        };

        self.save_feed_quietly(scope);
        Ok(page_state)
    }

    /// Re-read the window a feed already shows and replace it, keeping the
    /// pagination position. Heals whatever was missed while the change
    /// stream was down.
    pub async fn refresh_feed(&self, scope: &FeedScope) -> Result<(), SyncError> {
        let (window, generation) = {
            let state = lock(&self.state);
            let session = state
                .feeds
                .get(scope)
                .ok_or_else(|| SyncError::FeedClosed(scope.cache_key()))?;
            let held = session.store.len();
            let window = match session.pages.mode() {
                PageMode::GrowingLimit => session.pages.limit().max(held),
                PageMode::Cursor => held,
            };
            (window.max(self.settings.page_increment), state.generation())
        };

        let mut posts = self.fetch_posts(scope.window_query(window)).await?;

        {
            let mut state = lock(&self.state);
            if !state.is_current(generation) {
                return Err(SyncError::Stale);
            }
            keep_pending_likes(&state, &mut posts);
            let Some(session) = state.feeds.get_mut(scope) else {
                return Ok(());
            };
            let cursor = match session.pages.mode() {
                PageMode::Cursor => posts.iter().map(PageCursor::of).min(),
                PageMode::GrowingLimit => None,
            };
            let exhausted = session.store.is_exhausted();
            session.store.reload(posts);
            session.pages.restore(window, cursor, exhausted);
            session.counts.reset();
            debug!(feed = %scope.cache_key(), held = session.store.len(), "feed refreshed");
        }

        self.save_feed_quietly(scope);
        Ok(())
    }

    /// Overwrite comment counts and like lists of every held post with a
    /// fresh read. Returns how many held copies were updated.
    pub async fn refresh_counts(&self) -> Result<usize, SyncError> {
        let mut touched = self.refresh_counts_once().await?;
        for _ in 1..COUNT_REFRESH_ROUNDS {
            let raced = lock(&self.state)
                .feeds
                .values()
                .any(|s| s.counts.refetch_requested());
            if !raced {
                break;
            }
            debug!("comment changes landed during count refresh, refetching");
            touched = self.refresh_counts_once().await?;
        }
        Ok(touched)
    }

    async fn refresh_counts_once(&self) -> Result<usize, SyncError> {
        let (ids, marks, generation) = {
            let state = lock(&self.state);
            let mut ids: Vec<PostId> = state
                .feeds
                .values()
                .flat_map(|session| session.store.ids())
                .collect();
            ids.extend(state.thread.as_ref().map(PostThread::post_id));
            ids.sort();
            ids.dedup();
            let marks: HashMap<FeedScope, FetchMark> = state
                .feeds
                .iter()
                .map(|(scope, session)| (scope.clone(), session.counts.mark()))
                .collect();
            (ids, marks, state.generation())
        };
        if ids.is_empty() {
            return Ok(0);
        }

        let query = Query::on(Table::Posts)
            .select(POST_SELECT)
            .filter(Filter::is_in("id", ids.iter().copied()));
        let fetched = self.fetch_posts(query).await?;

        let mut state = lock(&self.state);
        if !state.is_current(generation) {
            return Err(SyncError::Stale);
        }
        let pending: HashSet<PostId> = fetched
            .iter()
            .map(|p| p.id)
            .filter(|id| state.post_has_pending_likes(*id))
            .collect();

        let mut touched = 0;
        for (scope, session) in state.feeds.iter_mut() {
            let mark = marks
                .get(scope)
                .copied()
                .unwrap_or_else(|| session.counts.mark());
            touched += session.counts.apply_fetch(&mut session.store, &fetched, mark, |id| {
                pending.contains(&id)
            });
        }
        if let Some(post) = state.thread.as_mut().and_then(|t| t.post_mut())
            && let Some(source) = fetched.iter().find(|p| p.id == post.id)
        {
            post.comment_count = source.comment_count;
            if !pending.contains(&post.id) {
                post.likes = source.likes.clone();
            }
            touched += 1;
        }
        debug!(touched, "counts refreshed");
        Ok(touched)
    }

    async fn fetch_posts(&self, query: Query) -> Result<Vec<Post>, BackendError> {
        let rows = self.backend.query(query).await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| match decode::<Post>(row) {
                Ok(post) => Some(post),
                Err(e) => {
                    warn!(error = %e, "skipping malformed post row");
                    None
                }
            })
            .collect())
    }

    // Post thread

    /// Open the detail view of a post: the post and its comments.
    pub async fn open_thread(&self, post_id: PostId) -> Result<(), SyncError> {
        let generation = {
            let mut state = lock(&self.state);
            if state.user().is_none() {
                return Err(SyncError::SignedOut);
            }
            state.thread = Some(PostThread::new(post_id));
            state.generation()
        };

        let post = self
            .fetch_posts(
                Query::on(Table::Posts)
                    .select(POST_SELECT)
                    .eq("id", post_id)
                    .limit(1),
            )
            .await?
            .into_iter()
            .next();
        let rows = self
            .backend
            .query(
                Query::on(Table::Comments)
                    .select(COMMENT_SELECT)
                    .eq("postId", post_id)
                    .order("created_at", true),
            )
            .await?;
        let mut comments: Vec<Comment> = rows
            .into_iter()
            .filter_map(|row| {
                decode(row)
                    .map_err(|e| warn!(post = %post_id, error = %e, "skipping malformed comment row"))
                    .ok()
            })
            .collect();

        let mut state = lock(&self.state);
        if !state.is_current(generation) {
            return Err(SyncError::Stale);
        }
        let local_likes = state
            .post_has_pending_likes(post_id)
            .then(|| state.find_post(post_id).map(|p| p.likes.clone()))
            .flatten();
        let Some(thread) = state.thread.as_mut().filter(|t| t.post_id() == post_id) else {
            return Ok(());
        };
        // Comments that arrived live while the fetch was running.
        for live in thread.comments() {
            if !comments.iter().any(|c| c.id == live.id) {
                comments.push(live.clone());
            }
        }
        let post = post.map(|mut post| {
            if let Some(likes) = local_likes {
                post.likes = likes;
            }
            post
        });
        thread.load(post, comments);
        debug!(post = %post_id, comments = thread.comments().len(), "thread loaded");
        Ok(())
    }

    pub fn close_thread(&self) {
        lock(&self.state).thread = None;
    }

    // Goal, notifications, leaderboard

    pub async fn refresh_goal(&self) -> Result<(), SyncError> {
        let (user, generation) = {
            let state = lock(&self.state);
            let user = state.user().cloned().ok_or(SyncError::SignedOut)?;
            (user, state.generation())
        };
        let status = self.goals.status(&user, Utc::now()).await?;
        let mut state = lock(&self.state);
        if !state.is_current(generation) {
            return Err(SyncError::Stale);
        }
        state.goal = status;
        Ok(())
    }

    pub async fn refresh_notifications(&self) -> Result<(), SyncError> {
        let (user, generation) = {
            let state = lock(&self.state);
            let user = state.user().cloned().ok_or(SyncError::SignedOut)?;
            (user, state.generation())
        };
        let items = self.notifications.fetch(&user).await?;
        let mut state = lock(&self.state);
        if !state.is_current(generation) {
            return Err(SyncError::Stale);
        }
        state.notifications.load(items);
        Ok(())
    }

    pub fn unread_notifications(&self) -> u32 {
        lock(&self.state).notifications.unread()
    }

    /// The user opened the notification list.
    pub fn mark_notifications_seen(&self) {
        lock(&self.state).notifications.mark_seen();
    }

    pub fn set_foreground(&self, foreground: bool) {
        lock(&self.state).notifications.set_foreground(foreground);
    }

    pub async fn leaderboard(&self, limit: Option<usize>) -> Result<Vec<Score>, SyncError> {
        Ok(self.scores.leaderboard(limit).await?)
    }

    // Change events

    /// Handle every event already queued, without waiting for more.
    /// Returns how many events were applied.
    pub async fn pump(&self) -> usize {
        let mut handled = 0;
        while let Some(result) = self.bus.try_next_event() {
            match result {
                Ok(event) => {
                    self.handle_event(&event).await;
                    handled += 1;
                }
                Err(e) => self.on_subscription_error(e).await,
            }
        }
        handled
    }

    /// Handle events as they arrive until `shutdown` resolves.
    pub async fn run_until(&self, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                result = self.bus.next_event() => match result {
                    Ok(event) => self.handle_event(&event).await,
                    Err(SubscriptionError::Closed) => break,
                    Err(e) => self.on_subscription_error(e).await,
                },
            }
        }
        debug!("event loop finished");
    }

    async fn on_subscription_error(&self, error: SubscriptionError) {
        if !error.is_retriable() {
            warn!(error = %error, "change stream error");
            return;
        }
        warn!(error = %error, "change stream dropped, resubscribing");
        if let Err(e) = self.resubscribe().await {
            warn!(error = %e, "resubscribe failed");
        }
    }

    /// Tear down every subscription and open them again with exponential
    /// backoff, then refresh what is held to cover the gap.
    pub async fn resubscribe(&self) -> Result<(), SyncError> {
        let specs = self.bus.teardown();
        if specs.is_empty() {
            return Ok(());
        }
        let generation = lock(&self.state).generation();

        let mut attempt = 0;
        loop {
            tokio::time::sleep(self.settings.resubscribe_delay(attempt)).await;
            if !lock(&self.state).is_current(generation) {
                return Err(SyncError::Stale);
            }
            let result = specs
                .iter()
                .try_for_each(|spec| self.bus.subscribe(spec.clone()).map(drop));
            match result {
                Ok(()) => break,
                Err(e) if e.is_retriable() && attempt + 1 < RESUBSCRIBE_MAX_ATTEMPTS => {
                    warn!(attempt, error = %e, "resubscribe attempt failed");
                    self.bus.teardown();
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
        info!(subscriptions = specs.len(), attempts = attempt + 1, "resubscribed");

        let scopes: Vec<FeedScope> = lock(&self.state).feeds.keys().cloned().collect();
        for scope in &scopes {
            self.refresh_feed(scope).await?;
        }
        let thread = lock(&self.state).thread.as_ref().map(PostThread::post_id);
        if let Some(post_id) = thread {
            self.open_thread(post_id).await?;
        }
        Ok(())
    }

    /// Apply one change event to the held state.
    pub async fn handle_event(&self, event: &ChangeEvent) {
        let (follow_ups, generation) = {
            let mut state = lock(&self.state);
            if state.user().is_none() {
                debug!(table = %event.table, "event while signed out, dropped");
                return;
            }
            (apply_event(&mut state, event), state.generation())
        };
        for follow_up in follow_ups {
            self.follow_up(follow_up, generation).await;
        }
    }

    async fn follow_up(&self, follow_up: FollowUp, generation: u64) {
        match follow_up {
            FollowUp::PostAuthor(post_id, user) => {
                let Some(profile) = self.profile(&user).await else {
                    return;
                };
                let mut state = lock(&self.state);
                if state.is_current(generation) {
                    state.update_post(post_id, |post| {
                        if post.author.is_none() {
                            post.author = Some(profile.clone());
                        }
                    });
                }
            }
            FollowUp::CommentAuthor(comment_id, user) => {
                let Some(profile) = self.profile(&user).await else {
                    return;
                };
                let mut state = lock(&self.state);
                if state.is_current(generation)
                    && let Some(thread) = state.thread.as_mut()
                {
                    thread.patch_author(comment_id, profile);
                }
            }
            FollowUp::RefreshCounts => {
                let wanted = {
                    let state = lock(&self.state);
                    state.is_current(generation)
                        && (state.thread.is_some()
                            || state.feeds.values().any(|s| s.counts.refetch_requested()))
                };
                if wanted && let Err(e) = self.refresh_counts().await {
                    warn!(error = %e, "count refresh failed");
                }
            }
        }
    }

    /// Profile for author enrichment. Failures leave the author absent.
    async fn profile(&self, user: &UserId) -> Option<UserProfile> {
        if let Some(profile) = self
            .profiles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(user)
        {
            return Some(profile.clone());
        }
        let rows = self
            .backend
            .query(
                Query::on(Table::Users)
                    .select("id, name, image")
                    .eq("id", user)
                    .limit(1),
            )
            .await
            .map_err(|e| debug!(%user, error = %e, "profile lookup failed"))
            .ok()?;
        let profile: UserProfile = rows.into_iter().next().and_then(|row| decode(row).ok())?;
        self.profiles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(user.clone(), profile.clone());
        Some(profile)
    }

    // Cache

    fn cached_feed(&self, scope: &FeedScope) -> Option<(Vec<Post>, FeedState)> {
        let db = self.cache_db()?;
        let cache = FeedCache::new(&db);
        let key = scope.cache_key();
        let result = cache
            .get_state(&key)
            .and_then(|state| Ok((cache.load(&key)?, state)));
        match result {
            Ok((posts, Some(state))) if !posts.is_empty() => Some((posts, state)),
            Ok(_) => None,
            Err(e) => {
                warn!(feed = %key, error = %e, "ignoring unreadable feed cache");
                None
            }
        }
    }

    /// Save every open feed to the cache, if one is attached.
    pub fn save_cache(&self) -> Result<(), SyncError> {
        let Some(db) = self.cache_db() else {
            return Ok(());
        };
        let snapshots: Vec<_> = lock(&self.state).feeds.values().map(cache_snapshot).collect();
        let cache = FeedCache::new(&db);
        for (key, posts, feed_state) in &snapshots {
            cache.store_snapshot(key, posts)?;
            cache.set_state(key, feed_state)?;
        }
        Ok(())
    }

    fn save_feed_quietly(&self, scope: &FeedScope) {
        let Some(db) = self.cache_db() else {
            return;
        };
        let Some((key, posts, feed_state)) = lock(&self.state).feeds.get(scope).map(cache_snapshot)
        else {
            return;
        };
        let cache = FeedCache::new(&db);
        if let Err(e) = cache
            .store_snapshot(&key, &posts)
            .and_then(|()| cache.set_state(&key, &feed_state))
        {
            warn!(feed = %key, error = %e, "feed snapshot not saved");
        }
    }
}

fn cache_snapshot(session: &FeedSession) -> (String, Vec<Post>, FeedState) {
    (
        session.scope.cache_key(),
        session.store.posts().to_vec(),
        FeedState {
            requested_limit: session.pages.limit(),
            cursor: session.pages.cursor(),
            exhausted: session.store.is_exhausted(),
            last_refresh_at: None,
        },
    )
}

/// Fetched posts with an unresolved like write keep the local like list.
fn keep_pending_likes(state: &SyncState, posts: &mut [Post]) {
    for post in posts {
        if state.post_has_pending_likes(post.id)
            && let Some(held) = state.find_post(post.id)
        {
            post.likes = held.likes.clone();
        }
    }
}

fn apply_event(state: &mut SyncState, event: &ChangeEvent) -> Vec<FollowUp> {
    match event.table {
        Table::Posts => apply_post_event(state, event),
        Table::PostLikes => {
            apply_like_event(state, event);
            Vec::new()
        }
        Table::Comments => apply_comment_event(state, event),
        Table::Notifications => {
            apply_notification_event(state, event);
            Vec::new()
        }
        table => {
            debug!(%table, "no handler for table");
            Vec::new()
        }
    }
}

fn apply_post_event(state: &mut SyncState, event: &ChangeEvent) -> Vec<FollowUp> {
    match event.kind {
        ChangeKind::Insert => {
            let post: Post = match event.decode_after() {
                Ok(post) => post,
                Err(e) => {
                    warn!(error = %e, "ignoring undecodable post insert");
                    return Vec::new();
                }
            };
            let mut inserted = false;
            for session in state.feeds.values_mut() {
                if session.store.contains(post.id) || session.scope.admits(&post) {
                    inserted |= session.store.prepend(post.clone()) == Prepended::Inserted;
                }
            }
            debug!(post = %post.id, inserted, "post insert applied");
            let needs_author = state.find_post(post.id).is_some_and(|p| p.author.is_none());
            if needs_author {
                vec![FollowUp::PostAuthor(post.id, post.author_id)]
            } else {
                Vec::new()
            }
        }
        ChangeKind::Update => {
            let (Some(id), Some(row)) = (event.column_i64("id"), event.after.as_ref()) else {
                return Vec::new();
            };
            let patch = PostPatch::from_row(row);
            let touched = state.update_post(PostId(id), |post| patch.clone().apply(post));
            debug!(post = id, touched, "post update applied");
            Vec::new()
        }
        ChangeKind::Delete => {
            let Some(id) = event.column_i64("id").map(PostId) else {
                warn!("post delete without id");
                return Vec::new();
            };
            for session in state.feeds.values_mut() {
                session.store.remove_by_id(id);
            }
            if state.thread.as_ref().is_some_and(|t| t.post_id() == id) {
                state.thread = None;
            }
            Vec::new()
        }
    }
}

fn apply_like_event(state: &mut SyncState, event: &ChangeEvent) {
    let (Some(user), Some(post_id)) = (event.column_str("userId"), event.column_i64("postId"))
    else {
        warn!(kind = event.kind.as_str(), "like event without its key");
        return;
    };
    let like = Like::new(UserId::new(user), PostId(post_id));
    if let Some(correlation) = state.like_writes(&like).last() {
        debug!(post = post_id, %correlation, "like event for an unresolved local write, skipped");
        return;
    }

    let mut applied = 0;
    for session in state.feeds.values_mut() {
        if session.counts.like_changed(&mut session.store, event.kind, &like) == CountOutcome::Applied {
            applied += 1;
        }
    }
    if let Some(post) = state
        .thread
        .as_mut()
        .and_then(|t| t.post_mut())
        .filter(|p| p.id == like.post_id)
    {
        set_liked(post, &like, event.kind != ChangeKind::Delete);
    }
    debug!(post = post_id, applied, kind = event.kind.as_str(), "like event applied");
}

fn apply_comment_event(state: &mut SyncState, event: &ChangeEvent) -> Vec<FollowUp> {
    match event.kind {
        ChangeKind::Insert => {
            let comment: Comment = match event.decode_after() {
                Ok(comment) => comment,
                Err(e) => {
                    warn!(error = %e, "ignoring undecodable comment insert");
                    return Vec::new();
                }
            };
            for session in state.feeds.values_mut() {
                session
                    .counts
                    .comment_inserted(&mut session.store, comment.id, comment.post_id);
            }
            let Some(thread) = state
                .thread
                .as_mut()
                .filter(|t| t.post_id() == comment.post_id)
            else {
                return Vec::new();
            };
            let follow_up = comment
                .author
                .is_none()
                .then(|| FollowUp::CommentAuthor(comment.id, comment.author_id.clone()));
            if thread.insert_comment(comment)
                && let Some(post) = thread.post_mut()
            {
                post.comment_count += 1;
            }
            follow_up.into_iter().collect()
        }
        ChangeKind::Update => {
            if let Ok(comment) = event.decode_after::<Comment>()
                && let Some(thread) = state.thread.as_mut()
                && thread.comments().iter().any(|c| c.id == comment.id)
            {
                thread.insert_comment(comment);
            }
            Vec::new()
        }
        ChangeKind::Delete => {
            let Some(id) = event.column_i64("id").map(CommentId) else {
                warn!("comment delete without id");
                return Vec::new();
            };
            let post_id = event.column_i64("postId").map(PostId);
            for session in state.feeds.values_mut() {
                session.counts.comment_deleted(&mut session.store, id, post_id);
            }
            if let Some(thread) = state.thread.as_mut()
                && thread.remove_comment(id).is_some()
                && let Some(post) = thread.post_mut()
            {
                post.comment_count = post.comment_count.saturating_sub(1);
            }
            vec![FollowUp::RefreshCounts]
        }
    }
}

fn apply_notification_event(state: &mut SyncState, event: &ChangeEvent) {
    if event.kind != ChangeKind::Insert {
        return;
    }
    let notification: Notification = match event.decode_after() {
        Ok(notification) => notification,
        Err(e) => {
            warn!(error = %e, "ignoring undecodable notification");
            return;
        }
    };
    if state.user() != Some(&notification.receiver_id) {
        return;
    }
    let counted = state.notifications.received(notification);
    debug!(counted, unread = state.notifications.unread(), "notification received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DeletePayload, MemoryBackend, MemoryStorage, Operation};
    use crate::goals::DayBoundary;
    use crate::model::GoalKind;
    use crate::mutation::PostDraft;
    use chrono::{Duration, TimeZone};
    use serde_json::{Value, json};

    fn ts(minutes: i64) -> String {
        (Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap() + Duration::minutes(minutes))
            .to_rfc3339()
    }

    fn backend(posts: i64) -> Arc<MemoryBackend> {
        let backend = Arc::new(MemoryBackend::new());
        backend.seed(
            Table::Users,
            [
                json!({ "id": "author", "name": "Ada" }),
                json!({ "id": "me", "name": "Me" }),
                json!({ "id": "u-2", "name": "Bo" }),
            ],
        );
        backend.seed(
            Table::Posts,
            (1..=posts).map(|i| {
                json!({ "id": i, "userId": "author", "body": format!("post {i}"), "created_at": ts(i * 10) })
            }),
        );
        backend
    }

    async fn start(backend: &Arc<MemoryBackend>, settings: SyncSettings) -> Arc<SyncEngine> {
        let storage = Arc::new(MemoryStorage::new(Url::parse("https://example.test").unwrap()));
        let engine = Arc::new(SyncEngine::new(backend.clone(), storage, settings));
        engine.start(UserId::new("me")).await.unwrap();
        engine
    }

    fn home(engine: &SyncEngine) -> Vec<i64> {
        engine
            .snapshot(&FeedScope::Home)
            .unwrap()
            .iter()
            .map(|p| p.id.0)
            .collect()
    }

    fn home_post(engine: &SyncEngine, id: i64) -> Post {
        engine
            .snapshot(&FeedScope::Home)
            .unwrap()
            .into_iter()
            .find(|p| p.id.0 == id)
            .unwrap()
    }

    fn thread_ids(engine: &SyncEngine) -> Vec<i64> {
        engine.with_state(|s| {
            s.thread
                .as_ref()
                .unwrap()
                .comments()
                .iter()
                .map(|c| c.id.0)
                .collect()
        })
    }

    fn comment(id: i64, post: i64, minutes: i64) -> Value {
        json!({ "id": id, "postId": post, "userId": "u-2", "text": format!("c{id}"), "created_at": ts(minutes) })
    }

    #[tokio::test]
    async fn test_start_loads_first_page_and_subscribes() {
        let backend = backend(6);
        let engine = start(&backend, SyncSettings::default()).await;

        assert_eq!(home(&engine), vec![6, 5, 4, 3]);
        assert_eq!(backend.subscriber_count(), 4);
        assert_eq!(engine.page_state(&FeedScope::Home), Some(PageState::Idle));
        let author = home_post(&engine, 6).author.unwrap();
        assert_eq!(author.name.as_deref(), Some("Ada"));
    }

    #[tokio::test]
    async fn test_live_insert_is_prepended_regardless_of_created_at() {
        let backend = backend(4);
        let engine = start(&backend, SyncSettings::default()).await;

        backend
            .insert(
                Table::Posts,
                json!({ "userId": "u-2", "body": "late", "created_at": ts(-100) }),
            )
            .await
            .unwrap();
        assert_eq!(engine.pump().await, 1);

        assert_eq!(home(&engine), vec![5, 4, 3, 2, 1]);
        let author = home_post(&engine, 5).author.unwrap();
        assert_eq!(author.name.as_deref(), Some("Bo"));
    }

    #[tokio::test]
    async fn test_duplicate_insert_event_is_idempotent() {
        let backend = backend(4);
        let engine = start(&backend, SyncSettings::default()).await;
        let payload = json!({
            "eventType": "INSERT",
            "table": "posts",
            "new": { "id": 9, "userId": "u-2", "body": "dup", "created_at": ts(200) },
            "old": {}
        });

        backend.emit_raw(Table::Posts, payload.clone());
        backend.emit_raw(Table::Posts, payload);
        assert_eq!(engine.pump().await, 2);

        assert_eq!(home(&engine), vec![9, 4, 3, 2, 1]);
    }

    #[tokio::test]
    async fn test_update_and_key_only_delete() {
        let backend = backend(4);
        let engine = start(&backend, SyncSettings::default()).await;
        backend.set_delete_payload(DeletePayload::KeyOnly);

        backend
            .update(Table::Posts, vec![Filter::eq("id", 2)], json!({ "body": "edited" }))
            .await
            .unwrap();
        backend
            .delete(Table::Posts, vec![Filter::eq("id", 3)])
            .await
            .unwrap();
        engine.pump().await;

        assert_eq!(home(&engine), vec![4, 2, 1]);
        let edited = home_post(&engine, 2);
        assert_eq!(edited.body, "edited");
        assert_eq!(edited.author.unwrap().name.as_deref(), Some("Ada"));
    }

    #[tokio::test]
    async fn test_comment_delete_refetch_overrides_local_count() {
        let backend = backend(2);
        backend.seed(Table::Comments, [comment(100, 1, 1), comment(101, 1, 2)]);
        let engine = start(&backend, SyncSettings::default()).await;
        assert_eq!(home_post(&engine, 1).comment_count, 2);

        backend
            .insert(Table::Comments, json!({ "postId": 1, "userId": "u-2", "text": "c" }))
            .await
            .unwrap();
        engine.pump().await;
        assert_eq!(home_post(&engine, 1).comment_count, 3);

        // Two inserts the client never hears about.
        backend.mute_events(true);
        for text in ["x", "y"] {
            backend
                .insert(Table::Comments, json!({ "postId": 1, "userId": "u-2", "text": text }))
                .await
                .unwrap();
        }
        backend.mute_events(false);

        backend
            .delete(Table::Comments, vec![Filter::eq("id", 100)])
            .await
            .unwrap();
        engine.pump().await;

        assert_eq!(home_post(&engine, 1).comment_count, 4);
    }

    #[tokio::test]
    async fn test_comment_insert_during_count_refresh_is_kept() {
        let backend = backend(2);
        backend.seed(Table::Comments, [comment(100, 1, 1)]);
        let engine = start(&backend, SyncSettings::default()).await;
        assert_eq!(home_post(&engine, 1).comment_count, 1);

        backend.hold_reads();
        let refresh = tokio::spawn({
            let engine = engine.clone();
            async move { engine.refresh_counts().await }
        });
        tokio::task::yield_now().await;

        backend.insert(Table::Comments, comment(101, 1, 2)).await.unwrap();
        engine.pump().await;
        assert_eq!(home_post(&engine, 1).comment_count, 2);

        // The held response still says one comment.
        backend.release_reads();
        refresh.await.unwrap().unwrap();
        assert_eq!(home_post(&engine, 1).comment_count, 2);
        assert!(!engine.with_state(|s| s.feeds.values().any(|f| f.counts.refetch_requested())));
    }

    #[tokio::test]
    async fn test_thread_tracks_comments() {
        let backend = backend(2);
        backend.seed(Table::Comments, [comment(100, 1, 1), comment(101, 1, 2)]);
        let engine = start(&backend, SyncSettings::default()).await;

        engine.open_thread(PostId(1)).await.unwrap();
        assert_eq!(thread_ids(&engine), vec![101, 100]);

        let row = backend
            .insert(Table::Comments, json!({ "postId": 1, "userId": "u-2", "text": "new" }))
            .await
            .unwrap();
        let new_id = row["id"].as_i64().unwrap();
        backend
            .insert(Table::Comments, json!({ "postId": 2, "userId": "u-2", "text": "elsewhere" }))
            .await
            .unwrap();
        engine.pump().await;

        assert_eq!(thread_ids(&engine), vec![new_id, 101, 100]);
        engine.with_state(|s| {
            let thread = s.thread.as_ref().unwrap();
            assert_eq!(thread.post().unwrap().comment_count, 3);
            let head = &thread.comments()[0];
            assert_eq!(head.author.as_ref().unwrap().name.as_deref(), Some("Bo"));
        });

        backend.set_delete_payload(DeletePayload::KeyOnly);
        backend
            .delete(Table::Comments, vec![Filter::eq("id", 101)])
            .await
            .unwrap();
        engine.pump().await;

        assert_eq!(thread_ids(&engine), vec![new_id, 100]);
        engine.with_state(|s| {
            assert_eq!(s.thread.as_ref().unwrap().post().unwrap().comment_count, 2);
        });
        assert_eq!(home_post(&engine, 1).comment_count, 2);
        assert_eq!(home_post(&engine, 2).comment_count, 1);
    }

    #[tokio::test]
    async fn test_own_like_event_is_not_applied_twice() {
        let backend = backend(2);
        let engine = start(&backend, SyncSettings::default()).await;

        assert!(engine.mutations().toggle_like(PostId(1)).await.unwrap());
        engine.pump().await;

        assert_eq!(home_post(&engine, 1).like_count(), 1);
        assert_eq!(backend.rows(Table::PostLikes).len(), 1);
    }

    #[tokio::test]
    async fn test_like_events_from_others_are_idempotent() {
        let backend = backend(2);
        let engine = start(&backend, SyncSettings::default()).await;

        backend
            .insert(Table::PostLikes, json!({ "userId": "u-2", "postId": 1 }))
            .await
            .unwrap();
        backend.emit_raw(
            Table::PostLikes,
            json!({ "eventType": "INSERT", "table": "postLikes", "new": { "userId": "u-2", "postId": 1 } }),
        );
        engine.pump().await;
        assert_eq!(home_post(&engine, 1).like_count(), 1);

        backend
            .delete(
                Table::PostLikes,
                vec![Filter::eq("userId", "u-2"), Filter::eq("postId", 1)],
            )
            .await
            .unwrap();
        engine.pump().await;
        assert_eq!(home_post(&engine, 1).like_count(), 0);
    }

    #[tokio::test]
    async fn test_rapid_double_toggle_converges_with_events() {
        let backend = backend(2);
        let engine = start(&backend, SyncSettings::default()).await;
        backend.hold_writes();

        let first = tokio::spawn({
            let engine = engine.clone();
            async move { engine.mutations().toggle_like(PostId(1)).await }
        });
        let second = tokio::spawn({
            let engine = engine.clone();
            async move { engine.mutations().toggle_like(PostId(1)).await }
        });
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        backend.release_writes();
        assert!(first.await.unwrap().unwrap());
        assert!(!second.await.unwrap().unwrap());

        engine.pump().await;
        assert_eq!(home_post(&engine, 1).like_count(), 0);
        assert!(backend.rows(Table::PostLikes).is_empty());
    }

    #[tokio::test]
    async fn test_growing_limit_exhausts_on_repeated_page() {
        let backend = backend(4);
        let settings = SyncSettings {
            page_mode: PageMode::GrowingLimit,
            ..SyncSettings::default()
        };
        let engine = start(&backend, settings).await;
        assert_eq!(engine.page_state(&FeedScope::Home), Some(PageState::Idle));

        let state = engine.load_more(&FeedScope::Home).await.unwrap();
        assert_eq!(state, PageState::Exhausted);

        // Exhausted feeds issue no further reads.
        backend.fail_next(Operation::Query, Table::Posts);
        let state = engine.load_more(&FeedScope::Home).await.unwrap();
        assert_eq!(state, PageState::Exhausted);
        assert_eq!(home(&engine), vec![4, 3, 2, 1]);
    }

    #[tokio::test]
    async fn test_cursor_pages_absorb_live_insert() {
        let backend = backend(10);
        let engine = start(&backend, SyncSettings::default()).await;
        assert_eq!(home(&engine), vec![10, 9, 8, 7]);

        backend
            .insert(
                Table::Posts,
                json!({ "userId": "u-2", "body": "old clock", "created_at": ts(-50) }),
            )
            .await
            .unwrap();
        engine.pump().await;
        assert_eq!(home(&engine), vec![11, 10, 9, 8, 7]);

        assert_eq!(engine.load_more(&FeedScope::Home).await.unwrap(), PageState::Idle);
        assert_eq!(home(&engine), vec![11, 10, 9, 8, 7, 6, 5, 4, 3]);

        assert_eq!(engine.load_more(&FeedScope::Home).await.unwrap(), PageState::Exhausted);
        assert_eq!(home(&engine), vec![11, 10, 9, 8, 7, 6, 5, 4, 3, 2, 1]);
    }

    #[tokio::test]
    async fn test_cursor_pages_keep_posts_sharing_a_timestamp() {
        let backend = backend(0);
        backend.seed(
            Table::Posts,
            [(1, 2), (2, 2), (3, 30), (4, 40), (5, 50)].map(|(id, minutes)| {
                json!({ "id": id, "userId": "author", "body": format!("post {id}"), "created_at": ts(minutes) })
            }),
        );
        let engine = start(&backend, SyncSettings::default()).await;
        assert_eq!(home(&engine), vec![5, 4, 3, 2]);

        let mut state = engine.page_state(&FeedScope::Home).unwrap();
        while state != PageState::Exhausted {
            state = engine.load_more(&FeedScope::Home).await.unwrap();
        }
        assert_eq!(home(&engine), vec![5, 4, 3, 2, 1]);
    }

    #[tokio::test]
    async fn test_failed_page_can_be_retried() {
        let backend = backend(6);
        let engine = start(&backend, SyncSettings::default()).await;

        backend.fail_next(Operation::Query, Table::Posts);
        let err = engine.load_more(&FeedScope::Home).await.unwrap_err();
        assert!(matches!(err, SyncError::Backend(_)));
        assert_eq!(engine.page_state(&FeedScope::Home), Some(PageState::Idle));

        assert_eq!(engine.load_more(&FeedScope::Home).await.unwrap(), PageState::Exhausted);
        assert_eq!(home(&engine), vec![6, 5, 4, 3, 2, 1]);
    }

    #[tokio::test]
    async fn test_author_feed_admits_only_that_author() {
        let backend = backend(2);
        let engine = start(&backend, SyncSettings::default()).await;
        let mine = FeedScope::Author(UserId::new("me"));
        engine.open_feed(mine.clone()).await.unwrap();
        assert!(engine.snapshot(&mine).unwrap().is_empty());

        engine
            .mutations()
            .submit_post(PostDraft {
                body: "<p>hello</p>".into(),
                ..PostDraft::default()
            })
            .await
            .unwrap();
        backend
            .insert(Table::Posts, json!({ "userId": "u-2", "body": "not mine" }))
            .await
            .unwrap();
        engine.pump().await;

        assert_eq!(engine.snapshot(&mine).unwrap().len(), 1);
        assert_eq!(home(&engine), vec![4, 3, 2, 1]);
    }

    #[tokio::test]
    async fn test_sign_out_resets_everything() {
        let backend = backend(2);
        let engine = start(&backend, SyncSettings::default()).await;

        engine.handle_session(SessionEvent::SignedOut).await.unwrap();
        assert_eq!(backend.subscriber_count(), 0);
        assert!(engine.snapshot(&FeedScope::Home).is_none());
        assert!(engine.with_state(|s| s.user().is_none()));

        backend
            .insert(Table::Posts, json!({ "userId": "u-2", "body": "unseen" }))
            .await
            .unwrap();
        assert_eq!(engine.pump().await, 0);

        engine
            .handle_session(SessionEvent::SignedIn(UserId::new("me")))
            .await
            .unwrap();
        assert_eq!(backend.subscriber_count(), 4);
        assert_eq!(home(&engine), vec![3, 2, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_resubscribes_and_heals_gap() {
        let backend = backend(2);
        let engine = start(&backend, SyncSettings::default()).await;

        backend.disconnect_all("socket closed");
        backend.mute_events(true);
        backend
            .insert(Table::Posts, json!({ "userId": "u-2", "body": "missed", "created_at": ts(100) }))
            .await
            .unwrap();
        backend.mute_events(false);

        engine.pump().await;
        assert_eq!(backend.subscriber_count(), 4);
        assert_eq!(home(&engine), vec![3, 2, 1]);

        backend
            .insert(Table::Posts, json!({ "userId": "u-2", "body": "live", "created_at": ts(200) }))
            .await
            .unwrap();
        engine.pump().await;
        assert_eq!(home(&engine), vec![4, 3, 2, 1]);
    }

    #[tokio::test]
    async fn test_notification_badge() {
        let backend = backend(1);
        let engine = start(&backend, SyncSettings::default()).await;
        let notify = |receiver: &str| {
            json!({
                "senderId": "u-2",
                "receiverId": receiver,
                "title": "Commented on your post",
                "data": { "postId": 1, "commentId": 5 }
            })
        };

        backend.insert(Table::Notifications, notify("me")).await.unwrap();
        backend.insert(Table::Notifications, notify("u-2")).await.unwrap();
        engine.pump().await;
        assert_eq!(engine.unread_notifications(), 1);

        engine.mark_notifications_seen();
        assert_eq!(engine.unread_notifications(), 0);

        engine.set_foreground(false);
        backend.insert(Table::Notifications, notify("me")).await.unwrap();
        engine.pump().await;
        assert_eq!(engine.unread_notifications(), 0);
        assert_eq!(engine.with_state(|s| s.notifications.items().len()), 2);
    }

    #[tokio::test]
    async fn test_goal_status_and_kind_mismatch() {
        let backend = backend(1);
        backend.seed(
            Table::Goals,
            [json!({ "id": 3, "title": "Photograph a bird", "type": "image" })],
        );
        backend.seed(
            Table::GoalSchedule,
            [json!({ "date": DayBoundary::Utc.today_key(Utc::now()), "goalid": 3 })],
        );
        let engine = start(&backend, SyncSettings::default()).await;

        let goal = engine.with_state(|s| s.goal.clone()).unwrap();
        assert_eq!(goal.assignment.kind, GoalKind::Image);
        assert!(!goal.completed);

        let outcome = engine
            .mutations()
            .submit_post(PostDraft {
                body: "words only".into(),
                ..PostDraft::default()
            })
            .await
            .unwrap();
        assert!(!outcome.goal_credited);
        assert!(backend.rows(Table::GoalCompletions).is_empty());
    }

    #[tokio::test]
    async fn test_warm_start_shows_cached_feed() {
        let backend = backend(6);
        let engine = start(&backend, SyncSettings::default()).await;
        engine.attach_cache(CacheDb::open_in_memory().unwrap());
        engine.load_more(&FeedScope::Home).await.unwrap();
        engine.close_feed(&FeedScope::Home);
        assert!(engine.snapshot(&FeedScope::Home).is_none());

        backend.fail_next(Operation::Query, Table::Posts);
        assert!(engine.open_feed(FeedScope::Home).await.is_err());
        assert_eq!(home(&engine), vec![6, 5, 4, 3, 2, 1]);
        assert_eq!(engine.page_state(&FeedScope::Home), Some(PageState::Exhausted));

        engine.save_cache().unwrap();
    }

    #[tokio::test]
    async fn test_feed_operations_require_open_session() {
        let backend = backend(2);
        let storage = Arc::new(MemoryStorage::new(Url::parse("https://example.test").unwrap()));
        let engine = SyncEngine::new(backend.clone(), storage, SyncSettings::default());

        assert!(matches!(
            engine.open_feed(FeedScope::Home).await,
            Err(SyncError::SignedOut)
        ));

        engine.start(UserId::new("me")).await.unwrap();
        let other = FeedScope::Author(UserId::new("u-2"));
        assert!(matches!(
            engine.load_more(&other).await,
            Err(SyncError::FeedClosed(_))
        ));
        assert_eq!(engine.leaderboard(Some(5)).await.unwrap(), Vec::new());
    }
}
