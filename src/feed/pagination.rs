// SPDX-License-Identifier: MPL-2.0

use crate::feed::{ExhaustionPolicy, FeedStore};
use crate::model::{Post, PostId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Tickets are unique across drivers, so a page fetched for a closed
/// session can never complete a later one.
static NEXT_TICKET: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    Idle,
    Fetching,
    Exhausted,
}

/// How successive pages are fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageMode {
    /// Re-fetch from the top with a limit grown by one increment each time
    /// and replace the whole feed with the result.
    GrowingLimit,
    /// Fetch one increment of posts strictly older than the last fetched
    /// post and append them.
    #[default]
    Cursor,
}

/// Position of the oldest post fetched so far in cursor mode.
///
/// Feeds are ordered `created_at desc, id desc`, so the id breaks ties
/// between posts sharing a timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageCursor {
    pub created_at: DateTime<Utc>,
    pub id: PostId,
}

impl PageCursor {
    pub fn of(post: &Post) -> Self {
        Self {
            created_at: post.created_at,
            id: post.id,
        }
    }
}

/// One page fetch handed out by [`PaginationDriver::begin`].
#[derive(Debug, Clone, PartialEq)]
pub struct PageRequest {
    pub limit: usize,
    /// Only posts strictly after this position in feed order (cursor mode).
    pub before: Option<PageCursor>,
    ticket: u64,
}

/// Drives page fetches for one feed session.
///
/// The accumulated limit and cursor belong to the session: a new session
/// starts from scratch.
#[derive(Debug, Clone)]
pub struct PaginationDriver {
    state: PageState,
    mode: PageMode,
    policy: ExhaustionPolicy,
    increment: usize,
    limit: usize,
    cursor: Option<PageCursor>,
    ticket: u64,
}

impl PaginationDriver {
    pub fn new(mode: PageMode, increment: usize, policy: ExhaustionPolicy) -> Self {
        Self {
            state: PageState::Idle,
            mode,
            policy,
            increment: increment.max(1),
            limit: 0,
            cursor: None,
            ticket: 0,
        }
    }

    pub fn state(&self) -> PageState {
        self.state
    }

    pub fn mode(&self) -> PageMode {
        self.mode
    }

    /// Total rows requested so far in growing-limit mode.
    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn cursor(&self) -> Option<PageCursor> {
        self.cursor
    }

    /// Scroll threshold reached: hand out the next fetch, if one is allowed.
    pub fn begin(&mut self) -> Option<PageRequest> {
        if self.state != PageState::Idle {
            return None;
        }
        self.state = PageState::Fetching;
        self.ticket = NEXT_TICKET.fetch_add(1, Ordering::Relaxed);
        let request = match self.mode {
            PageMode::GrowingLimit => {
                self.limit += self.increment;
                PageRequest {
                    limit: self.limit,
                    before: None,
                    ticket: self.ticket,
                }
            }
            PageMode::Cursor => PageRequest {
                limit: self.increment,
                before: self.cursor,
                ticket: self.ticket,
            },
        };
        debug!(limit = request.limit, before = ?request.before, "page fetch started");
        Some(request)
    }

    /// Apply a fetched page to `store`. Stale or unexpected completions are ignored.
    pub fn complete(
        &mut self,
        request: &PageRequest,
        store: &mut FeedStore,
        posts: Vec<Post>,
    ) -> PageState {
        if self.state != PageState::Fetching || request.ticket != self.ticket {
            debug!(ticket = request.ticket, "ignoring stale page");
            return self.state;
        }

        let fetched = posts.len();
        match self.mode {
            PageMode::GrowingLimit => {
                store.replace_page(posts, request.limit, self.policy);
            }
            PageMode::Cursor => {
                if let Some(oldest) = posts.iter().map(PageCursor::of).min() {
                    self.cursor = Some(self.cursor.map_or(oldest, |c| c.min(oldest)));
                }
                store.append_page(posts, request.limit);
            }
        }

        self.state = if store.is_exhausted() {
            PageState::Exhausted
        } else {
            PageState::Idle
        };
        debug!(fetched, held = store.len(), state = ?self.state, "page fetch finished");
        self.state
    }

    /// The fetch failed: allow a retry without growing the limit twice.
    pub fn fail(&mut self, request: &PageRequest) {
        if self.state != PageState::Fetching || request.ticket != self.ticket {
            return;
        }
        if self.mode == PageMode::GrowingLimit {
            self.limit = self.limit.saturating_sub(self.increment);
        }
        self.state = PageState::Idle;
    }

    /// Resume from a saved position (warm start).
    pub fn restore(&mut self, limit: usize, cursor: Option<PageCursor>, exhausted: bool) {
        self.limit = limit;
        self.cursor = cursor;
        self.state = if exhausted {
            PageState::Exhausted
        } else {
            PageState::Idle
        };
    }
}
