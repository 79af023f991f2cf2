// SPDX-License-Identifier: MPL-2.0

//! Locally held feed state: the ordered post collection, its pagination
//! session, the counters derived from other tables, and the open thread.

mod counts;
mod pagination;
pub(crate) mod store;
mod thread;

pub use counts::{CountOutcome, CountReconciler, FetchMark};
pub use pagination::{PageCursor, PageMode, PageRequest, PageState, PaginationDriver};
pub use store::{ExhaustionPolicy, FeedStore, Prepended};
pub use thread::PostThread;

use crate::backend::{Filter, Query, Table};
use crate::model::{Post, UserId};

/// Columns and embedded relations fetched for every post.
pub const POST_SELECT: &str = "*, user: users (id, name, image), postLikes (*), comments (count)";

/// Columns and embedded relations fetched for comments.
pub const COMMENT_SELECT: &str = "*, user: users (id, name, image)";

/// Which posts a feed shows.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FeedScope {
    /// Everyone's posts.
    Home,
    /// One user's posts (profile screen).
    Author(UserId),
}

impl FeedScope {
    pub fn filter(&self) -> Option<Filter> {
        match self {
            FeedScope::Home => None,
            FeedScope::Author(user) => Some(Filter::eq("userId", user)),
        }
    }

    pub fn admits(&self, post: &Post) -> bool {
        match self {
            FeedScope::Home => true,
            FeedScope::Author(user) => &post.author_id == user,
        }
    }

    /// Key used for the warm-start cache.
    pub fn cache_key(&self) -> String {
        match self {
            FeedScope::Home => "home".to_string(),
            FeedScope::Author(user) => format!("author:{user}"),
        }
    }

    /// The newest `limit` posts of this feed.
    pub fn window_query(&self, limit: usize) -> Query {
        let query = Query::on(Table::Posts)
            .select(POST_SELECT)
            .order("created_at", false)
            .order("id", false)
            .limit(limit);
        match self.filter() {
            Some(filter) => query.filter(filter),
            None => query,
        }
    }

    /// The backend read for one page of this feed.
    pub fn page_query(&self, request: &PageRequest) -> Query {
        let mut query = self.window_query(request.limit);
        if let Some(before) = request.before {
            query = query.filter(Filter::before_key(
                "created_at",
                "id",
                before.created_at.to_rfc3339(),
                before.id,
            ));
        }
        query
    }
}

/// One mounted feed: created when the view opens, dropped when it closes.
#[derive(Debug, Clone)]
pub struct FeedSession {
    pub scope: FeedScope,
    pub store: FeedStore,
    pub pages: PaginationDriver,
    pub counts: CountReconciler,
}

impl FeedSession {
    pub fn new(scope: FeedScope, mode: PageMode, increment: usize, policy: ExhaustionPolicy) -> Self {
        Self {
            scope,
            store: FeedStore::new(),
            pages: PaginationDriver::new(mode, increment, policy),
            counts: CountReconciler::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::FilterValue;
    use crate::model::PostId;

    #[test]
    fn test_author_scope_query() {
        let scope = FeedScope::Author(UserId::new("u-1"));
        let mut pages = PaginationDriver::new(PageMode::Cursor, 4, ExhaustionPolicy::SameLength);
        let request = pages.begin().unwrap();
        let query = scope.page_query(&request);

        assert_eq!(query.limit, Some(4));
        assert_eq!(query.select, POST_SELECT);
        assert_eq!(
            query.filters,
            vec![Filter::Eq {
                column: "userId".into(),
                value: FilterValue::Text("u-1".into()),
            }]
        );
        assert_eq!(scope.cache_key(), "author:u-1");
    }

    #[test]
    fn test_cursor_page_query_uses_keyset() {
        let mut pages = PaginationDriver::new(PageMode::Cursor, 2, ExhaustionPolicy::SameLength);
        let mut held = FeedStore::new();
        let first = pages.begin().unwrap();
        pages.complete(
            &first,
            &mut held,
            vec![store::tests::post(9, 30), store::tests::post(8, 30)],
        );

        let query = FeedScope::Home.page_query(&pages.begin().unwrap());
        let orders: Vec<&str> = query.order.iter().map(|o| o.column.as_str()).collect();
        assert_eq!(orders, ["created_at", "id"]);
        assert!(query.order.iter().all(|o| !o.ascending));
        assert_eq!(
            query.filters,
            vec![Filter::before_key(
                "created_at",
                "id",
                "2024-05-01T00:30:00+00:00",
                PostId(8),
            )]
        );
    }

    #[test]
    fn test_scope_admits() {
        let post = store::tests::post(1, 0);
        assert!(FeedScope::Home.admits(&post));
        assert!(FeedScope::Author(UserId::new("author")).admits(&post));
        assert!(!FeedScope::Author(UserId::new("someone")).admits(&post));
    }
}
