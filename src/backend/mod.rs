// SPDX-License-Identifier: MPL-2.0

//! Contract of the hosted backend: a query/mutation API over named tables,
//! a change-event stream per table, and object storage for media.

mod memory;
mod query;
mod storage;

pub use memory::{DeletePayload, MemoryBackend, MemoryStorage, Operation};
pub use query::{Filter, FilterValue, Ordering, Query};
pub use storage::{ObjectStorage, media_path, public_media_url};

use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    #[error("{operation} on {table} failed: {message}")]
    Request {
        operation: &'static str,
        table: &'static str,
        message: String,
    },
    #[error("no matching row in {0}")]
    NotFound(&'static str),
    #[error("duplicate key in {0}")]
    Conflict(&'static str),
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),
    #[error("invalid row: {0}")]
    InvalidRow(String),
    #[error("transport error: {0}")]
    Transport(String),
}

impl From<serde_json::Error> for BackendError {
    fn from(e: serde_json::Error) -> Self {
        BackendError::InvalidRow(e.to_string())
    }
}

/// Relations the client reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    Posts,
    Comments,
    PostLikes,
    Notifications,
    GoalSchedule,
    GoalCompletions,
    Goals,
    Scores,
    Users,
}

impl Table {
    pub const ALL: [Table; 9] = [
        Table::Posts,
        Table::Comments,
        Table::PostLikes,
        Table::Notifications,
        Table::GoalSchedule,
        Table::GoalCompletions,
        Table::Goals,
        Table::Scores,
        Table::Users,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Table::Posts => "posts",
            Table::Comments => "comments",
            Table::PostLikes => "postLikes",
            Table::Notifications => "notifications",
            Table::GoalSchedule => "goal_schedule",
            Table::GoalCompletions => "goal_completions",
            Table::Goals => "goals",
            Table::Scores => "scores",
            Table::Users => "users",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.name() == name)
    }

    /// Columns forming the conflict target for inserts and upserts.
    pub fn key_columns(self) -> &'static [&'static str] {
        match self {
            Table::PostLikes => &["userId", "postId"],
            Table::GoalCompletions => &["userid", "goalid"],
            Table::Scores => &["userid"],
            Table::GoalSchedule => &["date"],
            _ => &["id"],
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "INSERT" => Some(ChangeKind::Insert),
            "UPDATE" => Some(ChangeKind::Update),
            "DELETE" => Some(ChangeKind::Delete),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChangeKind::Insert => "INSERT",
            ChangeKind::Update => "UPDATE",
            ChangeKind::Delete => "DELETE",
        }
    }
}

/// Identifies one live subscription. Minted by the event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionHandle(pub u64);

impl fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// What a subscription watches: a table, a set of event kinds, and an
/// optional row filter such as `postId=eq.42`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionSpec {
    pub table: Table,
    kinds: Vec<ChangeKind>,
    pub filter: Option<Filter>,
}

impl SubscriptionSpec {
    /// Watch every event kind on `table`.
    pub fn all(table: Table) -> Self {
        Self::new(
            table,
            [ChangeKind::Insert, ChangeKind::Update, ChangeKind::Delete],
        )
    }

    pub fn new(table: Table, kinds: impl IntoIterator<Item = ChangeKind>) -> Self {
        let mut kinds: Vec<ChangeKind> = kinds.into_iter().collect();
        kinds.sort();
        kinds.dedup();
        Self {
            table,
            kinds,
            filter: None,
        }
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn kinds(&self) -> &[ChangeKind] {
        &self.kinds
    }

    pub fn accepts(&self, kind: ChangeKind) -> bool {
        self.kinds.contains(&kind)
    }
}

/// Raw traffic from the transport to the event bus.
#[derive(Debug, Clone)]
pub enum ChangeMessage {
    Change {
        handle: SubscriptionHandle,
        payload: Value,
    },
    Disconnected {
        handle: SubscriptionHandle,
        reason: String,
    },
}

/// Where a backend delivers the events of one subscription.
#[derive(Debug, Clone)]
pub struct ChangeSink {
    handle: SubscriptionHandle,
    tx: UnboundedSender<ChangeMessage>,
}

impl ChangeSink {
    pub fn new(handle: SubscriptionHandle, tx: UnboundedSender<ChangeMessage>) -> Self {
        Self { handle, tx }
    }

    pub fn handle(&self) -> SubscriptionHandle {
        self.handle
    }

    /// Deliver one raw change payload. Returns false once the bus is gone.
    pub fn send(&self, payload: Value) -> bool {
        self.tx
            .send(ChangeMessage::Change {
                handle: self.handle,
                payload,
            })
            .is_ok()
    }

    pub fn disconnected(&self, reason: impl Into<String>) -> bool {
        self.tx
            .send(ChangeMessage::Disconnected {
                handle: self.handle,
                reason: reason.into(),
            })
            .is_ok()
    }
}

/// The relational store and its change feed.
///
/// Rows are JSON objects keyed by the backend's column names.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn query(&self, query: Query) -> Result<Vec<Value>, BackendError>;

    async fn insert(&self, table: Table, record: Value) -> Result<Value, BackendError>;

    async fn upsert(&self, table: Table, record: Value) -> Result<Value, BackendError>;

    async fn update(
        &self,
        table: Table,
        filters: Vec<Filter>,
        changes: Value,
    ) -> Result<Vec<Value>, BackendError>;

    async fn delete(&self, table: Table, filters: Vec<Filter>) -> Result<(), BackendError>;

    /// Atomically add `delta` to an integer column and return the updated row.
    async fn increment(
        &self,
        _table: Table,
        _filters: Vec<Filter>,
        _column: &str,
        _delta: i64,
    ) -> Result<Value, BackendError> {
        Err(BackendError::Unsupported("increment"))
    }

    /// Start delivering change events matching `spec` into `sink`.
    fn subscribe_changes(&self, spec: &SubscriptionSpec, sink: ChangeSink)
    -> Result<(), BackendError>;

    fn unsubscribe(&self, handle: SubscriptionHandle);
}

/// Decode a single row into a typed record.
pub fn decode<T: serde::de::DeserializeOwned>(row: Value) -> Result<T, BackendError> {
    Ok(serde_json::from_value(row)?)
}

/// Decode a list of rows, failing on the first malformed one.
pub fn decode_all<T: serde::de::DeserializeOwned>(rows: Vec<Value>) -> Result<Vec<T>, BackendError> {
    rows.into_iter().map(decode).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_names_round_trip() {
        for table in Table::ALL {
            assert_eq!(Table::from_name(table.name()), Some(table));
        }
        assert_eq!(Table::from_name("unknown"), None);
    }

    #[test]
    fn test_subscription_spec_normalizes_kinds() {
        let a = SubscriptionSpec::new(Table::Comments, [ChangeKind::Delete, ChangeKind::Insert]);
        let b = SubscriptionSpec::new(
            Table::Comments,
            [ChangeKind::Insert, ChangeKind::Delete, ChangeKind::Insert],
        );
        assert_eq!(a, b);
        assert!(a.accepts(ChangeKind::Insert));
        assert!(!a.accepts(ChangeKind::Update));
    }
}
