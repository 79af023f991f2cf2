// SPDX-License-Identifier: MPL-2.0

//! In-process backend and storage.
//!
//! Implements the subset of the hosted service the sync engine relies on:
//! filtered/ordered/limited reads with a few embedded relations, keyed
//! writes, and a change feed with the realtime payload shape. Test hooks
//! allow failing operations, holding writes or read responses in flight,
//! muting the change feed and dropping the transport.

use crate::backend::{
    Backend, BackendError, ChangeKind, ChangeSink, Filter, ObjectStorage, Query,
    SubscriptionHandle, SubscriptionSpec, Table, public_media_url,
};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value, json};
use std::cmp;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::watch;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Query,
    Insert,
    Upsert,
    Update,
    Delete,
    Increment,
    Upload,
}

impl Operation {
    fn as_str(self) -> &'static str {
        match self {
            Operation::Query => "query",
            Operation::Insert => "insert",
            Operation::Upsert => "upsert",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::Increment => "increment",
            Operation::Upload => "upload",
        }
    }
}

/// What the `old` record of a DELETE event carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeletePayload {
    #[default]
    FullRow,
    /// Only the key columns, as with a default replica identity.
    KeyOnly,
}

struct Subscriber {
    spec: SubscriptionSpec,
    sink: ChangeSink,
}

struct MemoryInner {
    tables: HashMap<Table, Vec<Value>>,
    next_id: i64,
    subscribers: BTreeMap<SubscriptionHandle, Subscriber>,
    failures: HashMap<(Operation, Table), usize>,
    delete_payload: DeletePayload,
    events_muted: bool,
    atomic_increment: bool,
}

pub struct MemoryBackend {
    inner: Mutex<MemoryInner>,
    /// `true` while writes are held in flight.
    gate: watch::Sender<bool>,
    /// `true` while read responses are held.
    reads: watch::Sender<bool>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (gate, _) = watch::channel(false);
        let (reads, _) = watch::channel(false);
        Self {
            inner: Mutex::new(MemoryInner {
                tables: HashMap::new(),
                next_id: 1,
                subscribers: BTreeMap::new(),
                failures: HashMap::new(),
                delete_payload: DeletePayload::default(),
                events_muted: false,
                atomic_increment: true,
            }),
            gate,
            reads,
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert rows without emitting change events.
    pub fn seed(&self, table: Table, rows: impl IntoIterator<Item = Value>) {
        let mut inner = self.lock();
        for mut row in rows {
            inner.prepare_new_row(table, &mut row);
            inner.tables.entry(table).or_default().push(row);
        }
    }

    pub fn rows(&self, table: Table) -> Vec<Value> {
        self.lock().tables.get(&table).cloned().unwrap_or_default()
    }

    /// Fail the next `op` on `table` with a request error.
    pub fn fail_next(&self, op: Operation, table: Table) {
        self.fail_times(op, table, 1);
    }

    pub fn fail_times(&self, op: Operation, table: Table, times: usize) {
        *self.lock().failures.entry((op, table)).or_default() += times;
    }

    /// Keep every write pending until [`release_writes`](Self::release_writes).
    pub fn hold_writes(&self) {
        self.gate.send_replace(true);
    }

    pub fn release_writes(&self) {
        self.gate.send_replace(false);
    }

    /// Hold every read response until [`release_reads`](Self::release_reads).
    /// Rows are taken when the read arrives, so a held response goes stale.
    pub fn hold_reads(&self) {
        self.reads.send_replace(true);
    }

    pub fn release_reads(&self) {
        self.reads.send_replace(false);
    }

    pub fn set_delete_payload(&self, payload: DeletePayload) {
        self.lock().delete_payload = payload;
    }

    /// Drop change events instead of delivering them, simulating a gap.
    pub fn mute_events(&self, muted: bool) {
        self.lock().events_muted = muted;
    }

    pub fn set_atomic_increment(&self, enabled: bool) {
        self.lock().atomic_increment = enabled;
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// Report a transport drop on every live subscription.
    pub fn disconnect_all(&self, reason: &str) {
        let inner = self.lock();
        for sub in inner.subscribers.values() {
            sub.sink.disconnected(reason);
        }
    }

    /// Deliver a raw payload to every subscriber of `table`, bypassing the
    /// store. Used to replay captured traffic.
    pub fn emit_raw(&self, table: Table, payload: Value) -> usize {
        let inner = self.lock();
        inner
            .subscribers
            .values()
            .filter(|sub| sub.spec.table == table)
            .filter(|sub| sub.sink.send(payload.clone()))
            .count()
    }

    async fn write_gate(&self) {
        let mut rx = self.gate.subscribe();
        let _ = rx.wait_for(|held| !*held).await;
    }

    async fn read_gate(&self) {
        let mut rx = self.reads.subscribe();
        let _ = rx.wait_for(|held| !*held).await;
    }

    fn read_rows(&self, query: &Query) -> Vec<Value> {
        let inner = self.lock();
        let mut rows: Vec<Value> = inner
            .table(query.table)
            .iter()
            .filter(|row| query.filters.iter().all(|f| f.matches(row)))
            .cloned()
            .collect();

        if !query.order.is_empty() {
            rows.sort_by(|a, b| {
                query
                    .order
                    .iter()
                    .map(|order| {
                        let ord = cmp_cells(a.get(&order.column), b.get(&order.column));
                        if order.ascending { ord } else { ord.reverse() }
                    })
                    .find(|ord| ord.is_ne())
                    .unwrap_or(cmp::Ordering::Equal)
            });
        }
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
        for row in &mut rows {
            inner.embed(query.table, &query.select, row);
        }
        rows
    }

    fn check_failure(&self, op: Operation, table: Table) -> Result<(), BackendError> {
        let mut inner = self.lock();
        if let Some(remaining) = inner.failures.get_mut(&(op, table))
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(BackendError::Request {
                operation: op.as_str(),
                table: table.name(),
                message: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn now_string() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn same_key(table: Table, a: &Value, b: &Value) -> bool {
    table.key_columns().iter().all(|col| match (a.get(col), b.get(col)) {
        (Some(x), Some(y)) => !x.is_null() && x == y,
        _ => false,
    })
}

fn merge(target: &mut Value, changes: &Value) {
    if let (Some(target), Some(changes)) = (target.as_object_mut(), changes.as_object()) {
        for (k, v) in changes {
            target.insert(k.clone(), v.clone());
        }
    }
}

fn cmp_cells(a: Option<&Value>, b: Option<&Value>) -> cmp::Ordering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(cmp::Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => {
            match (x.parse::<DateTime<Utc>>(), y.parse::<DateTime<Utc>>()) {
                (Ok(x), Ok(y)) => x.cmp(&y),
                _ => x.cmp(y),
            }
        }
        (Some(Value::Null) | None, Some(Value::Null) | None) => cmp::Ordering::Equal,
        (Some(Value::Null) | None, _) => cmp::Ordering::Greater,
        (_, Some(Value::Null) | None) => cmp::Ordering::Less,
        _ => cmp::Ordering::Equal,
    }
}

impl MemoryInner {
    fn prepare_new_row(&mut self, table: Table, row: &mut Value) {
        let Some(obj) = row.as_object_mut() else {
            return;
        };
        if table.key_columns() == ["id"] {
            match obj.get("id") {
                Some(id) => {
                    if let Some(id) = id.as_i64() {
                        self.next_id = self.next_id.max(id + 1);
                    }
                }
                None => {
                    obj.insert("id".into(), Value::from(self.next_id));
                    self.next_id += 1;
                }
            }
        }
        if !obj.contains_key("created_at") {
            obj.insert("created_at".into(), Value::from(now_string()));
        }
    }

    fn table(&self, table: Table) -> &[Value] {
        self.tables.get(&table).map(Vec::as_slice).unwrap_or_default()
    }

    fn key_only(table: Table, row: &Value) -> Value {
        let mut obj = Map::new();
        for col in table.key_columns() {
            if let Some(v) = row.get(col) {
                obj.insert((*col).to_string(), v.clone());
            }
        }
        Value::Object(obj)
    }

    fn emit(&self, table: Table, kind: ChangeKind, new: Option<&Value>, old: Option<&Value>) {
        if self.events_muted {
            return;
        }
        let old = match (kind, old) {
            (ChangeKind::Delete, Some(row)) if self.delete_payload == DeletePayload::KeyOnly => {
                Some(Self::key_only(table, row))
            }
            (_, old) => old.cloned(),
        };
        let record = new.or(old.as_ref()).cloned().unwrap_or(Value::Null);
        let payload = json!({
            "schema": "public",
            "table": table.name(),
            "eventType": kind.as_str(),
            "commit_timestamp": now_string(),
            "new": new.cloned().unwrap_or_else(|| json!({})),
            "old": old.unwrap_or_else(|| json!({})),
        });
        for sub in self.subscribers.values() {
            if sub.spec.table != table || !sub.spec.accepts(kind) {
                continue;
            }
            if let Some(filter) = &sub.spec.filter
                && !filter.matches(&record)
            {
                continue;
            }
            sub.sink.send(payload.clone());
        }
    }

    fn find_user(&self, id: Option<&Value>) -> Value {
        let Some(id) = id else {
            return Value::Null;
        };
        self.table(Table::Users)
            .iter()
            .find(|u| u.get("id") == Some(id))
            .map(|u| {
                json!({
                    "id": u.get("id").cloned().unwrap_or(Value::Null),
                    "name": u.get("name").cloned().unwrap_or(Value::Null),
                    "image": u.get("image").cloned().unwrap_or(Value::Null),
                })
            })
            .unwrap_or(Value::Null)
    }

    fn children(&self, table: Table, column: &str, parent: Option<&Value>) -> Vec<Value> {
        self.table(table)
            .iter()
            .filter(|r| parent.is_some() && r.get(column) == parent)
            .cloned()
            .collect()
    }

    /// Attach the relations named in `select`.
    fn embed(&self, table: Table, select: &str, row: &mut Value) {
        let compact: String = select.chars().filter(|c| !c.is_whitespace()).collect();
        let snapshot = row.clone();
        let Some(obj) = row.as_object_mut() else {
            return;
        };
        match table {
            Table::Posts => {
                let id = snapshot.get("id");
                if compact.contains("user:") {
                    obj.insert("user".into(), self.find_user(snapshot.get("userId")));
                }
                if compact.contains("postLikes(") {
                    let likes = self.children(Table::PostLikes, "postId", id);
                    obj.insert("postLikes".into(), Value::Array(likes));
                }
                if compact.contains("comments(count)") {
                    let count = self.children(Table::Comments, "postId", id).len();
                    obj.insert("comments".into(), json!([{ "count": count }]));
                } else if compact.contains("comments(") {
                    let mut comments = self.children(Table::Comments, "postId", id);
                    comments.sort_by(|a, b| cmp_cells(b.get("created_at"), a.get("created_at")));
                    for comment in &mut comments {
                        let user = self.find_user(comment.get("userId"));
                        if let Some(c) = comment.as_object_mut() {
                            c.insert("user".into(), user);
                        }
                    }
                    obj.insert("comments".into(), Value::Array(comments));
                }
            }
            Table::Comments if compact.contains("user:") => {
                obj.insert("user".into(), self.find_user(snapshot.get("userId")));
            }
            Table::Notifications if compact.contains("sender:") => {
                obj.insert("sender".into(), self.find_user(snapshot.get("senderId")));
            }
            Table::Scores if compact.contains("user:") => {
                obj.insert("user".into(), self.find_user(snapshot.get("userid")));
            }
            Table::GoalSchedule if compact.contains("goals:") => {
                let goal = self
                    .table(Table::Goals)
                    .iter()
                    .find(|g| g.get("id") == snapshot.get("goalid"))
                    .cloned()
                    .unwrap_or(Value::Null);
                obj.insert("goals".into(), goal);
            }
            _ => {}
        }
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn query(&self, query: Query) -> Result<Vec<Value>, BackendError> {
        self.check_failure(Operation::Query, query.table)?;
        let rows = self.read_rows(&query);
        self.read_gate().await;
        Ok(rows)
    }

    async fn insert(&self, table: Table, mut record: Value) -> Result<Value, BackendError> {
        self.write_gate().await;
        self.check_failure(Operation::Insert, table)?;
        let mut inner = self.lock();
        inner.prepare_new_row(table, &mut record);
        if inner.table(table).iter().any(|r| same_key(table, r, &record)) {
            return Err(BackendError::Conflict(table.name()));
        }
        inner.tables.entry(table).or_default().push(record.clone());
        inner.emit(table, ChangeKind::Insert, Some(&record), None);
        Ok(record)
    }

    async fn upsert(&self, table: Table, mut record: Value) -> Result<Value, BackendError> {
        self.write_gate().await;
        self.check_failure(Operation::Upsert, table)?;
        let mut inner = self.lock();
        let existing = inner
            .table(table)
            .iter()
            .position(|r| same_key(table, r, &record));
        match existing {
            Some(index) => {
                let rows = inner.tables.entry(table).or_default();
                let old = rows[index].clone();
                merge(&mut rows[index], &record);
                let new = rows[index].clone();
                inner.emit(table, ChangeKind::Update, Some(&new), Some(&old));
                Ok(new)
            }
            None => {
                inner.prepare_new_row(table, &mut record);
                inner.tables.entry(table).or_default().push(record.clone());
                inner.emit(table, ChangeKind::Insert, Some(&record), None);
                Ok(record)
            }
        }
    }

    async fn update(
        &self,
        table: Table,
        filters: Vec<Filter>,
        changes: Value,
    ) -> Result<Vec<Value>, BackendError> {
        self.write_gate().await;
        self.check_failure(Operation::Update, table)?;
        let mut inner = self.lock();
        let mut changed = Vec::new();
        if let Some(rows) = inner.tables.get_mut(&table) {
            for row in rows.iter_mut() {
                if filters.iter().all(|f| f.matches(row)) {
                    let old = row.clone();
                    merge(row, &changes);
                    changed.push((row.clone(), old));
                }
            }
        }
        for (new, old) in &changed {
            inner.emit(table, ChangeKind::Update, Some(new), Some(old));
        }
        Ok(changed.into_iter().map(|(new, _)| new).collect())
    }

    async fn delete(&self, table: Table, filters: Vec<Filter>) -> Result<(), BackendError> {
        self.write_gate().await;
        self.check_failure(Operation::Delete, table)?;
        let mut inner = self.lock();
        let mut removed = Vec::new();
        if let Some(rows) = inner.tables.get_mut(&table) {
            rows.retain(|row| {
                let hit = filters.iter().all(|f| f.matches(row));
                if hit {
                    removed.push(row.clone());
                }
                !hit
            });
        }
        for old in &removed {
            inner.emit(table, ChangeKind::Delete, None, Some(old));
        }
        Ok(())
    }

    async fn increment(
        &self,
        table: Table,
        filters: Vec<Filter>,
        column: &str,
        delta: i64,
    ) -> Result<Value, BackendError> {
        if !self.lock().atomic_increment {
            return Err(BackendError::Unsupported("increment"));
        }
        self.write_gate().await;
        self.check_failure(Operation::Increment, table)?;
        let mut inner = self.lock();
        let rows = inner.tables.entry(table).or_default();
        let row = rows
            .iter_mut()
            .find(|row| filters.iter().all(|f| f.matches(row)))
            .ok_or(BackendError::NotFound(table.name()))?;
        let old = row.clone();
        let current = row.get(column).and_then(Value::as_i64).unwrap_or(0);
        if let Some(obj) = row.as_object_mut() {
            obj.insert(column.to_string(), Value::from(current + delta));
        }
        let new = row.clone();
        inner.emit(table, ChangeKind::Update, Some(&new), Some(&old));
        Ok(new)
    }

    fn subscribe_changes(
        &self,
        spec: &SubscriptionSpec,
        sink: ChangeSink,
    ) -> Result<(), BackendError> {
        let mut inner = self.lock();
        inner.subscribers.insert(
            sink.handle(),
            Subscriber {
                spec: spec.clone(),
                sink,
            },
        );
        Ok(())
    }

    fn unsubscribe(&self, handle: SubscriptionHandle) {
        self.lock().subscribers.remove(&handle);
    }
}

/// Object storage kept in memory.
pub struct MemoryStorage {
    base: Url,
    objects: Mutex<HashMap<String, (Vec<u8>, String)>>,
    failures: Mutex<usize>,
}

impl MemoryStorage {
    pub fn new(base: Url) -> Self {
        Self {
            base,
            objects: Mutex::new(HashMap::new()),
            failures: Mutex::new(0),
        }
    }

    pub fn fail_next(&self) {
        *self.failures.lock().unwrap_or_else(|e| e.into_inner()) += 1;
    }

    pub fn contains(&self, path: &str) -> bool {
        self.objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(path)
    }
}

#[async_trait]
impl ObjectStorage for MemoryStorage {
    async fn upload(
        &self,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, BackendError> {
        {
            let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
            if *failures > 0 {
                *failures -= 1;
                return Err(BackendError::Request {
                    operation: Operation::Upload.as_str(),
                    table: "storage",
                    message: "injected failure".to_string(),
                });
            }
        }
        let mut objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        if objects.contains_key(path) {
            return Err(BackendError::Conflict("storage"));
        }
        objects.insert(path.to_string(), (bytes, content_type.to_string()));
        Ok(path.to_string())
    }

    fn public_url(&self, stored_path: &str) -> Result<Url, BackendError> {
        public_media_url(&self.base, stored_path)
    }
}
