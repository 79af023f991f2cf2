// SPDX-License-Identifier: MPL-2.0

use crate::backend::{BackendError, Table};
use crate::model::{CommentId, GoalId, PostId, UserId};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::cmp;
use std::fmt;

/// A scalar compared against a column.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FilterValue {
    Int(i64),
    Text(String),
}

impl FilterValue {
    fn parse(raw: &str) -> Self {
        raw.parse::<i64>()
            .map(FilterValue::Int)
            .unwrap_or_else(|_| FilterValue::Text(raw.to_string()))
    }

    pub fn to_json(&self) -> Value {
        match self {
            FilterValue::Int(n) => Value::from(*n),
            FilterValue::Text(s) => Value::from(s.as_str()),
        }
    }

    /// Loose comparison against a row cell: numbers and numeric strings
    /// compare numerically, RFC 3339 timestamps compare as instants.
    fn compare(&self, cell: &Value) -> Option<cmp::Ordering> {
        match (self, cell) {
            (FilterValue::Int(n), Value::Number(c)) => c.as_i64().map(|c| c.cmp(n)),
            (FilterValue::Int(n), Value::String(c)) => c.parse::<i64>().ok().map(|c| c.cmp(n)),
            (FilterValue::Text(s), Value::Number(c)) => {
                let n = s.parse::<i64>().ok()?;
                c.as_i64().map(|c| c.cmp(&n))
            }
            (FilterValue::Text(s), Value::String(c)) => {
                match (s.parse::<DateTime<Utc>>(), c.parse::<DateTime<Utc>>()) {
                    (Ok(a), Ok(b)) => Some(b.cmp(&a)),
                    _ => Some(c.as_str().cmp(s.as_str())),
                }
            }
            _ => None,
        }
    }
}

impl From<i64> for FilterValue {
    fn from(n: i64) -> Self {
        FilterValue::Int(n)
    }
}

impl From<i32> for FilterValue {
    fn from(n: i32) -> Self {
        FilterValue::Int(n.into())
    }
}

impl From<PostId> for FilterValue {
    fn from(id: PostId) -> Self {
        FilterValue::Int(id.0)
    }
}

impl From<CommentId> for FilterValue {
    fn from(id: CommentId) -> Self {
        FilterValue::Int(id.0)
    }
}

impl From<GoalId> for FilterValue {
    fn from(id: GoalId) -> Self {
        FilterValue::Int(id.0)
    }
}

impl From<&UserId> for FilterValue {
    fn from(id: &UserId) -> Self {
        FilterValue::Text(id.0.clone())
    }
}

impl From<&str> for FilterValue {
    fn from(s: &str) -> Self {
        FilterValue::Text(s.to_string())
    }
}

impl From<String> for FilterValue {
    fn from(s: String) -> Self {
        FilterValue::Text(s)
    }
}

impl fmt::Display for FilterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterValue::Int(n) => write!(f, "{n}"),
            FilterValue::Text(s) => f.write_str(s),
        }
    }
}

/// Row predicate in the backend's `column=op.value` notation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Filter {
    Eq { column: String, value: FilterValue },
    Lt { column: String, value: FilterValue },
    In { column: String, values: Vec<FilterValue> },
    /// Any of the inner predicates holds.
    Or(Vec<Filter>),
    /// All of the inner predicates hold.
    And(Vec<Filter>),
}

impl Filter {
    pub fn eq(column: impl Into<String>, value: impl Into<FilterValue>) -> Self {
        Filter::Eq {
            column: column.into(),
            value: value.into(),
        }
    }

    pub fn lt(column: impl Into<String>, value: impl Into<FilterValue>) -> Self {
        Filter::Lt {
            column: column.into(),
            value: value.into(),
        }
    }

    pub fn is_in<V: Into<FilterValue>>(
        column: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        Filter::In {
            column: column.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn any(filters: impl IntoIterator<Item = Filter>) -> Self {
        Filter::Or(filters.into_iter().collect())
    }

    pub fn all(filters: impl IntoIterator<Item = Filter>) -> Self {
        Filter::And(filters.into_iter().collect())
    }

    /// Rows strictly older than `(at, id)` in `at desc, id desc` order.
    pub fn before_key(
        time_column: &str,
        id_column: &str,
        at: impl Into<FilterValue>,
        id: impl Into<FilterValue>,
    ) -> Self {
        let at = at.into();
        Filter::any([
            Filter::lt(time_column, at.clone()),
            Filter::all([Filter::eq(time_column, at), Filter::lt(id_column, id)]),
        ])
    }

    /// Parse `postId=eq.42`, `created_at=lt.2024-05-01T00:00:00Z` or `id=in.(1,2,3)`.
    pub fn parse(raw: &str) -> Result<Self, BackendError> {
        let invalid = || BackendError::InvalidRow(format!("invalid filter: {raw}"));
        let (column, rest) = raw.split_once('=').ok_or_else(invalid)?;
        let (op, value) = rest.split_once('.').ok_or_else(invalid)?;
        if column.is_empty() {
            return Err(invalid());
        }
        match op {
            "eq" => Ok(Filter::eq(column, FilterValue::parse(value))),
            "lt" => Ok(Filter::lt(column, FilterValue::parse(value))),
            "in" => {
                let inner = value
                    .strip_prefix('(')
                    .and_then(|v| v.strip_suffix(')'))
                    .ok_or_else(invalid)?;
                let values = inner
                    .split(',')
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .map(FilterValue::parse);
                Ok(Filter::is_in(column, values))
            }
            _ => Err(invalid()),
        }
    }

    /// The compared column; `None` for `or`/`and` groups.
    pub fn column(&self) -> Option<&str> {
        match self {
            Filter::Eq { column, .. } | Filter::Lt { column, .. } | Filter::In { column, .. } => {
                Some(column)
            }
            Filter::Or(_) | Filter::And(_) => None,
        }
    }

    /// Whether `row` satisfies this predicate. A missing column never matches.
    pub fn matches(&self, row: &Value) -> bool {
        match self {
            Filter::Eq { column, value } => row
                .get(column)
                .is_some_and(|c| value.compare(c) == Some(cmp::Ordering::Equal)),
            Filter::Lt { column, value } => row
                .get(column)
                .is_some_and(|c| value.compare(c) == Some(cmp::Ordering::Less)),
            Filter::In { column, values } => row.get(column).is_some_and(|c| {
                values
                    .iter()
                    .any(|v| v.compare(c) == Some(cmp::Ordering::Equal))
            }),
            Filter::Or(filters) => filters.iter().any(|f| f.matches(row)),
            Filter::And(filters) => filters.iter().all(|f| f.matches(row)),
        }
    }

    /// Nested form used inside `or=(..)`: `column.op.value`.
    fn fmt_nested(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::Or(filters) => write_group(f, "or(", filters),
            Filter::And(filters) => write_group(f, "and(", filters),
            other => {
                let flat = other.to_string();
                f.write_str(&flat.replacen('=', ".", 1))
            }
        }
    }
}

fn write_group(f: &mut fmt::Formatter<'_>, open: &str, filters: &[Filter]) -> fmt::Result {
    f.write_str(open)?;
    for (i, filter) in filters.iter().enumerate() {
        if i > 0 {
            f.write_str(",")?;
        }
        filter.fmt_nested(f)?;
    }
    f.write_str(")")
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::Eq { column, value } => write!(f, "{column}=eq.{value}"),
            Filter::Lt { column, value } => write!(f, "{column}=lt.{value}"),
            Filter::In { column, values } => {
                let joined: Vec<String> = values.iter().map(ToString::to_string).collect();
                write!(f, "{column}=in.({})", joined.join(","))
            }
            Filter::Or(filters) => write_group(f, "or=(", filters),
            Filter::And(filters) => write_group(f, "and=(", filters),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ordering {
    pub column: String,
    pub ascending: bool,
}

/// A read against one table.
///
/// `select` uses the backend's embedding syntax, e.g.
/// `*, user: users (id, name, image), postLikes (*), comments (count)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub table: Table,
    pub select: String,
    pub filters: Vec<Filter>,
    /// Sort keys, most significant first.
    pub order: Vec<Ordering>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn on(table: Table) -> Self {
        Self {
            table,
            select: "*".to_string(),
            filters: Vec::new(),
            order: Vec::new(),
            limit: None,
        }
    }

    pub fn select(mut self, select: impl Into<String>) -> Self {
        self.select = select.into();
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn eq(self, column: impl Into<String>, value: impl Into<FilterValue>) -> Self {
        self.filter(Filter::eq(column, value))
    }

    /// Add a sort key after any already given.
    pub fn order(mut self, column: impl Into<String>, ascending: bool) -> Self {
        self.order.push(Ordering {
            column: column.into(),
            ascending,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}
