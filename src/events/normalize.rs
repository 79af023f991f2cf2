// SPDX-License-Identifier: MPL-2.0

use crate::backend::{BackendError, ChangeKind, SubscriptionHandle, Table, decode};
use crate::events::SubscriptionError;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// A backend change, normalized to one envelope regardless of the
/// payload shape the transport used.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub table: Table,
    pub before: Option<Value>,
    pub after: Option<Value>,
    /// Subscription that delivered the event.
    pub handle: SubscriptionHandle,
}

/// Empty objects stand for "no record" in every payload shape.
fn record(value: Option<&Value>) -> Option<Value> {
    match value {
        Some(Value::Object(obj)) if !obj.is_empty() => Some(Value::Object(obj.clone())),
        _ => None,
    }
}

impl ChangeEvent {
    /// Normalize a raw payload.
    ///
    /// Accepted shapes:
    /// - realtime: `{eventType, table, new, old}`
    /// - webhook / legacy realtime: `{type, table, record, old_record}`
    /// - either of the above wrapped as `{data: {...}}`
    ///
    /// `fallback` is used when the payload does not name its table.
    pub fn normalize(
        payload: &Value,
        fallback: Table,
        handle: SubscriptionHandle,
    ) -> Result<Self, SubscriptionError> {
        let payload = match payload.get("data") {
            Some(inner) if inner.get("type").is_some() || inner.get("eventType").is_some() => {
                inner
            }
            _ => payload,
        };
        let malformed = |what: &str| SubscriptionError::Malformed(format!("{what}: {payload}"));

        let kind = payload
            .get("eventType")
            .or_else(|| payload.get("type"))
            .and_then(Value::as_str)
            .and_then(ChangeKind::parse)
            .ok_or_else(|| malformed("missing event type"))?;

        let table = match payload.get("table").and_then(Value::as_str) {
            Some(name) => Table::from_name(name).ok_or_else(|| malformed("unknown table"))?,
            None => fallback,
        };

        let after = record(payload.get("new").or_else(|| payload.get("record")));
        let before = record(payload.get("old").or_else(|| payload.get("old_record")));

        let consistent = match kind {
            ChangeKind::Insert => after.is_some(),
            ChangeKind::Update => after.is_some(),
            ChangeKind::Delete => before.is_some(),
        };
        if !consistent {
            return Err(malformed("record missing for event kind"));
        }

        Ok(Self {
            kind,
            table,
            before,
            after,
            handle,
        })
    }

    /// The row this event is about: the new record, or the old one for deletes.
    pub fn row(&self) -> Option<&Value> {
        self.after.as_ref().or(self.before.as_ref())
    }

    pub fn decode_after<T: DeserializeOwned>(&self) -> Result<T, BackendError> {
        let row = self
            .after
            .clone()
            .ok_or_else(|| BackendError::InvalidRow("event has no new record".to_string()))?;
        decode(row)
    }

    pub fn column(&self, name: &str) -> Option<&Value> {
        self.after
            .as_ref()
            .and_then(|r| r.get(name))
            .or_else(|| self.before.as_ref().and_then(|r| r.get(name)))
    }

    pub fn column_i64(&self, name: &str) -> Option<i64> {
        self.column(name).and_then(|v| match v {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        })
    }

    pub fn column_str(&self, name: &str) -> Option<&str> {
        self.column(name).and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const H: SubscriptionHandle = SubscriptionHandle(1);

    #[test]
    fn test_realtime_shape() {
        let event = ChangeEvent::normalize(
            &json!({
                "schema": "public",
                "table": "posts",
                "eventType": "INSERT",
                "new": { "id": 1 },
                "old": {}
            }),
            Table::Comments,
            H,
        )
        .unwrap();

        assert_eq!(event.kind, ChangeKind::Insert);
        assert_eq!(event.table, Table::Posts);
        assert_eq!(event.after, Some(json!({ "id": 1 })));
        assert_eq!(event.before, None);
    }

    #[test]
    fn test_webhook_shape_and_fallback_table() {
        let event = ChangeEvent::normalize(
            &json!({ "type": "DELETE", "record": null, "old_record": { "id": 4, "postId": 1 } }),
            Table::Comments,
            H,
        )
        .unwrap();

        assert_eq!(event.kind, ChangeKind::Delete);
        assert_eq!(event.table, Table::Comments);
        assert_eq!(event.column_i64("postId"), Some(1));
        assert_eq!(event.row(), event.before.as_ref());
    }

    #[test]
    fn test_wrapped_shape() {
        let event = ChangeEvent::normalize(
            &json!({ "data": { "type": "UPDATE", "table": "posts", "record": { "id": 2 } } }),
            Table::Posts,
            H,
        )
        .unwrap();
        assert_eq!(event.kind, ChangeKind::Update);
    }

    #[test]
    fn test_rejects_inconsistent_payloads() {
        let missing_kind = json!({ "table": "posts", "new": { "id": 1 } });
        let missing_row = json!({ "eventType": "INSERT", "table": "posts", "new": {} });
        let unknown_table = json!({ "eventType": "INSERT", "table": "nope", "new": { "id": 1 } });

        for payload in [missing_kind, missing_row, unknown_table] {
            assert!(matches!(
                ChangeEvent::normalize(&payload, Table::Posts, H),
                Err(SubscriptionError::Malformed(_))
            ));
        }
    }
}
