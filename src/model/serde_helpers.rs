// SPDX-License-Identifier: MPL-2.0

//! Deserializers for the loosely shaped rows the backend returns.

use crate::model::types::{GoalAssignment, GoalId, GoalKind, NotificationTarget, UserProfile};
use chrono::NaiveDate;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// Treat an explicit `null` the same as a missing field.
pub fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Accepts a bare number, the `[{"count": n}]` shape of an embedded
/// aggregate, or a materialized list of child rows.
pub fn embedded_count<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(count_from_value(&value))
}

pub(crate) fn count_from_value(value: &Value) -> u32 {
    match value {
        Value::Number(n) => n.as_u64().unwrap_or(0) as u32,
        Value::Array(items) => match items.as_slice() {
            [Value::Object(obj)] if obj.len() == 1 && obj.contains_key("count") => {
                obj.get("count").and_then(Value::as_u64).unwrap_or(0) as u32
            }
            _ => items.len() as u32,
        },
        _ => 0,
    }
}

/// Embedded profiles can come back as `{}` when the join misses.
pub fn lenient_profile<'de, D>(deserializer: D) -> Result<Option<UserProfile>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    match value {
        Value::Object(ref obj) if obj.is_empty() => Ok(None),
        Value::Object(_) => Ok(serde_json::from_value(value).ok()),
        _ => Ok(None),
    }
}

/// The notification `data` column holds JSON, sometimes double-encoded as a string.
pub fn json_or_string<'de, D>(deserializer: D) -> Result<Option<NotificationTarget>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    let target = match value {
        Value::String(s) => serde_json::from_str(&s).ok(),
        Value::Object(_) => serde_json::from_value(value).ok(),
        _ => None,
    };
    Ok(target)
}

pub mod media_path {
    use crate::model::types::MediaRef;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(media: &Option<MediaRef>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match media {
            Some(m) => serializer.serialize_some(&m.path),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<MediaRef>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let path = Option::<String>::deserialize(deserializer)?;
        Ok(path.filter(|p| !p.is_empty()).map(MediaRef::from_path))
    }
}

#[derive(Deserialize)]
struct GoalDetails {
    #[serde(default)]
    title: String,
    #[serde(rename = "type")]
    kind: GoalKind,
}

/// Raw `goal_schedule` row with its goal joined in.
#[derive(Deserialize)]
pub struct GoalScheduleRow {
    date: NaiveDate,
    #[serde(rename = "goalid")]
    goal_id: GoalId,
    goals: GoalDetails,
}

impl From<GoalScheduleRow> for GoalAssignment {
    fn from(row: GoalScheduleRow) -> Self {
        Self {
            date: row.date,
            goal_id: row.goal_id,
            kind: row.goals.kind,
            title: row.goals.title,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_count_shapes() {
        assert_eq!(count_from_value(&json!(5)), 5);
        assert_eq!(count_from_value(&json!([{ "count": 2 }])), 2);
        assert_eq!(count_from_value(&json!([{ "id": 1 }, { "id": 2 }, { "id": 3 }])), 3);
        assert_eq!(count_from_value(&json!(null)), 0);
    }
}
