// SPDX-License-Identifier: MPL-2.0

//! Per-user points and the leaderboard.

use crate::backend::{Backend, BackendError, Filter, Query, Table, decode_all};
use crate::model::{Score, UserId};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

pub const SCORE_SELECT: &str = "*, user: users (id, name, image)";

/// Applies point deltas to users' scores.
///
/// Uses the backend's atomic increment. When the backend cannot do that,
/// falls back to read-modify-write serialized per user, so concurrent
/// awards from this client never overwrite each other.
pub struct ScoreService {
    backend: Arc<dyn Backend>,
    serial: Mutex<HashMap<UserId, Arc<tokio::sync::Mutex<()>>>>,
}

impl ScoreService {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            serial: Mutex::new(HashMap::new()),
        }
    }

    /// Add `delta` points to `user`. Returns the new score.
    pub async fn award(&self, user: &UserId, delta: i64) -> Result<i64, BackendError> {
        let filters = vec![Filter::eq("userid", user)];
        match self
            .backend
            .increment(Table::Scores, filters, "score", delta)
            .await
        {
            Ok(row) => Ok(score_of(&row)),
            Err(BackendError::Unsupported(_)) => {
                debug!(%user, "atomic increment unavailable, serializing");
                self.read_modify_write(user, delta).await
            }
            Err(BackendError::NotFound(_)) => self.create(user, delta).await,
            Err(e) => Err(e),
        }
    }

    fn user_lock(&self, user: &UserId) -> Arc<tokio::sync::Mutex<()>> {
        self.serial
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(user.clone())
            .or_default()
            .clone()
    }

    async fn read_modify_write(&self, user: &UserId, delta: i64) -> Result<i64, BackendError> {
        let lock = self.user_lock(user);
        let _turn = lock.lock().await;

        let rows = self
            .backend
            .query(Query::on(Table::Scores).select("score").eq("userid", user).limit(1))
            .await?;
        let Some(current) = rows.first() else {
            return self.create(user, delta).await;
        };
        let next = score_of(current) + delta;
        let updated = self
            .backend
            .update(
                Table::Scores,
                vec![Filter::eq("userid", user)],
                json!({ "score": next }),
            )
            .await?;
        Ok(updated.first().map(score_of).unwrap_or(next))
    }

    async fn create(&self, user: &UserId, delta: i64) -> Result<i64, BackendError> {
        let row = self
            .backend
            .upsert(Table::Scores, json!({ "userid": user, "score": delta }))
            .await?;
        Ok(score_of(&row))
    }

    /// Award points without failing the caller; failures are logged.
    pub async fn award_quietly(&self, user: &UserId, delta: i64) -> Option<i64> {
        match self.award(user, delta).await {
            Ok(score) => Some(score),
            Err(e) => {
                warn!(%user, delta, error = %e, "score update failed");
                None
            }
        }
    }

    /// Scores ordered highest first.
    pub async fn leaderboard(&self, limit: Option<usize>) -> Result<Vec<Score>, BackendError> {
        let mut query = Query::on(Table::Scores)
            .select(SCORE_SELECT)
            .order("score", false);
        if let Some(limit) = limit {
            query = query.limit(limit);
        }
        decode_all(self.backend.query(query).await?)
    }
}

fn score_of(row: &Value) -> i64 {
    row.get("score").and_then(Value::as_i64).unwrap_or(0)
}
