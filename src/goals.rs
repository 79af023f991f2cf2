// SPDX-License-Identifier: MPL-2.0

//! Daily goal lookup.
//!
//! The schedule is keyed by calendar date. Which calendar is meant is a
//! deployment decision, so the day boundary is explicit.

use crate::backend::{Backend, BackendError, Query, Table, decode};
use crate::model::{GoalAssignment, GoalCompletion, MediaRef, PostId, UserId};
use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

pub const GOAL_SELECT: &str = "*, goals: goalid (title, type)";

/// Where one calendar day ends and the next begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DayBoundary {
    #[default]
    Utc,
    /// A fixed offset east of UTC, in minutes (e.g. 330 for UTC+05:30).
    FixedOffset(i32),
}

impl DayBoundary {
    pub fn today(self, now: DateTime<Utc>) -> NaiveDate {
        match self {
            DayBoundary::Utc => now.date_naive(),
            DayBoundary::FixedOffset(minutes) => match FixedOffset::east_opt(minutes * 60) {
                Some(offset) => now.with_timezone(&offset).date_naive(),
                None => now.date_naive(),
            },
        }
    }

    /// The schedule key for `now`, formatted `YYYY-MM-DD`.
    pub fn today_key(self, now: DateTime<Utc>) -> String {
        self.today(now).format("%Y-%m-%d").to_string()
    }
}

/// Today's assignment and whether the user already satisfied it.
#[derive(Debug, Clone, PartialEq)]
pub struct GoalStatus {
    pub assignment: GoalAssignment,
    pub completed: bool,
}

impl GoalStatus {
    /// Whether a new post with `media` would earn credit for this goal.
    pub fn credits(&self, media: Option<&MediaRef>) -> bool {
        !self.completed && self.assignment.kind.accepts(media)
    }
}

pub struct GoalTracker {
    backend: Arc<dyn Backend>,
    boundary: DayBoundary,
}

impl GoalTracker {
    pub fn new(backend: Arc<dyn Backend>, boundary: DayBoundary) -> Self {
        Self { backend, boundary }
    }

    /// Today's assignment, if the schedule has one.
    pub async fn assignment(&self, now: DateTime<Utc>) -> Result<Option<GoalAssignment>, BackendError> {
        let key = self.boundary.today_key(now);
        let rows = self
            .backend
            .query(
                Query::on(Table::GoalSchedule)
                    .select(GOAL_SELECT)
                    .eq("date", key.as_str())
                    .limit(1),
            )
            .await?;
        debug!(date = %key, found = !rows.is_empty(), "goal schedule lookup");
        rows.into_iter().next().map(decode).transpose()
    }

    pub async fn is_completed(&self, user: &UserId, goal: &GoalAssignment) -> Result<bool, BackendError> {
        let rows = self
            .backend
            .query(
                Query::on(Table::GoalCompletions)
                    .eq("userid", user)
                    .eq("goalid", goal.goal_id)
                    .limit(1),
            )
            .await?;
        Ok(!rows.is_empty())
    }

    pub async fn status(&self, user: &UserId, now: DateTime<Utc>) -> Result<Option<GoalStatus>, BackendError> {
        let Some(assignment) = self.assignment(now).await? else {
            return Ok(None);
        };
        let completed = self.is_completed(user, &assignment).await?;
        Ok(Some(GoalStatus {
            assignment,
            completed,
        }))
    }

    pub async fn record_completion(
        &self,
        user: &UserId,
        goal: &GoalAssignment,
        post: PostId,
    ) -> Result<GoalCompletion, BackendError> {
        let row = self
            .backend
            .upsert(
                Table::GoalCompletions,
                json!({ "userid": user, "goalid": goal.goal_id, "postid": post }),
            )
            .await?;
        decode(row)
    }
}
