// SPDX-License-Identifier: MPL-2.0

mod bus;
mod normalize;

pub use crate::backend::ChangeKind;
pub use bus::{ChangeEventBus, HandlerId};
pub use normalize::ChangeEvent;

use crate::backend::{BackendError, SubscriptionHandle, Table};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SubscriptionError {
    #[error("subscription {handle} on {table} disconnected: {reason}")]
    Disconnected {
        handle: SubscriptionHandle,
        table: Table,
        reason: String,
    },
    #[error("backend rejected subscription: {0}")]
    Rejected(#[from] BackendError),
    #[error("malformed change payload: {0}")]
    Malformed(String),
    #[error("change stream closed")]
    Closed,
}

impl SubscriptionError {
    /// Whether resubscribing after a backoff can be expected to help.
    pub fn is_retriable(&self) -> bool {
        match self {
            SubscriptionError::Disconnected { .. } => true,
            SubscriptionError::Rejected(BackendError::Transport(_)) => true,
            SubscriptionError::Rejected(_) => false,
            SubscriptionError::Malformed(_) | SubscriptionError::Closed => false,
        }
    }
}
