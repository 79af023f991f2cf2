// SPDX-License-Identifier: MPL-2.0

//! Realtime feed synchronization for the EcoQuest client.
//!
//! A [`SyncEngine`] keeps the locally held feeds, the open post thread and
//! the notification badge consistent with a hosted backend, merging three
//! sources of change: paginated fetches, the per-table change-event
//! stream, and the user's own optimistic writes.

pub mod backend;
pub mod cache;
pub mod config;
pub mod engine;
pub mod events;
pub mod feed;
pub mod goals;
pub mod model;
pub mod mutation;
pub mod notifications;
pub mod runtime;
pub mod score;
pub mod session;
pub mod state;

pub use backend::{Backend, BackendError, MemoryBackend, MemoryStorage, ObjectStorage, Table};
pub use engine::{SyncEngine, SyncError};
pub use events::{ChangeEvent, ChangeEventBus, SubscriptionError};
pub use feed::{FeedScope, PageMode, PageState};
pub use mutation::{MutationError, OptimisticMutationCoordinator, PostDraft};
pub use session::{Session, SessionEvent};
pub use state::{SyncSettings, SyncState};
