// SPDX-License-Identifier: MPL-2.0

//! Identity of the signed-in user and its changes.
//!
//! The auth provider lives outside this crate; it reports sign-in and
//! sign-out here, and the engine treats every change as a hard reset.

use crate::model::UserId;
use tokio::sync::watch;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    SignedIn(UserId),
    SignedOut,
}

/// The current user, observable through a watch channel.
#[derive(Debug)]
pub struct Session {
    tx: watch::Sender<Option<UserId>>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    pub fn current_user(&self) -> Option<UserId> {
        self.tx.borrow().clone()
    }

    /// Returns the event to hand to the engine, or `None` when the same
    /// user was already signed in.
    pub fn sign_in(&self, user: UserId) -> Option<SessionEvent> {
        let changed = self.tx.send_if_modified(|current| {
            if current.as_ref() == Some(&user) {
                return false;
            }
            *current = Some(user.clone());
            true
        });
        changed.then(|| {
            info!(%user, "signed in");
            SessionEvent::SignedIn(user)
        })
    }

    pub fn sign_out(&self) -> Option<SessionEvent> {
        let changed = self.tx.send_if_modified(|current| current.take().is_some());
        changed.then(|| {
            info!("signed out");
            SessionEvent::SignedOut
        })
    }

    /// Subscribe to user changes.
    pub fn changes(&self) -> watch::Receiver<Option<UserId>> {
        self.tx.subscribe()
    }
}

impl SessionEvent {
    /// The event that moves a listener from nothing to `user`.
    pub fn from_user(user: Option<UserId>) -> Self {
        match user {
            Some(user) => SessionEvent::SignedIn(user),
            None => SessionEvent::SignedOut,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_in_and_out() {
        let session = Session::new();
        assert_eq!(session.current_user(), None);
        assert_eq!(session.sign_out(), None);

        let me = UserId::new("me");
        assert_eq!(session.sign_in(me.clone()), Some(SessionEvent::SignedIn(me.clone())));
        assert_eq!(session.sign_in(me.clone()), None);
        assert_eq!(session.current_user(), Some(me));

        assert_eq!(session.sign_out(), Some(SessionEvent::SignedOut));
        assert_eq!(session.current_user(), None);
    }

    #[tokio::test]
    async fn test_changes_are_observable() {
        let session = Session::new();
        let mut rx = session.changes();
        session.sign_in(UserId::new("u-1"));
        rx.changed().await.unwrap();
        let event = SessionEvent::from_user(rx.borrow_and_update().clone());
        assert_eq!(event, SessionEvent::SignedIn(UserId::new("u-1")));
    }
}
