//! Session Store: the signed-in identity and its bearer credential.

use tokio::sync::watch;

use crate::api::models::Identity;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub identity: Identity,
    pub token: String,
}

/// Holds the current session and broadcasts presence changes.
///
/// Subscribers are only woken by actual transitions: absent to present,
/// present to absent, or a switch to a different identity id. Setting the same
/// identity again (for instance with a refreshed token) updates the credential
/// silently.
pub struct SessionStore {
    tx: watch::Sender<Option<Session>>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    pub fn identity(&self) -> Option<Identity> {
        self.tx.borrow().as_ref().map(|s| s.identity.clone())
    }

    pub fn token(&self) -> Option<String> {
        self.tx.borrow().as_ref().map(|s| s.token.clone())
    }

    pub fn current(&self) -> Option<Session> {
        self.tx.borrow().clone()
    }

    pub fn is_present(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Replace the session. Returns `true` when this was an actual transition.
    pub fn set(&self, session: Option<Session>) -> bool {
        self.tx.send_if_modified(|current| {
            let transition = match (current.as_ref(), session.as_ref()) {
                (None, None) => false,
                (Some(a), Some(b)) => a.identity.id != b.identity.id,
                _ => true,
            };
            *current = session;
            transition
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Session>> {
        self.tx.subscribe()
    }
}
