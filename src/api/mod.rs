pub mod client;
pub mod events;
pub mod models;

use async_trait::async_trait;

use crate::Result;
use models::{Message, Peer};

/// Request/response collaborator the engine depends on.
///
/// Every call carries the session's bearer credential; the implementation never
/// validates it, it only reports [`crate::Error::Unauthorized`] when the server
/// rejects it.
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// All registered users, self included.
    async fn users(&self, token: &str) -> Result<Vec<Peer>>;

    /// The full message corpus visible to the session.
    async fn messages(&self, token: &str) -> Result<Vec<Message>>;

    /// Persist a message and return it with its server-issued id.
    async fn post_message(&self, token: &str, recipient_id: &str, content: &str) -> Result<Message>;
}
