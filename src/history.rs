use std::sync::Arc;

use crate::api::models::{ConversationKey, Message};
use crate::api::ChatApi;
use crate::Result;

#[derive(Clone)]
pub struct HistoryLoader {
    api: Arc<dyn ChatApi>,
}

impl HistoryLoader {
    pub fn new(api: Arc<dyn ChatApi>) -> Self {
        Self { api }
    }

    /// Fetch the full corpus and keep only `key`'s pair, sorted by timestamp.
    pub async fn load(&self, token: &str, key: &ConversationKey) -> Result<Vec<Message>> {
        let corpus = self.api.messages(token).await?;
        Ok(conversation(corpus, key))
    }
}

/// Filter a corpus down to one pair (either orientation). The sort is stable,
/// so equal timestamps keep their fetch order.
pub fn conversation(corpus: Vec<Message>, key: &ConversationKey) -> Vec<Message> {
    let mut out: Vec<Message> = corpus.into_iter().filter(|m| key.contains(m)).collect();
    out.sort_by_key(|m| m.timestamp);
    out
}
