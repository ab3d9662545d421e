//! Conversation Synchronizer.
//!
//! Merges history loads, live inbound messages and confirmed sends into one
//! ordered sequence for the active conversation. Invariants:
//!
//! - no message id appears twice;
//! - once appended, a message never moves;
//! - activating a different key replaces the whole sequence.
//!
//! Async work (fetches, POSTs) happens elsewhere; this type only applies their
//! results, which is why history loads are split into [`activate`] and
//! [`apply_history`] joined by a [`LoadTicket`].
//!
//! [`activate`]: ConversationSynchronizer::activate
//! [`apply_history`]: ConversationSynchronizer::apply_history

use std::collections::HashSet;

use crate::api::models::{ConversationKey, Message};
use crate::{Error, Result, ValidationError};

/// Something that can echo a persisted message to the peer in real time.
pub trait Publisher {
    fn publish(&self, msg: &Message) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct ConversationState {
    messages: Vec<Message>,
    ids: HashSet<String>,
}

impl ConversationState {
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    fn append(&mut self, msg: Message) -> bool {
        if !self.ids.insert(msg.id.clone()) {
            return false;
        }
        self.messages.push(msg);
        true
    }

    fn replace(&mut self, msgs: Vec<Message>) {
        self.clear();
        for m in msgs {
            self.append(m);
        }
    }

    fn clear(&mut self) {
        self.messages.clear();
        self.ids.clear();
    }
}

/// Identifies one history request; results whose ticket is no longer current are discarded.
#[derive(Debug, Clone)]
pub struct LoadTicket {
    pub key: ConversationKey,
    generation: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    Replaced,
    Stale,
    Failed(Error),
}

/// A validated send, waiting for the server's acknowledgment.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub key: ConversationKey,
    pub content: String,
}

#[derive(Debug, Default)]
pub struct ConversationSynchronizer {
    active: Option<ConversationKey>,
    state: ConversationState,
    generation: u64,
    loading: bool,
}

impl ConversationSynchronizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active_key(&self) -> Option<&ConversationKey> {
        self.active.as_ref()
    }

    pub fn state(&self) -> &ConversationState {
        &self.state
    }

    pub fn messages(&self) -> &[Message] {
        self.state.messages()
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    /// Make `(self_id, peer_id)` the active conversation and issue a history request.
    ///
    /// A different key empties the state right away; re-activating the current
    /// key keeps what is shown until the reload lands.
    pub fn activate(&mut self, self_id: &str, peer_id: &str) -> LoadTicket {
        let key = ConversationKey::new(self_id, peer_id);
        if self.active.as_ref() != Some(&key) {
            self.state.clear();
        }
        self.active = Some(key.clone());
        self.generation += 1;
        self.loading = true;
        LoadTicket { key, generation: self.generation }
    }

    pub fn apply_history(&mut self, ticket: LoadTicket, result: Result<Vec<Message>>) -> Applied {
        if ticket.generation != self.generation || self.active.as_ref() != Some(&ticket.key) {
            log::debug!("Discarding stale history for peer {}", ticket.key.peer_id);
            return Applied::Stale;
        }
        self.loading = false;
        match result {
            Ok(msgs) => {
                self.state.replace(msgs);
                Applied::Replaced
            }
            Err(e) => {
                log::warn!("History for peer {} unavailable: {e}", ticket.key.peer_id);
                Applied::Failed(e)
            }
        }
    }

    /// Append a live message if it belongs to the active conversation and is new.
    pub fn on_inbound(&mut self, msg: Message) -> bool {
        match &self.active {
            Some(key) if key.contains(&msg) => self.state.append(msg),
            _ => false,
        }
    }

    /// Drop the active conversation (peer unselected or session ended).
    pub fn deactivate(&mut self) {
        self.active = None;
        self.state.clear();
        self.generation += 1;
        self.loading = false;
    }

    /// Validate a send before anything touches the network.
    pub fn prepare_send(&self, content: &str) -> Result<OutgoingMessage> {
        if content.trim().is_empty() {
            return Err(ValidationError::EmptyContent.into());
        }
        let key = self.active.clone().ok_or(ValidationError::NoActivePeer)?;
        Ok(OutgoingMessage { key, content: content.to_string() })
    }

    /// Apply the server's answer to a send.
    ///
    /// Only an acknowledged message is appended (when its conversation is
    /// still active) and echoed through `publisher`. A failed echo is logged;
    /// the server response stays authoritative.
    pub fn complete_send(
        &mut self,
        key: &ConversationKey,
        result: Result<Message>,
        publisher: &dyn Publisher,
    ) -> Result<Message> {
        let msg = result?;
        if self.active.as_ref() == Some(key) {
            self.on_inbound(msg.clone());
        } else {
            log::debug!("Sent message {} belongs to an inactive conversation", msg.id);
        }
        if let Err(e) = publisher.publish(&msg) {
            log::warn!("Live echo of message {} dropped: {e}", msg.id);
        }
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ChatApi;
    use crate::testing::{msg, FakeApi, RecordingPublisher};

    /// The engine's send path: validate, POST, then apply the answer.
    async fn send(
        sync: &mut ConversationSynchronizer,
        api: &dyn ChatApi,
        publisher: &dyn Publisher,
        content: &str,
    ) -> Result<Message> {
        let outgoing = sync.prepare_send(content)?;
        let result = api
            .post_message("tok", &outgoing.key.peer_id, &outgoing.content)
            .await;
        sync.complete_send(&outgoing.key, result, publisher)
    }

    fn ids(sync: &ConversationSynchronizer) -> Vec<String> {
        sync.messages().iter().map(|m| m.id.clone()).collect()
    }

    fn seeded(history: Vec<Message>) -> ConversationSynchronizer {
        let mut sync = ConversationSynchronizer::new();
        let ticket = sync.activate("u1", "u2");
        assert_eq!(sync.apply_history(ticket, Ok(history)), Applied::Replaced);
        sync
    }

    #[test]
    fn duplicate_inbound_ids_appear_once() {
        let mut sync = seeded(vec![msg("m1", "u1", "u2", 1)]);
        for _ in 0..3 {
            sync.on_inbound(msg("m2", "u2", "u1", 2));
            sync.on_inbound(msg("m1", "u1", "u2", 1));
        }
        assert_eq!(ids(&sync), ["m1", "m2"]);
    }

    #[test]
    fn appends_keep_history_order() {
        let mut sync = seeded(vec![msg("m1", "u1", "u2", 1), msg("m2", "u2", "u1", 2)]);
        for (i, ts) in [3, 5, 8].into_iter().enumerate() {
            assert!(sync.on_inbound(msg(&format!("n{i}"), "u2", "u1", ts)));
        }
        let ts: Vec<_> = sync.messages().iter().map(|m| m.timestamp).collect();
        assert!(ts.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(sync.state().len(), 5);
    }

    #[test]
    fn inbound_for_other_pairs_is_ignored() {
        let mut sync = seeded(Vec::new());
        assert!(!sync.on_inbound(msg("x", "u3", "u1", 1)));
        assert!(!sync.on_inbound(msg("y", "u2", "u3", 1)));
        assert!(sync.state().is_empty());

        let mut idle = ConversationSynchronizer::new();
        assert!(!idle.on_inbound(msg("z", "u2", "u1", 1)));
    }

    #[test]
    fn activating_another_key_replaces_state() {
        let mut sync = seeded(vec![msg("m1", "u1", "u2", 1)]);
        let ticket = sync.activate("u1", "u3");
        assert!(sync.messages().is_empty());
        assert!(sync.is_loading());
        sync.apply_history(ticket, Ok(vec![msg("k1", "u3", "u1", 4)]));
        assert_eq!(ids(&sync), ["k1"]);
        assert!(!sync.is_loading());
    }

    #[test]
    fn switching_away_and_back_restores_state() {
        let history = vec![msg("m1", "u1", "u2", 1), msg("m2", "u2", "u1", 2)];
        let mut sync = seeded(history.clone());
        let before = sync.messages().to_vec();

        let ticket = sync.activate("u1", "u3");
        sync.apply_history(ticket, Ok(Vec::new()));
        let ticket = sync.activate("u1", "u2");
        sync.apply_history(ticket, Ok(history));

        assert_eq!(sync.messages(), before.as_slice());
    }

    #[test]
    fn stale_history_is_discarded() {
        let mut sync = ConversationSynchronizer::new();
        let for_u2 = sync.activate("u1", "u2");
        let for_u3 = sync.activate("u1", "u3");

        assert_eq!(
            sync.apply_history(for_u2, Ok(vec![msg("m1", "u1", "u2", 1)])),
            Applied::Stale
        );
        assert!(sync.messages().is_empty());
        assert_eq!(
            sync.apply_history(for_u3, Ok(vec![msg("k1", "u1", "u3", 1)])),
            Applied::Replaced
        );
        assert_eq!(ids(&sync), ["k1"]);
    }

    #[test]
    fn superseded_reload_of_same_key_is_discarded() {
        let mut sync = seeded(vec![msg("m1", "u1", "u2", 1)]);
        let first = sync.activate("u1", "u2");
        let second = sync.activate("u1", "u2");
        assert_eq!(ids(&sync), ["m1"]);
        assert_eq!(sync.apply_history(first, Ok(Vec::new())), Applied::Stale);
        assert_eq!(sync.apply_history(second, Ok(Vec::new())), Applied::Replaced);
        assert!(sync.messages().is_empty());
    }

    #[test]
    fn history_replaces_live_messages_that_arrived_first() {
        let mut sync = ConversationSynchronizer::new();
        let ticket = sync.activate("u1", "u2");
        sync.on_inbound(msg("live", "u2", "u1", 9));
        sync.apply_history(ticket, Ok(vec![msg("m1", "u1", "u2", 1)]));
        assert_eq!(ids(&sync), ["m1"]);
    }

    #[test]
    fn failed_history_leaves_state() {
        let mut sync = seeded(vec![msg("m1", "u1", "u2", 1)]);
        let ticket = sync.activate("u1", "u2");
        let applied = sync.apply_history(ticket, Err(Error::Network("down".into())));
        assert_eq!(applied, Applied::Failed(Error::Network("down".into())));
        assert_eq!(ids(&sync), ["m1"]);
        assert!(!sync.is_loading());
    }

    #[test]
    fn deactivate_drops_pending_loads() {
        let mut sync = ConversationSynchronizer::new();
        let ticket = sync.activate("u1", "u2");
        sync.deactivate();
        assert_eq!(sync.apply_history(ticket, Ok(Vec::new())), Applied::Stale);
        assert!(sync.active_key().is_none());
    }

    #[tokio::test]
    async fn blank_content_never_reaches_the_server() {
        let api = FakeApi::new();
        let publisher = RecordingPublisher::default();
        let mut sync = seeded(vec![msg("m1", "u1", "u2", 1)]);

        for content in ["", "   "] {
            let err = send(&mut sync, &api, &publisher, content).await.unwrap_err();
            assert_eq!(err, Error::Validation(ValidationError::EmptyContent));
        }
        assert_eq!(api.post_calls(), 0);
        assert_eq!(ids(&sync), ["m1"]);
        assert!(publisher.published().is_empty());
    }

    #[tokio::test]
    async fn send_without_peer_is_rejected() {
        let api = FakeApi::new();
        let mut sync = ConversationSynchronizer::new();
        let err = send(&mut sync, &api, &RecordingPublisher::default(), "hi")
            .await
            .unwrap_err();
        assert_eq!(err, Error::Validation(ValidationError::NoActivePeer));
        assert_eq!(api.post_calls(), 0);
    }

    #[tokio::test]
    async fn confirmed_send_is_appended_and_echoed() {
        let api = FakeApi::new();
        let publisher = RecordingPublisher::default();
        let mut sync = seeded(Vec::new());

        let sent = send(&mut sync, &api, &publisher, "hello").await.unwrap();
        assert_eq!(sent.recipient_id, "u2");
        assert_eq!(sent.content, "hello");
        assert_eq!(ids(&sync), [sent.id.clone()]);
        assert_eq!(publisher.published(), vec![sent.clone()]);

        // The echo coming back over the live channel changes nothing.
        assert!(!sync.on_inbound(sent));
        assert_eq!(sync.state().len(), 1);
    }

    #[tokio::test]
    async fn rejected_send_reports_server_message() {
        let api = FakeApi::new();
        api.fail_posts(Error::Rejected("too long".into()));
        let publisher = RecordingPublisher::default();
        let mut sync = seeded(vec![msg("m1", "u1", "u2", 1)]);

        let err = send(&mut sync, &api, &publisher, "hello").await.unwrap_err();
        assert_eq!(err.to_string(), "too long");
        assert_eq!(ids(&sync), ["m1"]);
        assert!(publisher.published().is_empty());
    }

    #[tokio::test]
    async fn echo_failure_does_not_fail_the_send() {
        let api = FakeApi::new();
        let publisher = RecordingPublisher::unavailable();
        let mut sync = seeded(Vec::new());
        let sent = send(&mut sync, &api, &publisher, "hi").await.unwrap();
        assert!(sync.state().contains(&sent.id));
    }

    #[test]
    fn completion_for_inactive_conversation_is_not_appended() {
        let mut sync = seeded(Vec::new());
        let outgoing = sync.prepare_send("hi").unwrap();
        sync.activate("u1", "u3");
        let publisher = RecordingPublisher::default();
        let res = sync.complete_send(&outgoing.key, Ok(msg("s1", "u1", "u2", 1)), &publisher);
        assert!(res.is_ok());
        assert!(sync.messages().is_empty());
    }
}
