//! Client-side chat state shared by the support widget, the consultation
//! widget and the operator dashboard. Transport agnostic: feed it server
//! events, send whatever it hands back.

use std::collections::{BTreeMap, HashSet};

use chrono::Utc;
use uuid::Uuid;

use crate::{
    auth::Identity,
    channel::channel_id,
    dedup::{Deduplicator, Verdict, DEFAULT_CAPACITY},
    error::{ChatError, ChatResult},
    recommendation::{ensure_may_attach, validate_snapshot},
    types::{
        ChannelRef, ClientEvent, ConversationDeleted, ErrorPayload, HistoryRequest, Message,
        MessageWarning, PresenceStatus, ProductSnapshot, PublishBody, Role, SendMessageEvent,
        ServerEvent, Topic,
    },
};

pub const LOCAL_ID_PREFIX: &str = "local_";

/// Visible messages kept per channel. Matches the dedup ring so everything
/// on screen is still recognised on redelivery.
pub const TRANSCRIPT_LIMIT: usize = DEFAULT_CAPACITY;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Reconnecting,
}

/// What a server event changed, for the view layer.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientUpdate {
    Appended(Vec<Message>),
    /// History placed ahead of live messages that beat it to the client.
    Inserted { index: usize, messages: Vec<Message> },
    Presence(PresenceStatus),
    Warning(MessageWarning),
    Rejected(ErrorPayload),
    ChannelRemoved(String),
    Ignored,
}

#[derive(Debug, Clone)]
struct OpenChannel {
    topic: Topic,
    customer_id: String,
    messages: Vec<Message>,
    dedup: Deduplicator,
    /// Where the next history response goes: the transcript length when the
    /// channel was (re)joined. `None` once history has been merged.
    seed_at: Option<usize>,
}

impl OpenChannel {
    fn new(topic: Topic, customer_id: String) -> Self {
        Self {
            topic,
            customer_id,
            messages: Vec::new(),
            dedup: Deduplicator::default(),
            seed_at: Some(0),
        }
    }

    fn admit(&mut self, message: Message) -> Option<Message> {
        match self.dedup.admit(&message) {
            Verdict::Fresh => {
                self.messages.push(message.clone());
                self.trim();
                Some(message)
            }
            Verdict::DuplicateId | Verdict::DuplicateEcho { .. } => None,
        }
    }

    /// Merges a history page. The first page after a join lands at the seed
    /// point, ahead of any live message that arrived before it; later pages
    /// only append what is new.
    fn seed(&mut self, history: Vec<Message>) -> ClientUpdate {
        let fresh = history
            .into_iter()
            .filter(|message| self.dedup.admit(message).is_fresh())
            .collect::<Vec<_>>();
        let index = self
            .seed_at
            .take()
            .unwrap_or(self.messages.len())
            .min(self.messages.len());
        if fresh.is_empty() {
            return ClientUpdate::Ignored;
        }
        let tail = index == self.messages.len();
        let rest = self.messages.split_off(index);
        self.messages.extend(fresh.iter().cloned());
        self.messages.extend(rest);
        let index = index.saturating_sub(self.trim());
        if tail {
            ClientUpdate::Appended(fresh)
        } else {
            ClientUpdate::Inserted {
                index,
                messages: fresh,
            }
        }
    }

    /// Drops the oldest messages past the limit; returns how many went.
    fn trim(&mut self) -> usize {
        let excess = self.messages.len().saturating_sub(TRANSCRIPT_LIMIT);
        if excess > 0 {
            self.messages.drain(..excess);
            self.seed_at = self.seed_at.map(|at| at.saturating_sub(excess));
        }
        excess
    }

    fn remove(&mut self, id: &str) -> bool {
        let Some(pos) = self.messages.iter().position(|message| message.id == id) else {
            return false;
        };
        self.messages.remove(pos);
        if let Some(at) = self.seed_at.as_mut() {
            if pos < *at {
                *at -= 1;
            }
        }
        true
    }
}

pub struct ChatClient {
    identity: Identity,
    channels: BTreeMap<String, OpenChannel>,
    pending: HashSet<String>,
    presence: PresenceStatus,
    state: ConnectionState,
}

impl ChatClient {
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            channels: BTreeMap::new(),
            pending: HashSet::new(),
            presence: PresenceStatus::Offline,
            state: ConnectionState::Connected,
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn presence(&self) -> PresenceStatus {
        self.presence
    }

    pub fn transcript(&self, channel_id: &str) -> &[Message] {
        self.channels
            .get(channel_id)
            .map(|channel| channel.messages.as_slice())
            .unwrap_or(&[])
    }

    /// Local ids sent but not yet acknowledged by the server.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Whether the composer for `topic` should be enabled.
    pub fn can_compose(&self, topic: Topic) -> bool {
        self.state == ConnectionState::Connected
            && !(self.identity.role == Role::Customer
                && topic == Topic::Consultant
                && self.presence == PresenceStatus::Offline)
    }

    /// Starts tracking a channel; returns the join and history requests.
    pub fn open(&mut self, topic: Topic, customer_id: &str) -> ChatResult<Vec<ClientEvent>> {
        let channel = channel_id(topic, customer_id)?;
        let customer_id = customer_id.trim().to_string();
        self.channels
            .entry(channel)
            .or_insert_with(|| OpenChannel::new(topic, customer_id.clone()));
        Ok(join_events(topic, &customer_id))
    }

    pub fn close(&mut self, topic: Topic, customer_id: &str) -> ChatResult<ClientEvent> {
        let channel = channel_id(topic, customer_id)?;
        self.channels.remove(&channel);
        Ok(ClientEvent::ChannelLeave(channel_ref(topic, customer_id.trim())))
    }

    /// Inserts an optimistic copy and returns the `message:send` to transmit.
    pub fn compose(
        &mut self,
        topic: Topic,
        customer_id: &str,
        content: &str,
        recommendation: Option<ProductSnapshot>,
    ) -> ChatResult<ClientEvent> {
        let channel = channel_id(topic, customer_id)?;
        if self.state == ConnectionState::Reconnecting {
            return Err(ChatError::Transport("reconnecting".into()));
        }
        if !self.can_compose(topic) {
            return Err(ChatError::validation(
                "consultants are offline; try again later",
            ));
        }
        if let Some(snapshot) = &recommendation {
            ensure_may_attach(&self.identity, topic)?;
            validate_snapshot(snapshot)?;
        }
        let content = content.trim().to_string();
        if content.is_empty() && recommendation.is_none() {
            return Err(ChatError::validation("message content is empty"));
        }
        let open = self
            .channels
            .get_mut(&channel)
            .ok_or_else(|| ChatError::validation(format!("channel {channel} is not open")))?;

        let message = Message {
            id: format!("{LOCAL_ID_PREFIX}{}", Uuid::new_v4()),
            channel_id: channel.clone(),
            sender_role: self.identity.role.sender_role_on(topic),
            sender_id: self.identity.user_id.clone(),
            content,
            created_at: Utc::now(),
            recommendation,
        };
        let body = PublishBody {
            id: Some(message.id.clone()),
            content: message.content.clone(),
            created_at: Some(message.created_at),
            recommendation: message
                .recommendation
                .as_ref()
                .and_then(|snapshot| serde_json::to_value(snapshot).ok()),
        };
        self.pending.insert(message.id.clone());
        open.admit(message);

        Ok(ClientEvent::MessageSend(SendMessageEvent {
            topic: topic.as_str().to_string(),
            customer_id: open.customer_id.clone(),
            body,
        }))
    }

    /// Drops an optimistic message the server refused.
    pub fn retract(&mut self, channel_id: &str, id: &str) -> bool {
        self.pending.remove(id);
        let Some(open) = self.channels.get_mut(channel_id) else {
            return false;
        };
        open.dedup.forget(id);
        open.remove(id)
    }

    pub fn handle_event(&mut self, event: ServerEvent) -> ClientUpdate {
        match event {
            ServerEvent::MessageNew(message) => {
                let Some(open) = self.channels.get_mut(&message.channel_id) else {
                    return ClientUpdate::Ignored;
                };
                match open.admit(message) {
                    Some(message) => ClientUpdate::Appended(vec![message]),
                    None => ClientUpdate::Ignored,
                }
            }
            ServerEvent::ChannelHistory(history) => {
                let Some(open) = self.channels.get_mut(&history.channel_id) else {
                    return ClientUpdate::Ignored;
                };
                open.seed(history.messages)
            }
            ServerEvent::MessageAck(ack) => {
                self.pending.remove(&ack.id);
                ClientUpdate::Ignored
            }
            ServerEvent::MessageWarning(warning) => {
                self.pending.remove(&warning.id);
                ClientUpdate::Warning(warning)
            }
            ServerEvent::PresenceStatus(update) => {
                self.presence = update.status;
                ClientUpdate::Presence(update.status)
            }
            ServerEvent::ConversationDeleted(ConversationDeleted { channel_id }) => {
                if self.channels.remove(&channel_id).is_some() {
                    ClientUpdate::ChannelRemoved(channel_id)
                } else {
                    ClientUpdate::Ignored
                }
            }
            ServerEvent::Error(payload) => ClientUpdate::Rejected(payload),
            _ => ClientUpdate::Ignored,
        }
    }

    pub fn on_transport_lost(&mut self) {
        self.state = ConnectionState::Reconnecting;
    }

    /// Rejoins every open channel. History is re-requested and merged
    /// through dedup, so nothing shows twice; what was missed while away
    /// lands before anything live that arrives after the rejoin.
    pub fn on_reconnected(&mut self) -> Vec<ClientEvent> {
        self.state = ConnectionState::Connected;
        self.channels
            .values_mut()
            .flat_map(|open| {
                open.seed_at = Some(open.messages.len());
                join_events(open.topic, &open.customer_id)
            })
            .collect()
    }
}

fn channel_ref(topic: Topic, customer_id: &str) -> ChannelRef {
    ChannelRef {
        topic: topic.as_str().to_string(),
        customer_id: customer_id.to_string(),
    }
}

fn join_events(topic: Topic, customer_id: &str) -> Vec<ClientEvent> {
    vec![
        ClientEvent::ChannelJoin(channel_ref(topic, customer_id)),
        ClientEvent::ChannelHistory(HistoryRequest {
            topic: topic.as_str().to_string(),
            customer_id: customer_id.to_string(),
            limit: None,
        }),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChannelHistory, MessageAck, PresenceUpdate, SenderRole};
    use chrono::Duration;

    fn customer() -> ChatClient {
        ChatClient::new(Identity::new("c1", Role::Customer))
    }

    fn sent_id(event: &ClientEvent) -> String {
        match event {
            ClientEvent::MessageSend(send) => send.body.id.clone().unwrap_or_default(),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn compose_inserts_optimistic_copy() {
        let mut client = customer();
        client.open(Topic::Support, "c1").unwrap();
        let event = client.compose(Topic::Support, "c1", " Hello ", None).unwrap();
        let id = sent_id(&event);
        assert!(id.starts_with(LOCAL_ID_PREFIX));

        let transcript = client.transcript("support_c1");
        assert_eq!(transcript.len(), 1);
        assert_eq!(transcript[0].content, "Hello");
        assert_eq!(transcript[0].sender_role, SenderRole::Customer);
        assert_eq!(client.pending(), 1);
    }

    #[test]
    fn server_echo_collapses_into_local_copy() {
        let mut client = customer();
        client.open(Topic::Support, "c1").unwrap();
        client.compose(Topic::Support, "c1", "Hello", None).unwrap();
        let local = client.transcript("support_c1")[0].clone();

        let echo = Message {
            id: "srv-1".into(),
            created_at: local.created_at + Duration::milliseconds(400),
            ..local.clone()
        };
        assert_eq!(
            client.handle_event(ServerEvent::MessageNew(echo.clone())),
            ClientUpdate::Ignored
        );
        // Redelivery of the echo and a history refetch change nothing either.
        client.handle_event(ServerEvent::MessageNew(echo.clone()));
        client.handle_event(ServerEvent::ChannelHistory(ChannelHistory {
            channel_id: "support_c1".into(),
            messages: vec![echo],
        }));
        assert_eq!(client.transcript("support_c1").len(), 1);
    }

    #[test]
    fn offline_consultants_disable_customer_composer() {
        let mut client = customer();
        client.open(Topic::Consultant, "c1").unwrap();
        assert!(!client.can_compose(Topic::Consultant));
        assert!(matches!(
            client.compose(Topic::Consultant, "c1", "Is my skin dry?", None),
            Err(ChatError::Validation(_))
        ));
        assert!(client.transcript("consultant_c1").is_empty());

        client.handle_event(ServerEvent::PresenceStatus(PresenceUpdate {
            status: PresenceStatus::Online,
        }));
        assert!(client
            .compose(Topic::Consultant, "c1", "Is my skin dry?", None)
            .is_ok());
    }

    #[test]
    fn reconnect_rejoins_open_channels() {
        let mut client = ChatClient::new(Identity::new("ad", Role::Admin));
        client.open(Topic::Support, "c1").unwrap();
        client.open(Topic::Consultant, "c2").unwrap();

        client.on_transport_lost();
        assert_eq!(client.state(), ConnectionState::Reconnecting);
        assert!(matches!(
            client.compose(Topic::Support, "c1", "hi", None),
            Err(ChatError::Transport(_))
        ));

        let events = client.on_reconnected();
        assert_eq!(client.state(), ConnectionState::Connected);
        let joins = events
            .iter()
            .filter(|e| matches!(e, ClientEvent::ChannelJoin(_)))
            .count();
        assert_eq!(joins, 2);
        assert_eq!(events.len(), 4);
    }

    #[test]
    fn only_consultants_compose_recommendations() {
        let snapshot = ProductSnapshot {
            product_id: "p1".into(),
            name: "Night Serum".into(),
            price: 39.0,
            image_url: String::new(),
            rating: Some(4.5),
        };
        let mut client = customer();
        client.open(Topic::Support, "c1").unwrap();
        assert!(client
            .compose(Topic::Support, "c1", "", Some(snapshot.clone()))
            .is_err());

        let mut consultant = ChatClient::new(Identity::new("co", Role::Consultant));
        consultant.open(Topic::Consultant, "c1").unwrap();
        let event = consultant
            .compose(Topic::Consultant, "c1", "", Some(snapshot))
            .unwrap();
        match event {
            ClientEvent::MessageSend(send) => {
                assert_eq!(send.body.recommendation.unwrap()["productId"], "p1");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn ack_clears_pending_and_retract_removes_local_copy() {
        let mut client = customer();
        client.open(Topic::Support, "c1").unwrap();
        let id = sent_id(&client.compose(Topic::Support, "c1", "a", None).unwrap());
        client.handle_event(ServerEvent::MessageAck(MessageAck {
            channel_id: "support_c1".into(),
            id: id.clone(),
        }));
        assert_eq!(client.pending(), 0);

        let other = sent_id(&client.compose(Topic::Support, "c1", "b", None).unwrap());
        assert!(client.retract("support_c1", &other));
        assert_eq!(client.transcript("support_c1").len(), 1);
    }

    fn server_message(id: &str, secs: i64) -> Message {
        Message {
            id: id.into(),
            channel_id: "support_c1".into(),
            sender_role: SenderRole::Support,
            sender_id: "op".into(),
            content: format!("text of {id}"),
            created_at: Utc::now() - Duration::minutes(10) + Duration::seconds(secs * 10),
            recommendation: None,
        }
    }

    fn ids(client: &ChatClient) -> Vec<String> {
        client
            .transcript("support_c1")
            .iter()
            .map(|m| m.id.clone())
            .collect()
    }

    #[test]
    fn history_lands_before_live_messages_that_beat_it() {
        let mut client = customer();
        client.open(Topic::Support, "c1").unwrap();
        let (m1, m2, m3) = (
            server_message("m1", 1),
            server_message("m2", 2),
            server_message("m3", 3),
        );

        client.handle_event(ServerEvent::MessageNew(m3.clone()));
        let update = client.handle_event(ServerEvent::ChannelHistory(ChannelHistory {
            channel_id: "support_c1".into(),
            messages: vec![m1.clone(), m2.clone(), m3.clone()],
        }));
        assert_eq!(
            update,
            ClientUpdate::Inserted {
                index: 0,
                messages: vec![m1.clone(), m2.clone()],
            }
        );
        assert_eq!(ids(&client), vec!["m1", "m2", "m3"]);

        // A later history refetch only appends what is new.
        let m4 = server_message("m4", 4);
        client.handle_event(ServerEvent::ChannelHistory(ChannelHistory {
            channel_id: "support_c1".into(),
            messages: vec![m2, m3, m4],
        }));
        assert_eq!(ids(&client), vec!["m1", "m2", "m3", "m4"]);
    }

    #[test]
    fn missed_messages_land_before_post_reconnect_traffic() {
        let mut client = customer();
        client.open(Topic::Support, "c1").unwrap();
        client.handle_event(ServerEvent::ChannelHistory(ChannelHistory {
            channel_id: "support_c1".into(),
            messages: vec![server_message("m1", 1)],
        }));

        client.on_transport_lost();
        client.on_reconnected();
        client.handle_event(ServerEvent::MessageNew(server_message("m3", 3)));
        client.handle_event(ServerEvent::ChannelHistory(ChannelHistory {
            channel_id: "support_c1".into(),
            messages: vec![
                server_message("m1", 1),
                server_message("m2", 2),
                server_message("m3", 3),
            ],
        }));
        assert_eq!(ids(&client), vec!["m1", "m2", "m3"]);
    }

    #[test]
    fn transcript_keeps_the_newest_messages() {
        let mut client = customer();
        client.open(Topic::Support, "c1").unwrap();
        client.handle_event(ServerEvent::ChannelHistory(ChannelHistory {
            channel_id: "support_c1".into(),
            messages: Vec::new(),
        }));
        for n in 0..TRANSCRIPT_LIMIT + 5 {
            client.handle_event(ServerEvent::MessageNew(server_message(
                &format!("m{n}"),
                n as i64,
            )));
        }
        let transcript = client.transcript("support_c1");
        assert_eq!(transcript.len(), TRANSCRIPT_LIMIT);
        assert_eq!(transcript[0].id, "m5");
        assert_eq!(
            transcript[TRANSCRIPT_LIMIT - 1].id,
            format!("m{}", TRANSCRIPT_LIMIT + 4)
        );
    }

    #[test]
    fn deletion_closes_the_transcript() {
        let mut client = customer();
        client.open(Topic::Support, "c1").unwrap();
        assert_eq!(
            client.handle_event(ServerEvent::ConversationDeleted(ConversationDeleted {
                channel_id: "support_c1".into()
            })),
            ClientUpdate::ChannelRemoved("support_c1".into())
        );
        assert!(client.transcript("support_c1").is_empty());
        assert!(client.on_reconnected().is_empty());
    }
}
