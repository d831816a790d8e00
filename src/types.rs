use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ChatError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Customer,
    Support,
    Consultant,
    Admin,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Customer => "customer",
            Role::Support => "support",
            Role::Consultant => "consultant",
            Role::Admin => "admin",
        }
    }

    pub fn is_operator(self) -> bool {
        !matches!(self, Role::Customer)
    }

    /// The `senderRole` a message from this role carries on `topic`.
    /// Admins speak as the operator of whichever topic they write into.
    pub fn sender_role_on(self, topic: Topic) -> SenderRole {
        match self {
            Role::Customer => SenderRole::Customer,
            Role::Support => SenderRole::Support,
            Role::Consultant => SenderRole::Consultant,
            Role::Admin => match topic {
                Topic::Support => SenderRole::Support,
                Topic::Consultant => SenderRole::Consultant,
            },
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ChatError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "customer" => Ok(Role::Customer),
            "support" => Ok(Role::Support),
            "consultant" => Ok(Role::Consultant),
            "admin" => Ok(Role::Admin),
            other => Err(ChatError::validation(format!("unknown role `{other}`"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Topic {
    Support,
    Consultant,
}

impl Topic {
    pub const ALL: [Topic; 2] = [Topic::Support, Topic::Consultant];

    pub fn as_str(self) -> &'static str {
        match self {
            Topic::Support => "support",
            Topic::Consultant => "consultant",
        }
    }

    pub fn channel_prefix(self) -> &'static str {
        match self {
            Topic::Support => "support_",
            Topic::Consultant => "consultant_",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Topic {
    type Err = ChatError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "support" => Ok(Topic::Support),
            "consultant" | "consultation" => Ok(Topic::Consultant),
            other => Err(ChatError::validation(format!("unknown topic `{other}`"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenderRole {
    Customer,
    Support,
    Consultant,
}

impl SenderRole {
    pub fn as_str(self) -> &'static str {
        match self {
            SenderRole::Customer => "customer",
            SenderRole::Support => "support",
            SenderRole::Consultant => "consultant",
        }
    }

    pub fn side(self) -> Side {
        match self {
            SenderRole::Customer => Side::Customer,
            SenderRole::Support | SenderRole::Consultant => Side::Operator,
        }
    }
}

impl FromStr for SenderRole {
    type Err = ChatError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "customer" => Ok(SenderRole::Customer),
            "support" => Ok(SenderRole::Support),
            "consultant" => Ok(SenderRole::Consultant),
            other => Err(ChatError::validation(format!("unknown sender role `{other}`"))),
        }
    }
}

/// Which side of a conversation a message came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Customer,
    Operator,
}

/// Denormalized product copy captured at send time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductSnapshot {
    pub product_id: String,
    pub name: String,
    pub price: f64,
    #[serde(default)]
    pub image_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub channel_id: String,
    pub sender_role: SenderRole,
    #[serde(default)]
    pub sender_id: String,
    #[serde(default)]
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<ProductSnapshot>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerDetails {
    pub customer_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub channel_id: String,
    pub topic: Topic,
    pub customer: CustomerDetails,
    pub last_message_preview: String,
    pub last_message_at: Option<DateTime<Utc>>,
    /// Operator-side unread count. Customer-side unread is not tracked.
    pub unread_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Busy,
    Offline,
}

impl PresenceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PresenceStatus::Online => "online",
            PresenceStatus::Busy => "busy",
            PresenceStatus::Offline => "offline",
        }
    }
}

impl FromStr for PresenceStatus {
    type Err = ChatError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "online" => Ok(PresenceStatus::Online),
            "busy" => Ok(PresenceStatus::Busy),
            "offline" => Ok(PresenceStatus::Offline),
            other => Err(ChatError::validation(format!("unknown presence `{other}`"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopicFilter {
    Support,
    Consultant,
    All,
}

impl TopicFilter {
    pub fn includes(self, topic: Topic) -> bool {
        match self {
            TopicFilter::All => true,
            TopicFilter::Support => topic == Topic::Support,
            TopicFilter::Consultant => topic == Topic::Consultant,
        }
    }
}

impl From<Topic> for TopicFilter {
    fn from(topic: Topic) -> Self {
        match topic {
            Topic::Support => TopicFilter::Support,
            Topic::Consultant => TopicFilter::Consultant,
        }
    }
}

impl FromStr for TopicFilter {
    type Err = ChatError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "all" => Ok(TopicFilter::All),
            other => other.parse::<Topic>().map(TopicFilter::from),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// Either a full snapshot, a raw catalog record, or `{ "productId": .. }`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelRef {
    pub topic: String,
    pub customer_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRequest {
    pub topic: String,
    pub customer_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageEvent {
    pub topic: String,
    pub customer_id: String,
    #[serde(flatten)]
    pub body: PublishBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusBody {
    pub status: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationsQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthRequest {
    pub token: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryQuery {
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct WsQuery {
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteConversationEvent {
    pub channel_id: String,
}

#[derive(Debug, Deserialize)]
pub struct EventEnvelopeIn {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

/// What clients send up a socket. The server reads these loosely through
/// [`EventEnvelopeIn`]; this typed form is what the client library emits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    #[serde(rename = "auth")]
    Auth(AuthRequest),
    #[serde(rename = "channel:join")]
    ChannelJoin(ChannelRef),
    #[serde(rename = "channel:leave")]
    ChannelLeave(ChannelRef),
    #[serde(rename = "channel:history")]
    ChannelHistory(HistoryRequest),
    #[serde(rename = "message:send")]
    MessageSend(SendMessageEvent),
    #[serde(rename = "channel:read")]
    ChannelRead(ChannelRef),
    #[serde(rename = "directory:join")]
    DirectoryJoin(ConversationsQuery),
    #[serde(rename = "presence:set")]
    PresenceSet(StatusBody),
    #[serde(rename = "conversation:delete")]
    ConversationDelete(DeleteConversationEvent),
    #[serde(rename = "ping")]
    Ping,
}

impl ClientEvent {
    pub fn to_json(&self) -> Option<String> {
        serde_json::to_string(self).ok()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthOk {
    pub user_id: String,
    pub role: Role,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelJoined {
    pub channel_id: String,
    pub topic: Topic,
    pub customer_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelHistory {
    pub channel_id: String,
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageAck {
    pub channel_id: String,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageWarning {
    pub channel_id: String,
    pub id: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceUpdate {
    pub status: PresenceStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationDeleted {
    pub channel_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

impl From<&ChatError> for ErrorPayload {
    fn from(err: &ChatError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

/// Everything the server pushes down a socket, in `{ event, data }` form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "auth:ok")]
    AuthOk(AuthOk),
    #[serde(rename = "channel:joined")]
    ChannelJoined(ChannelJoined),
    #[serde(rename = "channel:history")]
    ChannelHistory(ChannelHistory),
    #[serde(rename = "message:new")]
    MessageNew(Message),
    #[serde(rename = "message:ack")]
    MessageAck(MessageAck),
    #[serde(rename = "message:warning")]
    MessageWarning(MessageWarning),
    #[serde(rename = "presence:status")]
    PresenceStatus(PresenceUpdate),
    #[serde(rename = "conversations:list")]
    ConversationsList(Vec<ConversationSummary>),
    #[serde(rename = "conversation:updated")]
    ConversationUpdated(ConversationSummary),
    #[serde(rename = "conversation:deleted")]
    ConversationDeleted(ConversationDeleted),
    #[serde(rename = "error")]
    Error(ErrorPayload),
    #[serde(rename = "pong")]
    Pong,
}

impl ServerEvent {
    pub fn error(err: &ChatError) -> Self {
        ServerEvent::Error(ErrorPayload::from(err))
    }

    pub fn to_json(&self) -> Option<String> {
        serde_json::to_string(self).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn server_events_use_event_data_envelope() {
        let event = ServerEvent::PresenceStatus(PresenceUpdate {
            status: PresenceStatus::Busy,
        });
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({ "event": "presence:status", "data": { "status": "busy" } })
        );

        let pong = serde_json::to_value(&ServerEvent::Pong).unwrap();
        assert_eq!(pong["event"], "pong");
    }

    #[test]
    fn admin_speaks_as_topic_operator() {
        assert_eq!(
            Role::Admin.sender_role_on(Topic::Consultant),
            SenderRole::Consultant
        );
        assert_eq!(Role::Admin.sender_role_on(Topic::Support), SenderRole::Support);
        assert_eq!(Role::Customer.sender_role_on(Topic::Support).side(), Side::Customer);
        assert_eq!(Role::Support.sender_role_on(Topic::Support).side(), Side::Operator);
    }

    #[test]
    fn topic_filter_parses_all_and_topics() {
        assert_eq!("all".parse::<TopicFilter>().unwrap(), TopicFilter::All);
        assert_eq!(
            "consultant".parse::<TopicFilter>().unwrap(),
            TopicFilter::Consultant
        );
        assert!("billing".parse::<TopicFilter>().is_err());
        assert!(TopicFilter::All.includes(Topic::Support));
        assert!(!TopicFilter::Support.includes(Topic::Consultant));
    }

    #[test]
    fn client_events_read_back_as_loose_envelopes() {
        let event = ClientEvent::MessageSend(SendMessageEvent {
            topic: "support".into(),
            customer_id: "c1".into(),
            body: PublishBody {
                id: Some("local_1".into()),
                content: "Hello".into(),
                ..PublishBody::default()
            },
        });
        let text = event.to_json().unwrap();
        let envelope: EventEnvelopeIn = serde_json::from_str(&text).unwrap();
        assert_eq!(envelope.event, "message:send");
        assert_eq!(envelope.data["customerId"], "c1");
        assert_eq!(envelope.data["id"], "local_1");
        assert!(envelope.data.get("createdAt").is_none());

        let parsed: SendMessageEvent = serde_json::from_value(envelope.data).unwrap();
        assert_eq!(parsed.body.content, "Hello");

        let ping: EventEnvelopeIn =
            serde_json::from_str(&ClientEvent::Ping.to_json().unwrap()).unwrap();
        assert_eq!(ping.event, "ping");
        assert!(ping.data.is_null());
    }

    #[test]
    fn publish_body_accepts_camel_case_fields() {
        let body: PublishBody = serde_json::from_value(json!({
            "id": "local_1",
            "content": "Hello",
            "createdAt": "2026-01-01T10:00:00Z"
        }))
        .unwrap();
        assert_eq!(body.id.as_deref(), Some("local_1"));
        assert!(body.created_at.is_some());
        assert!(body.recommendation.is_none());
    }
}
