//! The chat service object. One per process, shared with every handler.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    auth::{Identity, IdentityResolver},
    channel::{
        authorize_channel, authorize_filter, authorize_operator, channel_id, default_filter,
        parse_channel_id,
    },
    directory::ConversationDirectory,
    error::{ChatError, ChatResult},
    presence::PresenceTracker,
    read_receipts::ReadReceipts,
    recommendation::RecommendationPipeline,
    router::{ConnectionHandle, ConnectionId, Delivery, RoomRouter},
    store::MessageStore,
    types::{
        ChannelJoined, ConversationDeleted, ConversationSummary, Message, PresenceStatus,
        PresenceUpdate, PublishBody, Role, ServerEvent, Topic, TopicFilter,
    },
};

const MAX_CONTENT_CHARS: usize = 4_000;
const MAX_CLIENT_ID_CHARS: usize = 128;

#[derive(Debug, Clone, Copy)]
pub struct HubOptions {
    pub queue_capacity: usize,
    pub history_limit: usize,
    pub presence_auto_offline: bool,
}

impl Default for HubOptions {
    fn default() -> Self {
        Self {
            queue_capacity: crate::config::DEFAULT_QUEUE_CAPACITY,
            history_limit: crate::config::DEFAULT_HISTORY_LIMIT,
            presence_auto_offline: false,
        }
    }
}

/// Result of a publish. The message is live once this exists; `warning`
/// carries a persistence failure that did not undo the fan-out.
#[derive(Debug, Clone)]
pub struct Published {
    pub message: Message,
    pub delivered: usize,
    pub warning: Option<ChatError>,
}

struct Dashboard {
    conn: ConnectionHandle,
    filter: TopicFilter,
}

pub struct ChatHub {
    router: RoomRouter,
    directory: Arc<ConversationDirectory>,
    receipts: ReadReceipts,
    presence: PresenceTracker,
    recommendations: RecommendationPipeline,
    store: Arc<dyn MessageStore>,
    identities: Arc<dyn IdentityResolver>,
    live: DashMap<ConnectionId, Role>,
    dashboards: DashMap<ConnectionId, Dashboard>,
    history_limit: usize,
}

impl ChatHub {
    pub fn new(
        store: Arc<dyn MessageStore>,
        identities: Arc<dyn IdentityResolver>,
        recommendations: RecommendationPipeline,
        options: HubOptions,
    ) -> Self {
        let directory = Arc::new(ConversationDirectory::new());
        Self {
            router: RoomRouter::new(options.queue_capacity),
            receipts: ReadReceipts::new(directory.clone()),
            directory,
            presence: PresenceTracker::new(options.presence_auto_offline),
            recommendations,
            store,
            identities,
            live: DashMap::new(),
            dashboards: DashMap::new(),
            history_limit: options.history_limit.max(1),
        }
    }

    pub fn router(&self) -> &RoomRouter {
        &self.router
    }

    pub fn directory(&self) -> &ConversationDirectory {
        &self.directory
    }

    /// Seeds the directory cache from persistence.
    pub async fn load_directory(&self) -> ChatResult<usize> {
        let conversations = self.store.load_conversations().await?;
        let count = conversations.len();
        self.directory.seed(conversations);
        info!(conversations = count, "conversation directory loaded");
        Ok(count)
    }

    pub async fn authenticate(&self, token: &str) -> ChatResult<Identity> {
        let token = token.trim();
        if token.is_empty() {
            return Err(ChatError::Unauthenticated);
        }
        self.identities
            .resolve(token)
            .await?
            .ok_or(ChatError::Unauthenticated)
    }

    pub fn connect(
        &self,
        identity: Identity,
    ) -> (ConnectionHandle, mpsc::Receiver<Arc<ServerEvent>>) {
        let role = identity.role;
        let (conn, rx) = self.router.connect(identity);
        self.live.insert(conn.id(), role);
        if role == Role::Consultant {
            self.presence.consultant_connected();
        }
        info!(connection = conn.id(), user = %conn.identity().user_id, %role, "connected");
        (conn, rx)
    }

    /// Tears down every subscription of `conn`. Safe to call more than once.
    pub async fn disconnect(&self, conn: &ConnectionHandle) {
        conn.closed().cancel();
        self.router.unsubscribe(conn.id()).await;
        self.dashboards.remove(&conn.id());
        let Some((_, role)) = self.live.remove(&conn.id()) else {
            return;
        };
        info!(connection = conn.id(), %role, "disconnected");
        if role == Role::Consultant {
            if let Some(status) = self.presence.consultant_disconnected().await {
                self.broadcast_presence(status).await;
            }
        }
    }

    /// Joins a channel. The connection gets `channel:joined`, plus the current
    /// presence when a customer opens a consultation. Operators opening a
    /// channel mark it read.
    pub async fn subscribe(
        &self,
        conn: &ConnectionHandle,
        topic: Topic,
        customer_id: &str,
    ) -> ChatResult<String> {
        let channel = self.router.subscribe(conn, topic, customer_id).await?;
        let identity = conn.identity();
        conn.send(ServerEvent::ChannelJoined(ChannelJoined {
            channel_id: channel.clone(),
            topic,
            customer_id: customer_id.trim().to_string(),
        }));

        if identity.role == Role::Customer {
            if topic == Topic::Consultant {
                conn.send(ServerEvent::PresenceStatus(PresenceUpdate {
                    status: self.presence.status().await,
                }));
            }
            if self
                .directory
                .touch_customer(&channel, &identity.customer_details())
                .await
                .is_some()
            {
                self.write_back(&channel).await;
            }
        } else if self.receipts.mark_read(&channel, true).await.is_some() {
            self.write_back(&channel).await;
        }
        Ok(channel)
    }

    pub async fn leave(&self, conn: &ConnectionHandle, topic: Topic, customer_id: &str) -> ChatResult<()> {
        let channel = channel_id(topic, customer_id)?;
        self.router.leave(conn.id(), &channel).await;
        Ok(())
    }

    pub async fn fetch_history(
        &self,
        identity: &Identity,
        topic: Topic,
        customer_id: &str,
        limit: Option<usize>,
    ) -> ChatResult<Vec<Message>> {
        let channel = channel_id(topic, customer_id)?;
        authorize_channel(identity, topic, customer_id)?;
        let limit = limit
            .map(|n| n.clamp(1, self.history_limit))
            .unwrap_or(self.history_limit);
        self.store.fetch_history(&channel, limit).await
    }

    pub async fn publish(
        &self,
        identity: &Identity,
        topic: Topic,
        customer_id: &str,
        body: PublishBody,
    ) -> ChatResult<Published> {
        let channel = channel_id(topic, customer_id)?;
        authorize_channel(identity, topic, customer_id)?;

        self.presence.ensure_can_compose(identity.role, topic).await?;
        let recommendation = self
            .recommendations
            .prepare(identity, topic, body.recommendation.as_ref())
            .await?;
        let content = body.content.trim().to_string();
        if content.is_empty() && recommendation.is_none() {
            return Err(ChatError::validation("message content is empty"));
        }
        if content.chars().count() > MAX_CONTENT_CHARS {
            return Err(ChatError::validation("message content is too long"));
        }
        let id = match body.id.map(|id| id.trim().to_string()).filter(|id| !id.is_empty()) {
            Some(id) if id.chars().count() > MAX_CLIENT_ID_CHARS => {
                return Err(ChatError::validation("message id is too long"));
            }
            Some(id) => id,
            None => Uuid::new_v4().to_string(),
        };

        let message = Message {
            id,
            channel_id: channel.clone(),
            sender_role: identity.role.sender_role_on(topic),
            sender_id: identity.user_id.clone(),
            content,
            created_at: body.created_at.unwrap_or_else(Utc::now),
            recommendation,
        };

        let delivered = self
            .router
            .publish(&channel, ServerEvent::MessageNew(message.clone()))
            .await;
        debug!(channel = %channel, message = %message.id, delivered, "published");

        // The slot stays locked until the message and its entry are written,
        // so a concurrent delete purges either before or after both.
        let mut slot = self.directory.lock(&channel).await;
        let customer = (identity.role == Role::Customer).then(|| identity.customer_details());
        let recorded = slot.record(&message, customer.as_ref())?;
        let warning = match self.store.append_message(&message).await {
            Ok(()) => None,
            Err(err) => {
                warn!(channel = %channel, message = %message.id, error = %err, "message not persisted");
                Some(err)
            }
        };
        match recorded {
            Some(summary) => self.conversation_changed(summary).await,
            None => debug!(channel = %channel, message = %message.id, "retried message id"),
        }
        drop(slot);

        Ok(Published {
            message,
            delivered,
            warning,
        })
    }

    /// Operators reset the operator-side unread count; customers are a
    /// no-op since their side is not tracked.
    pub async fn mark_read(
        &self,
        identity: &Identity,
        topic: Topic,
        customer_id: &str,
    ) -> ChatResult<Option<ConversationSummary>> {
        let channel = channel_id(topic, customer_id)?;
        authorize_channel(identity, topic, customer_id)?;
        let updated = self
            .receipts
            .mark_read(&channel, identity.role.is_operator())
            .await;
        if updated.is_some() {
            self.write_back(&channel).await;
        }
        Ok(updated)
    }

    pub async fn presence(&self) -> PresenceStatus {
        self.presence.status().await
    }

    pub async fn set_presence(
        &self,
        identity: &Identity,
        status: PresenceStatus,
    ) -> ChatResult<PresenceStatus> {
        if self.presence.set(identity, status).await? {
            self.broadcast_presence(status).await;
        }
        Ok(status)
    }

    /// Pushes `status` to every customer on a consultation channel and to
    /// dashboards that can see consultations.
    async fn broadcast_presence(&self, status: PresenceStatus) {
        let event = Arc::new(ServerEvent::PresenceStatus(PresenceUpdate { status }));
        let customers = self
            .router
            .connections_on_topic(Topic::Consultant, Role::Customer)
            .await;
        for conn in &customers {
            conn.deliver(event.clone());
        }
        let dashboards = self.notify_dashboards(Topic::Consultant, event);
        debug!(?status, customers = customers.len(), dashboards, "presence broadcast");
    }

    pub async fn list_conversations(
        &self,
        identity: &Identity,
        filter: Option<TopicFilter>,
    ) -> ChatResult<Vec<ConversationSummary>> {
        let filter = filter
            .or_else(|| default_filter(identity.role))
            .ok_or_else(|| ChatError::authorization("customers have no conversation directory"))?;
        authorize_filter(identity, filter)?;
        Ok(self.directory.list(filter).await)
    }

    /// Registers `conn` as an operator dashboard. It gets the current list
    /// now and `conversation:*` events afterwards.
    pub async fn watch_directory(
        &self,
        conn: &ConnectionHandle,
        filter: Option<TopicFilter>,
    ) -> ChatResult<usize> {
        let identity = conn.identity();
        let filter = filter
            .or_else(|| default_filter(identity.role))
            .ok_or_else(|| ChatError::authorization("customers have no conversation directory"))?;
        authorize_filter(identity, filter)?;
        let list = self.directory.list(filter).await;
        let count = list.len();
        self.dashboards.insert(
            conn.id(),
            Dashboard {
                conn: conn.clone(),
                filter,
            },
        );
        conn.send(ServerEvent::ConversationsList(list));
        Ok(count)
    }

    /// Purges the channel from persistence first; the directory entry only
    /// goes once that succeeded. The slot is held throughout, so no publish
    /// or write-back on this channel can land between purge and removal.
    pub async fn delete_conversation(&self, identity: &Identity, channel_id: &str) -> ChatResult<()> {
        let (topic, _) = parse_channel_id(channel_id)?;
        authorize_operator(identity, topic)?;

        let mut slot = self.directory.lock(channel_id).await;
        let removed = match self.store.delete_conversation(channel_id).await {
            Ok(removed) => removed,
            Err(err) => {
                if slot.summary().is_none() {
                    self.directory.retire(&mut slot, channel_id);
                }
                return Err(err);
            }
        };
        self.directory.retire(&mut slot, channel_id);
        drop(slot);
        info!(
            channel = %channel_id,
            user = %identity.user_id,
            messages = removed,
            "conversation deleted"
        );

        let deleted = ConversationDeleted {
            channel_id: channel_id.to_string(),
        };
        self.router
            .publish(channel_id, ServerEvent::ConversationDeleted(deleted.clone()))
            .await;
        self.notify_dashboards(topic, Arc::new(ServerEvent::ConversationDeleted(deleted)));
        Ok(())
    }

    /// Re-reads the entry under its lock and writes it through. Nothing is
    /// written once the conversation has been deleted.
    async fn write_back(&self, channel_id: &str) {
        let Some(slot) = self.directory.lock_existing(channel_id).await else {
            return;
        };
        if let Some(summary) = slot.summary().cloned() {
            self.conversation_changed(summary).await;
        }
    }

    /// Writes the entry through to persistence and tells dashboards. Callers
    /// hold the entry's slot.
    async fn conversation_changed(&self, summary: ConversationSummary) {
        if let Err(err) = self.store.save_conversation(&summary).await {
            warn!(channel = %summary.channel_id, error = %err, "conversation not persisted");
        }
        let topic = summary.topic;
        self.notify_dashboards(topic, Arc::new(ServerEvent::ConversationUpdated(summary)));
    }

    fn notify_dashboards(&self, topic: Topic, event: Arc<ServerEvent>) -> usize {
        let targets = self
            .dashboards
            .iter()
            .filter(|entry| entry.filter.includes(topic))
            .map(|entry| entry.conn.clone())
            .collect::<Vec<_>>();

        let mut delivered = 0;
        for conn in targets {
            match conn.deliver(event.clone()) {
                Delivery::Queued => delivered += 1,
                Delivery::Overflowed | Delivery::Closed => {
                    self.dashboards.remove(&conn.id());
                }
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{auth::StaticIdentityResolver, store::MemoryMessageStore};

    fn hub_with(store: Arc<MemoryMessageStore>) -> ChatHub {
        let identities = StaticIdentityResolver::new()
            .with("tok-c1", Identity::new("c1", Role::Customer))
            .with("tok-op", Identity::new("op", Role::Support));
        ChatHub::new(
            store,
            Arc::new(identities),
            RecommendationPipeline::new(None),
            HubOptions::default(),
        )
    }

    fn text(content: &str) -> PublishBody {
        PublishBody {
            content: content.to_string(),
            ..PublishBody::default()
        }
    }

    #[tokio::test]
    async fn authenticate_maps_unknown_tokens_to_unauthenticated() {
        let hub = hub_with(Arc::new(MemoryMessageStore::new()));
        assert_eq!(hub.authenticate("tok-op").await.unwrap().role, Role::Support);
        assert!(matches!(
            hub.authenticate("nope").await,
            Err(ChatError::Unauthenticated)
        ));
        assert!(matches!(
            hub.authenticate("  ").await,
            Err(ChatError::Unauthenticated)
        ));
    }

    #[tokio::test]
    async fn empty_message_is_rejected_without_side_effects() {
        let store = Arc::new(MemoryMessageStore::new());
        let hub = hub_with(store.clone());
        let customer = Identity::new("c1", Role::Customer);
        let err = hub
            .publish(&customer, Topic::Support, "c1", text("   "))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Validation(_)));
        assert!(hub.directory().is_empty());
        assert_eq!(store.message_count("support_c1").await, 0);
    }

    #[tokio::test]
    async fn client_id_and_timestamp_are_kept() {
        let hub = hub_with(Arc::new(MemoryMessageStore::new()));
        let customer = Identity::new("c1", Role::Customer);
        let created_at = Utc::now() - chrono::Duration::seconds(1);
        let published = hub
            .publish(
                &customer,
                Topic::Support,
                "c1",
                PublishBody {
                    id: Some("local_abc".into()),
                    content: "Hi".into(),
                    created_at: Some(created_at),
                    recommendation: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(published.message.id, "local_abc");
        assert_eq!(published.message.created_at, created_at);
        assert_eq!(published.delivered, 0);
        assert!(published.warning.is_none());
    }

    #[tokio::test]
    async fn persistence_failure_is_only_a_warning() {
        let store = Arc::new(MemoryMessageStore::new());
        let hub = hub_with(store.clone());
        let (op, mut rx) = hub.connect(Identity::new("op", Role::Support));
        hub.subscribe(&op, Topic::Support, "c1").await.unwrap();
        while rx.try_recv().is_ok() {}

        store.set_fail_appends(true);
        let customer = Identity::new("c1", Role::Customer);
        let published = hub
            .publish(&customer, Topic::Support, "c1", text("Still there?"))
            .await
            .unwrap();
        assert!(matches!(published.warning, Some(ChatError::Persistence(_))));
        assert_eq!(published.delivered, 1);
        assert!(matches!(*rx.recv().await.unwrap(), ServerEvent::MessageNew(_)));
        assert_eq!(
            hub.directory().get("support_c1").await.unwrap().unread_count,
            1
        );
    }

    #[tokio::test]
    async fn disconnect_twice_is_harmless() {
        let hub = hub_with(Arc::new(MemoryMessageStore::new()));
        let (conn, _rx) = hub.connect(Identity::new("c1", Role::Customer));
        hub.subscribe(&conn, Topic::Support, "c1").await.unwrap();
        hub.disconnect(&conn).await;
        hub.disconnect(&conn).await;
        assert!(conn.is_closed());
        assert_eq!(hub.router().channel_count(), 0);
    }
}
