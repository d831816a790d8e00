use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    auth::Identity,
    channel::{authorize_channel, channel_id, topic_of},
    error::{ChatError, ChatResult},
    types::{Role, ServerEvent, Topic},
};

pub type ConnectionId = u64;

/// Outcome of handing one event to one connection's outbound queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// Queue was full; the connection has been told to close.
    Overflowed,
    /// Receiver already gone.
    Closed,
}

/// The router's view of one live connection. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    identity: Identity,
    outbound: mpsc::Sender<Arc<ServerEvent>>,
    closed: CancellationToken,
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn role(&self) -> Role {
        self.identity.role
    }

    /// Fired when the connection must go away (overflow or shutdown).
    pub fn closed(&self) -> &CancellationToken {
        &self.closed
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Non-blocking enqueue. Never waits on a slow reader.
    pub fn deliver(&self, event: Arc<ServerEvent>) -> Delivery {
        if self.closed.is_cancelled() {
            return Delivery::Closed;
        }
        match self.outbound.try_send(event) {
            Ok(()) => Delivery::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(connection = self.id, "outbound queue full, disconnecting");
                self.closed.cancel();
                Delivery::Overflowed
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.closed.cancel();
                Delivery::Closed
            }
        }
    }

    pub fn send(&self, event: ServerEvent) -> Delivery {
        self.deliver(Arc::new(event))
    }
}

#[derive(Default)]
struct Room {
    subscribers: HashMap<ConnectionId, ConnectionHandle>,
}

/// Channel to subscriber-set mapping. Each channel has its own lock so
/// traffic on one conversation never waits on another.
pub struct RoomRouter {
    rooms: DashMap<String, Arc<Mutex<Room>>>,
    memberships: DashMap<ConnectionId, HashSet<String>>,
    next_connection_id: AtomicU64,
    queue_capacity: usize,
}

impl RoomRouter {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            rooms: DashMap::new(),
            memberships: DashMap::new(),
            next_connection_id: AtomicU64::new(0),
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Registers a connection and hands back its outbound queue.
    pub fn connect(&self, identity: Identity) -> (ConnectionHandle, mpsc::Receiver<Arc<ServerEvent>>) {
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let handle = ConnectionHandle {
            id,
            identity,
            outbound: tx,
            closed: CancellationToken::new(),
        };
        self.memberships.insert(id, HashSet::new());
        debug!(connection = id, role = %handle.role(), "connection registered");
        (handle, rx)
    }

    fn room(&self, channel_id: &str) -> Arc<Mutex<Room>> {
        self.rooms
            .entry(channel_id.to_string())
            .or_default()
            .clone()
    }

    fn existing_room(&self, channel_id: &str) -> Option<Arc<Mutex<Room>>> {
        self.rooms.get(channel_id).map(|room| room.clone())
    }

    /// Joins `conn` to the channel for `(topic, customer_id)`. Unauthorized
    /// callers are rejected without touching any subscriber set.
    pub async fn subscribe(
        &self,
        conn: &ConnectionHandle,
        topic: Topic,
        customer_id: &str,
    ) -> ChatResult<String> {
        let channel = channel_id(topic, customer_id)?;
        if let Err(err) = authorize_channel(&conn.identity, topic, customer_id) {
            warn!(
                connection = conn.id,
                role = %conn.role(),
                channel = %channel,
                "subscribe rejected"
            );
            return Err(err);
        }
        if conn.is_closed() || !self.memberships.contains_key(&conn.id) {
            return Err(ChatError::Transport("connection is closed".into()));
        }

        let room = self.room(&channel);
        {
            let mut room = room.lock().await;
            room.subscribers.insert(conn.id, conn.clone());
        }
        match self.memberships.get_mut(&conn.id) {
            Some(mut set) => {
                set.insert(channel.clone());
            }
            None => {
                // Lost a race with unsubscribe; undo.
                room.lock().await.subscribers.remove(&conn.id);
                return Err(ChatError::Transport("connection is closed".into()));
            }
        }
        debug!(connection = conn.id, channel = %channel, "subscribed");
        Ok(channel)
    }

    /// Fans `event` out to every current subscriber of `channel_id`, in
    /// subscription-independent order. Returns how many queues took it.
    /// Publishing to an empty channel is not an error.
    pub async fn publish(&self, channel_id: &str, event: ServerEvent) -> usize {
        let Some(room) = self.existing_room(channel_id) else {
            return 0;
        };
        let event = Arc::new(event);
        let mut delivered = 0;
        let mut dropped = Vec::new();
        {
            // Held across the whole fan-out so publishes on one channel are
            // totally ordered for every subscriber.
            let room = room.lock().await;
            for (id, conn) in &room.subscribers {
                match conn.deliver(event.clone()) {
                    Delivery::Queued => delivered += 1,
                    Delivery::Overflowed | Delivery::Closed => dropped.push(*id),
                }
            }
        }
        drop(room);
        for id in dropped {
            self.unsubscribe(id).await;
        }
        delivered
    }

    /// Removes `conn_id` from one channel. No-op if not subscribed.
    pub async fn leave(&self, conn_id: ConnectionId, channel_id: &str) {
        if let Some(mut set) = self.memberships.get_mut(&conn_id) {
            set.remove(channel_id);
        }
        if let Some(room) = self.existing_room(channel_id) {
            room.lock().await.subscribers.remove(&conn_id);
        }
        self.prune(channel_id);
    }

    /// Drops every subscription of `conn_id`. Idempotent.
    pub async fn unsubscribe(&self, conn_id: ConnectionId) {
        let Some((_, channels)) = self.memberships.remove(&conn_id) else {
            return;
        };
        for channel in &channels {
            if let Some(room) = self.existing_room(channel) {
                room.lock().await.subscribers.remove(&conn_id);
            }
            self.prune(channel);
        }
        debug!(connection = conn_id, channels = channels.len(), "unsubscribed");
    }

    /// Forgets a room nobody holds or listens to.
    fn prune(&self, channel_id: &str) {
        self.rooms.remove_if(channel_id, |_, room| {
            Arc::strong_count(room) == 1
                && room
                    .try_lock()
                    .map(|room| room.subscribers.is_empty())
                    .unwrap_or(false)
        });
    }

    pub async fn subscriber_ids(&self, channel_id: &str) -> Vec<ConnectionId> {
        let Some(room) = self.existing_room(channel_id) else {
            return Vec::new();
        };
        let room = room.lock().await;
        let mut ids = room.subscribers.keys().copied().collect::<Vec<_>>();
        ids.sort_unstable();
        ids
    }

    pub fn channels_of(&self, conn_id: ConnectionId) -> Vec<String> {
        let mut channels = self
            .memberships
            .get(&conn_id)
            .map(|set| set.iter().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        channels.sort();
        channels
    }

    pub fn is_connected(&self, conn_id: ConnectionId) -> bool {
        self.memberships.contains_key(&conn_id)
    }

    /// Every distinct connection of `role` subscribed to any channel of `topic`.
    pub async fn connections_on_topic(&self, topic: Topic, role: Role) -> Vec<ConnectionHandle> {
        let rooms = self
            .rooms
            .iter()
            .filter(|entry| topic_of(entry.key()) == Some(topic))
            .map(|entry| entry.value().clone())
            .collect::<Vec<_>>();

        let mut seen = HashSet::new();
        let mut found = Vec::new();
        for room in rooms {
            let room = room.lock().await;
            for conn in room.subscribers.values() {
                if conn.role() == role && seen.insert(conn.id) {
                    found.push(conn.clone());
                }
            }
        }
        found
    }

    pub fn channel_count(&self) -> usize {
        self.rooms.len()
    }
}
