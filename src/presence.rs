use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::RwLock;
use tracing::info;

use crate::{
    auth::Identity,
    error::{ChatError, ChatResult},
    types::{PresenceStatus, Role, Topic},
};

/// Availability of the consultant pool. Support has no presence.
pub struct PresenceTracker {
    status: RwLock<PresenceStatus>,
    consultant_connections: AtomicUsize,
    auto_offline: bool,
}

impl PresenceTracker {
    pub fn new(auto_offline: bool) -> Self {
        Self {
            status: RwLock::new(PresenceStatus::Offline),
            consultant_connections: AtomicUsize::new(0),
            auto_offline,
        }
    }

    pub async fn status(&self) -> PresenceStatus {
        *self.status.read().await
    }

    /// Explicit status change by a consultant (or an admin acting as one).
    /// Returns `true` when the status actually changed.
    pub async fn set(&self, identity: &Identity, status: PresenceStatus) -> ChatResult<bool> {
        if !matches!(identity.role, Role::Consultant | Role::Admin) {
            return Err(ChatError::authorization(
                "only consultants may change consultation presence",
            ));
        }
        let mut current = self.status.write().await;
        if *current == status {
            return Ok(false);
        }
        let previous = *current;
        info!(user = %identity.user_id, from = ?previous, to = ?status, "presence changed");
        *current = status;
        Ok(true)
    }

    /// A customer may not compose on the consultation topic while the pool
    /// is offline.
    pub async fn ensure_can_compose(&self, role: Role, topic: Topic) -> ChatResult<()> {
        if role == Role::Customer
            && topic == Topic::Consultant
            && self.status().await == PresenceStatus::Offline
        {
            return Err(ChatError::validation(
                "consultants are offline; try again later",
            ));
        }
        Ok(())
    }

    pub fn consultant_connected(&self) {
        self.consultant_connections.fetch_add(1, Ordering::SeqCst);
    }

    /// Returns the new status when the last consultant leaving flipped the
    /// pool offline. Only happens with auto-offline enabled.
    pub async fn consultant_disconnected(&self) -> Option<PresenceStatus> {
        let remaining = self
            .consultant_connections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
            .map(|previous| previous.saturating_sub(1))
            .unwrap_or(0);
        if !self.auto_offline || remaining > 0 {
            return None;
        }
        let mut current = self.status.write().await;
        if *current == PresenceStatus::Offline {
            return None;
        }
        info!("last consultant disconnected, presence now offline");
        *current = PresenceStatus::Offline;
        Some(PresenceStatus::Offline)
    }

    pub fn consultant_count(&self) -> usize {
        self.consultant_connections.load(Ordering::SeqCst)
    }
}
