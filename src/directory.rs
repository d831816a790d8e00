use std::{collections::VecDeque, sync::Arc};

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::{
    channel::parse_channel_id,
    error::ChatResult,
    types::{ConversationSummary, CustomerDetails, Message, Side, TopicFilter},
};

const PREVIEW_CHARS: usize = 120;
const RECENT_IDS: usize = 64;

pub fn message_preview(message: &Message) -> String {
    let text = message.content.split_whitespace().collect::<Vec<_>>().join(" ");
    if text.is_empty() {
        return message
            .recommendation
            .as_ref()
            .map(|product| format!("Recommended: {}", product.name))
            .unwrap_or_default();
    }
    if text.chars().count() > PREVIEW_CHARS {
        let cut = text.chars().take(PREVIEW_CHARS).collect::<String>();
        format!("{}...", cut.trim_end())
    } else {
        text
    }
}

/// One channel's directory state. Holding its lock serializes every write
/// to that conversation, including persistence write-through and purge.
#[derive(Debug, Default)]
pub struct ConversationSlot {
    summary: Option<ConversationSummary>,
    recent_ids: VecDeque<String>,
    retired: bool,
}

pub type SlotGuard = OwnedMutexGuard<ConversationSlot>;

impl ConversationSlot {
    fn seeded(summary: ConversationSummary) -> Self {
        Self {
            summary: Some(summary),
            ..Self::default()
        }
    }

    pub fn summary(&self) -> Option<&ConversationSummary> {
        self.summary.as_ref()
    }

    /// Upserts the entry for `message`. Customer messages bump the
    /// operator-side unread count; operator messages do not touch it.
    /// A message id this slot already recorded is a retry and changes
    /// nothing: `None`.
    pub fn record(
        &mut self,
        message: &Message,
        customer: Option<&CustomerDetails>,
    ) -> ChatResult<Option<ConversationSummary>> {
        let (topic, customer_id) = parse_channel_id(&message.channel_id)?;
        if self.recent_ids.iter().any(|id| *id == message.id) {
            return Ok(None);
        }
        if self.recent_ids.len() == RECENT_IDS {
            self.recent_ids.pop_front();
        }
        self.recent_ids.push_back(message.id.clone());

        let summary = self.summary.get_or_insert_with(|| ConversationSummary {
            channel_id: message.channel_id.clone(),
            topic,
            customer: CustomerDetails {
                customer_id: customer_id.clone(),
                ..CustomerDetails::default()
            },
            last_message_preview: String::new(),
            last_message_at: None,
            unread_count: 0,
        });
        if let Some(details) = customer.filter(|d| d.customer_id == customer_id) {
            merge_details(&mut summary.customer, details);
        }
        summary.last_message_preview = message_preview(message);
        summary.last_message_at = Some(
            summary
                .last_message_at
                .map_or(message.created_at, |at| at.max(message.created_at)),
        );
        if message.sender_role.side() == Side::Customer {
            summary.unread_count = summary.unread_count.saturating_add(1);
        }
        Ok(Some(summary.clone()))
    }
}

/// Operator-facing aggregate of every channel that has seen a message.
/// Entries are locked one at a time; there is no directory-wide lock.
#[derive(Default)]
pub struct ConversationDirectory {
    entries: DashMap<String, Arc<Mutex<ConversationSlot>>>,
}

impl ConversationDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads previously persisted entries, replacing anything in memory.
    pub fn seed(&self, conversations: Vec<ConversationSummary>) {
        for conversation in conversations {
            self.entries.insert(
                conversation.channel_id.clone(),
                Arc::new(Mutex::new(ConversationSlot::seeded(conversation))),
            );
        }
    }

    /// Locks the slot of `channel_id`, creating an empty one if needed. A
    /// slot retired while we waited is skipped for its replacement.
    pub async fn lock(&self, channel_id: &str) -> SlotGuard {
        loop {
            let slot = self
                .entries
                .entry(channel_id.to_string())
                .or_default()
                .clone();
            let guard = slot.lock_owned().await;
            if !guard.retired {
                return guard;
            }
        }
    }

    /// Locks an existing, live entry. `None` if the channel has none.
    pub async fn lock_existing(&self, channel_id: &str) -> Option<SlotGuard> {
        let slot = self.entries.get(channel_id).map(|entry| entry.clone())?;
        let guard = slot.lock_owned().await;
        (!guard.retired && guard.summary.is_some()).then_some(guard)
    }

    /// Drops the slot for good. Writers queued on it will find it retired.
    pub fn retire(&self, slot: &mut ConversationSlot, channel_id: &str) -> bool {
        slot.retired = true;
        let existed = slot.summary.take().is_some();
        slot.recent_ids.clear();
        self.entries.remove(channel_id);
        existed
    }

    pub async fn record(
        &self,
        message: &Message,
        customer: Option<&CustomerDetails>,
    ) -> ChatResult<Option<ConversationSummary>> {
        let mut slot = self.lock(&message.channel_id).await;
        slot.record(message, customer)
    }

    /// Refreshes the customer snapshot of an existing entry. Does not create.
    pub async fn touch_customer(
        &self,
        channel_id: &str,
        details: &CustomerDetails,
    ) -> Option<ConversationSummary> {
        let mut slot = self.lock_existing(channel_id).await?;
        let summary = slot.summary.as_mut()?;
        if summary.customer.customer_id != details.customer_id {
            return None;
        }
        let before = summary.customer.clone();
        merge_details(&mut summary.customer, details);
        (summary.customer != before).then(|| summary.clone())
    }

    /// Zeroes the operator-side unread count. `None` if the channel has no
    /// entry yet.
    pub async fn clear_unread(&self, channel_id: &str) -> Option<ConversationSummary> {
        let mut slot = self.lock_existing(channel_id).await?;
        let summary = slot.summary.as_mut()?;
        summary.unread_count = 0;
        Some(summary.clone())
    }

    pub async fn get(&self, channel_id: &str) -> Option<ConversationSummary> {
        let slot = self.lock_existing(channel_id).await?;
        slot.summary.clone()
    }

    /// Read-side projection; newest activity first.
    pub async fn list(&self, filter: TopicFilter) -> Vec<ConversationSummary> {
        let entries = self
            .entries
            .iter()
            .map(|entry| entry.value().clone())
            .collect::<Vec<_>>();

        let mut list = Vec::with_capacity(entries.len());
        for entry in entries {
            let slot = entry.lock().await;
            if let Some(summary) = slot.summary.as_ref().filter(|s| filter.includes(s.topic)) {
                list.push(summary.clone());
            }
        }
        list.sort_by(|a, b| {
            b.last_message_at
                .cmp(&a.last_message_at)
                .then_with(|| a.channel_id.cmp(&b.channel_id))
        });
        list
    }

    pub async fn remove(&self, channel_id: &str) -> bool {
        match self.lock_existing(channel_id).await {
            Some(mut slot) => self.retire(&mut slot, channel_id),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn merge_details(current: &mut CustomerDetails, incoming: &CustomerDetails) {
    if !incoming.name.trim().is_empty() {
        current.name = incoming.name.trim().to_string();
    }
    if !incoming.email.trim().is_empty() {
        current.email = incoming.email.trim().to_ascii_lowercase();
    }
}
