use std::sync::Arc;

use crate::{directory::ConversationDirectory, types::ConversationSummary};

/// Marks channels read on behalf of a viewing side.
///
/// Only the operator side is tracked. Customers always see the full
/// transcript on open, so a customer-side read is accepted and ignored.
pub struct ReadReceipts {
    directory: Arc<ConversationDirectory>,
}

impl ReadReceipts {
    pub fn new(directory: Arc<ConversationDirectory>) -> Self {
        Self { directory }
    }

    /// Returns the updated entry when the operator-side count was reset.
    /// Repeating the call is harmless.
    pub async fn mark_read(
        &self,
        channel_id: &str,
        viewer_is_operator: bool,
    ) -> Option<ConversationSummary> {
        if !viewer_is_operator {
            return None;
        }
        self.directory.clear_unread(channel_id).await
    }

    pub async fn unread_count(&self, channel_id: &str) -> u32 {
        self.directory
            .get(channel_id)
            .await
            .map(|summary| summary.unread_count)
            .unwrap_or(0)
    }
}
