//! Local view of conversations and loaded message pages, kept current by merging
//! realtime events in server order.

use std::collections::{HashMap, HashSet};

use shared::{
    domain::{ConversationId, MessageId, UserId},
    protocol::{
        ConversationChange, ConversationSummary, MessagePayload, MessagePreview, ServerEvent,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheUpdate {
    /// The event was merged into cached state.
    Applied,
    /// Cached state can no longer be patched; reload from the server.
    NeedsRefetch,
    /// Nothing cached is affected, or the event was already seen.
    Ignored,
}

#[derive(Debug, Clone)]
pub struct ConversationCache {
    me: UserId,
    summaries: HashMap<ConversationId, ConversationSummary>,
    /// Loaded messages per conversation, ascending by `order_key`.
    messages: HashMap<ConversationId, Vec<MessagePayload>>,
}

impl ConversationCache {
    pub fn new(me: UserId) -> Self {
        Self {
            me,
            summaries: HashMap::new(),
            messages: HashMap::new(),
        }
    }

    pub fn replace_conversations(&mut self, conversations: Vec<ConversationSummary>) {
        self.summaries = conversations
            .into_iter()
            .map(|summary| (summary.conversation_id, summary))
            .collect();
        self.messages
            .retain(|conversation_id, _| self.summaries.contains_key(conversation_id));
    }

    /// Pinned conversations first, then most recent activity.
    pub fn conversations(&self) -> Vec<ConversationSummary> {
        let mut list: Vec<_> = self.summaries.values().cloned().collect();
        list.sort_by(|a, b| {
            b.pinned
                .cmp(&a.pinned)
                .then(b.last_activity_at.cmp(&a.last_activity_at))
                .then(b.conversation_id.cmp(&a.conversation_id))
        });
        list
    }

    pub fn conversation(&self, conversation_id: ConversationId) -> Option<&ConversationSummary> {
        self.summaries.get(&conversation_id)
    }

    /// Replaces the loaded page for a conversation with the newest page from the server.
    pub fn replace_messages(&mut self, conversation_id: ConversationId, mut page: Vec<MessagePayload>) {
        page.sort_by_key(MessagePayload::order_key);
        self.messages.insert(conversation_id, page);
    }

    pub fn messages(&self, conversation_id: ConversationId) -> Option<&[MessagePayload]> {
        self.messages.get(&conversation_id).map(Vec::as_slice)
    }

    pub fn remove_conversation(&mut self, conversation_id: ConversationId) {
        self.summaries.remove(&conversation_id);
        self.messages.remove(&conversation_id);
    }

    pub fn forget_messages(&mut self, conversation_id: ConversationId) {
        self.messages.remove(&conversation_id);
    }

    pub fn clear_messages(&mut self) {
        self.messages.clear();
    }

    pub fn set_unread(&mut self, conversation_id: ConversationId, unread: u64) {
        if let Some(summary) = self.summaries.get_mut(&conversation_id) {
            summary.unread_count = unread;
        }
    }

    pub fn total_unread(&self) -> u64 {
        self.summaries.values().map(|s| s.unread_count).sum()
    }

    pub fn apply(&mut self, event: &ServerEvent) -> CacheUpdate {
        match event {
            ServerEvent::MessageCreated { message } => self.apply_message(message),
            ServerEvent::MessagesRead {
                conversation_id,
                reader_id,
                message_ids,
                ..
            } => self.apply_read(*conversation_id, *reader_id, message_ids),
            ServerEvent::ConversationUpdated {
                conversation_id,
                change,
            } => match (change, self.summaries.get_mut(conversation_id)) {
                (ConversationChange::Pinned | ConversationChange::Unpinned, Some(summary)) => {
                    summary.pinned = *change == ConversationChange::Pinned;
                    CacheUpdate::Applied
                }
                // Membership changed or the conversation is new to us.
                _ => CacheUpdate::NeedsRefetch,
            },
            ServerEvent::ResyncRequired => CacheUpdate::NeedsRefetch,
        }
    }

    fn apply_message(&mut self, message: &MessagePayload) -> CacheUpdate {
        let Some(summary) = self.summaries.get_mut(&message.conversation_id) else {
            return CacheUpdate::NeedsRefetch;
        };

        // The preview is the newest message the summary already accounts for.
        let preview_key = summary
            .last_message
            .as_ref()
            .map(|preview| (preview.sent_at, preview.message_id));
        let is_preview = preview_key.is_some_and(|(_, id)| id == message.message_id);
        let seen = preview_key.is_some_and(|key| key >= message.order_key());
        if !seen {
            summary.last_message = Some(MessagePreview {
                message_id: message.message_id,
                sender_id: message.sender_id,
                content: message.content.clone(),
                sent_at: message.sent_at,
            });
            summary.last_activity_at = summary.last_activity_at.max(message.sent_at);
            if message.sender_id != self.me && !message.is_read {
                summary.unread_count += 1;
            }
        }

        let Some(page) = self.messages.get_mut(&message.conversation_id) else {
            // An older message arriving after a newer one was never counted.
            return match (seen, is_preview) {
                (false, _) => CacheUpdate::Applied,
                (true, true) => CacheUpdate::Ignored,
                (true, false) => CacheUpdate::NeedsRefetch,
            };
        };
        if page.iter().any(|m| m.message_id == message.message_id) {
            return CacheUpdate::Ignored;
        }
        match page.last() {
            _ if seen => CacheUpdate::NeedsRefetch,
            Some(tail) if tail.order_key() > message.order_key() => CacheUpdate::NeedsRefetch,
            _ => {
                page.push(message.clone());
                CacheUpdate::Applied
            }
        }
    }

    fn apply_read(
        &mut self,
        conversation_id: ConversationId,
        reader_id: UserId,
        message_ids: &[MessageId],
    ) -> CacheUpdate {
        if !self.summaries.contains_key(&conversation_id) {
            return CacheUpdate::NeedsRefetch;
        }
        let ids: HashSet<MessageId> = message_ids.iter().copied().collect();

        let newly_read_for_me = if reader_id == self.me {
            // Every id in a receipt of ours was an unread message from someone else.
            self.mark_flags(conversation_id, &ids);
            ids.len() as u64
        } else {
            // The read flag is shared, so another reader can clear our unread too. That is
            // only countable when every id is in the loaded page.
            let Some(page) = self.messages.get(&conversation_id) else {
                return CacheUpdate::NeedsRefetch;
            };
            let loaded = page.iter().filter(|m| ids.contains(&m.message_id)).count();
            if loaded < ids.len() {
                return CacheUpdate::NeedsRefetch;
            }
            let cleared = page
                .iter()
                .filter(|m| ids.contains(&m.message_id) && m.sender_id != self.me && !m.is_read)
                .count() as u64;
            self.mark_flags(conversation_id, &ids);
            cleared
        };

        if let Some(summary) = self.summaries.get_mut(&conversation_id) {
            summary.unread_count = summary.unread_count.saturating_sub(newly_read_for_me);
        }
        CacheUpdate::Applied
    }

    fn mark_flags(&mut self, conversation_id: ConversationId, ids: &HashSet<MessageId>) {
        if let Some(page) = self.messages.get_mut(&conversation_id) {
            for message in page.iter_mut().filter(|m| ids.contains(&m.message_id)) {
                message.is_read = true;
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/cache_tests.rs"]
mod tests;
