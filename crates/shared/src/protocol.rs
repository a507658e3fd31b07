use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{AttachmentId, ConversationId, MessageId, UserId, UserProfile};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResponse {
    pub user_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolveConversationRequest {
    pub user_id: UserId,
    pub participant_ids: Vec<UserId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedConversation {
    pub conversation_id: ConversationId,
    pub was_created: bool,
}

/// Raw attachment bytes as submitted by a client, base64 encoded for JSON transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentUpload {
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    pub data_b64: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub user_id: UserId,
    pub content: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default)]
    pub attachments: Vec<AttachmentUpload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkReadRequest {
    pub user_id: UserId,
    #[serde(default)]
    pub message_ids: Vec<MessageId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PinConversationRequest {
    pub user_id: UserId,
    pub pinned: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentPayload {
    pub attachment_id: AttachmentId,
    pub url: String,
    pub filename: String,
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    pub sent_at: DateTime<Utc>,
    pub is_read: bool,
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default)]
    pub attachments: Vec<AttachmentPayload>,
}

impl MessagePayload {
    /// Position of the message in the authoritative conversation order.
    pub fn order_key(&self) -> (DateTime<Utc>, MessageId) {
        (self.sent_at, self.message_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePreview {
    pub message_id: MessageId,
    pub sender_id: UserId,
    pub content: String,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub conversation_id: ConversationId,
    pub participants: Vec<UserProfile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<MessagePreview>,
    pub unread_count: u64,
    pub pinned: bool,
    pub last_activity_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Delivered,
    /// The message was stored but one or more attachments were dropped.
    PartialFailure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentFailure {
    pub filename: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendMessageResponse {
    pub status: DeliveryStatus,
    pub message: MessagePayload,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_attachments: Vec<AttachmentFailure>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkReadResponse {
    pub marked: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationUnread {
    pub conversation_id: ConversationId,
    pub unread_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreadSummary {
    pub total: u64,
    pub conversations: Vec<ConversationUnread>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationChange {
    Created,
    Pinned,
    Unpinned,
    Left,
    Rejoined,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    MessageCreated {
        message: MessagePayload,
    },
    MessagesRead {
        conversation_id: ConversationId,
        reader_id: UserId,
        message_ids: Vec<MessageId>,
        last_read_at: DateTime<Utc>,
    },
    ConversationUpdated {
        conversation_id: ConversationId,
        change: ConversationChange,
    },
    /// Events were dropped for this subscriber; cached state must be refetched.
    ResyncRequired,
}

impl ServerEvent {
    pub fn conversation_id(&self) -> Option<ConversationId> {
        match self {
            ServerEvent::MessageCreated { message } => Some(message.conversation_id),
            ServerEvent::MessagesRead {
                conversation_id, ..
            }
            | ServerEvent::ConversationUpdated {
                conversation_id, ..
            } => Some(*conversation_id),
            ServerEvent::ResyncRequired => None,
        }
    }
}
