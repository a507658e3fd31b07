use std::{collections::HashMap, future::Future, sync::Arc, time::Duration};

use chrono::Utc;
use shared::{
    domain::{ConversationId, MessageId, UserId, UserProfile},
    error::{ApiError, ErrorCode},
    protocol::{
        AttachmentPayload, AttachmentUpload, ConversationChange, ConversationSummary,
        DeliveryStatus, MarkReadResponse, MessagePayload, MessagePreview, ResolvedConversation,
        SendMessageResponse, ServerEvent,
    },
};
use storage::{ObjectStore, Storage, StoredMessage, StoredObject};
use tracing::{error, info, warn};

pub mod attachments;
pub mod events;
pub mod resolver;
pub mod retry;
pub mod unread;

pub use events::{EventBus, UserFeed};
pub use retry::{with_retry, RetryConfig, RetryError};
pub use unread::{total_unread, unread_count, unread_summary};

#[derive(Debug, Clone)]
pub struct ApiLimits {
    pub max_attachment_bytes: usize,
    pub signed_url_ttl: Duration,
    pub max_page_size: u32,
}

impl Default for ApiLimits {
    fn default() -> Self {
        Self {
            max_attachment_bytes: attachments::MAX_ATTACHMENT_BYTES,
            signed_url_ttl: Duration::from_secs(15 * 60),
            max_page_size: 100,
        }
    }
}

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
    pub objects: Arc<dyn ObjectStore>,
    pub events: EventBus,
    pub retry: RetryConfig,
    pub limits: ApiLimits,
}

impl ApiContext {
    pub fn new(storage: Storage, objects: Arc<dyn ObjectStore>, events: EventBus) -> Self {
        Self {
            storage,
            objects,
            events,
            retry: RetryConfig::default(),
            limits: ApiLimits::default(),
        }
    }
}

/// Every conversation the user is in, annotated for display and ordered by recent
/// activity. With `pinned_first`, pinned conversations lead while keeping that order.
pub async fn list_conversations(
    ctx: &ApiContext,
    user_id: UserId,
    pinned_first: bool,
) -> Result<Vec<ConversationSummary>, ApiError> {
    let conversations = storage_call(ctx, "list conversations", move || {
        ctx.storage.list_conversations_for_user(user_id)
    })
    .await?;
    let others = storage_call(ctx, "load participants", move || {
        ctx.storage.other_participants_for_user(user_id)
    })
    .await?;
    let mut last_messages = storage_call(ctx, "load last messages", move || {
        ctx.storage.last_messages_for_user(user_id)
    })
    .await?;
    let unread: HashMap<ConversationId, u64> = storage_call(ctx, "count unread", move || {
        ctx.storage.unread_counts_for_user(user_id)
    })
    .await?
    .into_iter()
    .collect();

    let mut participants: HashMap<ConversationId, Vec<UserProfile>> = HashMap::new();
    for (conversation_id, profile) in others {
        participants.entry(conversation_id).or_default().push(profile);
    }

    let mut summaries: Vec<ConversationSummary> = conversations
        .into_iter()
        .map(|conversation| {
            let id = conversation.conversation_id;
            ConversationSummary {
                conversation_id: id,
                participants: participants.remove(&id).unwrap_or_default(),
                last_message: last_messages.remove(&id).map(|m| MessagePreview {
                    message_id: m.message_id,
                    sender_id: m.sender_id,
                    content: m.content,
                    sent_at: m.created_at,
                }),
                unread_count: unread.get(&id).copied().unwrap_or(0),
                pinned: conversation.pinned,
                last_activity_at: conversation.last_activity_at,
            }
        })
        .collect();

    if pinned_first {
        summaries.sort_by_key(|summary| !summary.pinned);
    }
    Ok(summaries)
}

/// Finds or creates the conversation for `{user_id} ∪ participant_ids`.
pub async fn resolve_conversation(
    ctx: &ApiContext,
    user_id: UserId,
    participant_ids: &[UserId],
) -> Result<ResolvedConversation, ApiError> {
    let resolution = resolver::resolve(ctx, user_id, participant_ids).await?;
    let conversation_id = resolution.conversation_id;

    if resolution.was_created {
        ctx.events.publish(
            resolution.participants.clone(),
            ServerEvent::ConversationUpdated {
                conversation_id,
                change: ConversationChange::Created,
            },
        );
    } else if !resolution.rejoined.is_empty() {
        ctx.events.publish(
            resolution.participants.clone(),
            ServerEvent::ConversationUpdated {
                conversation_id,
                change: ConversationChange::Rejoined,
            },
        );
    }

    Ok(ResolvedConversation {
        conversation_id,
        was_created: resolution.was_created,
    })
}

/// Returns one page of messages in conversation order and marks what the caller has now
/// seen as read.
///
/// Loading the newest page (`before == None`) reads everything up to the newest message
/// returned; loading an older page only reads the messages on that page. Other participants get a
/// `MessagesRead` event when anything changed.
pub async fn get_messages(
    ctx: &ApiContext,
    user_id: UserId,
    conversation_id: ConversationId,
    limit: u32,
    before: Option<MessageId>,
) -> Result<Vec<MessagePayload>, ApiError> {
    ensure_participant(ctx, conversation_id, user_id).await?;
    let limit = limit.clamp(1, ctx.limits.max_page_size);

    let mut messages = storage_call(ctx, "list messages", move || {
        ctx.storage.list_messages(conversation_id, limit, before)
    })
    .await?;

    let now = Utc::now();
    let newest_loaded = messages.last().map(|m| m.message_id);
    let receipt = if let (None, Some(through)) = (before, newest_loaded) {
        // Bounded by the page so messages appended since the listing stay unread.
        storage_call(ctx, "mark read", move || {
            ctx.storage.mark_read_through(conversation_id, user_id, through, now)
        })
        .await?
    } else {
        let unread: Vec<MessageId> = messages
            .iter()
            .filter(|m| !m.is_read && m.sender_id != user_id)
            .map(|m| m.message_id)
            .collect();
        let unread = unread.as_slice();
        storage_call(ctx, "mark read", move || {
            ctx.storage.mark_read(conversation_id, user_id, unread, now)
        })
        .await?
    };

    for message in &mut messages {
        if receipt.message_ids.binary_search(&message.message_id).is_ok() {
            message.is_read = true;
        }
    }
    if !receipt.message_ids.is_empty() {
        publish_read(ctx, conversation_id, user_id, receipt).await?;
    }

    messages
        .into_iter()
        .map(|message| message_payload(ctx, message))
        .collect()
}

/// Stores a message, uploading attachments first. Attachments that fail validation or
/// upload are dropped and reported; the message itself still goes out.
pub async fn send_message(
    ctx: &ApiContext,
    user_id: UserId,
    conversation_id: ConversationId,
    content: &str,
    metadata: serde_json::Value,
    attachments: &[AttachmentUpload],
) -> Result<SendMessageResponse, ApiError> {
    if content.trim().is_empty() {
        return Err(ApiError::validation("message content cannot be empty"));
    }
    let metadata = if metadata.is_null() {
        serde_json::json!({})
    } else {
        metadata
    };
    ensure_participant(ctx, conversation_id, user_id).await?;

    let (uploaded, failed_attachments) = attachments::upload_attachments(
        ctx.objects.as_ref(),
        conversation_id,
        attachments,
        ctx.limits.max_attachment_bytes,
    )
    .await;

    let now = Utc::now();
    let metadata_ref = &metadata;
    let uploaded_ref = uploaded.as_slice();
    let stored = storage_call(ctx, "append message", move || {
        ctx.storage.append_message(
            conversation_id,
            user_id,
            content,
            metadata_ref,
            uploaded_ref,
            now,
        )
    })
    .await?
    .ok_or_else(|| ApiError::forbidden("user is not a participant"))?;

    let message = message_payload(ctx, stored)?;
    let audience = storage_call(ctx, "load participants", move || {
        ctx.storage.participant_ids(conversation_id)
    })
    .await?;
    ctx.events.publish(
        audience,
        ServerEvent::MessageCreated {
            message: message.clone(),
        },
    );

    let status = if failed_attachments.is_empty() {
        DeliveryStatus::Delivered
    } else {
        warn!(
            %conversation_id,
            message_id = %message.message_id,
            failed = failed_attachments.len(),
            "message sent without some attachments"
        );
        DeliveryStatus::PartialFailure
    };

    Ok(SendMessageResponse {
        status,
        message,
        failed_attachments,
    })
}

/// Marks the listed messages from others as read, or the whole conversation when the
/// list is empty. Repeating the call is a no-op.
pub async fn mark_read(
    ctx: &ApiContext,
    user_id: UserId,
    conversation_id: ConversationId,
    message_ids: &[MessageId],
) -> Result<MarkReadResponse, ApiError> {
    ensure_participant(ctx, conversation_id, user_id).await?;
    let now = Utc::now();
    let receipt = if message_ids.is_empty() {
        storage_call(ctx, "mark read", move || {
            ctx.storage.mark_conversation_read(conversation_id, user_id, now)
        })
        .await?
    } else {
        storage_call(ctx, "mark read", move || {
            ctx.storage
                .mark_read(conversation_id, user_id, message_ids, now)
        })
        .await?
    };

    let marked = receipt.message_ids.len() as u64;
    if marked > 0 {
        publish_read(ctx, conversation_id, user_id, receipt).await?;
    }
    Ok(MarkReadResponse { marked })
}

pub async fn pin_conversation(
    ctx: &ApiContext,
    user_id: UserId,
    conversation_id: ConversationId,
    pinned: bool,
) -> Result<(), ApiError> {
    ensure_participant(ctx, conversation_id, user_id).await?;
    storage_call(ctx, "pin conversation", move || {
        ctx.storage.set_pinned(conversation_id, user_id, pinned)
    })
    .await?;

    let change = if pinned {
        ConversationChange::Pinned
    } else {
        ConversationChange::Unpinned
    };
    ctx.events.publish(
        vec![user_id],
        ServerEvent::ConversationUpdated {
            conversation_id,
            change,
        },
    );
    Ok(())
}

/// Leaves the conversation for the caller only.
pub async fn delete_conversation(
    ctx: &ApiContext,
    user_id: UserId,
    conversation_id: ConversationId,
) -> Result<(), ApiError> {
    ensure_participant(ctx, conversation_id, user_id).await?;
    let audience = storage_call(ctx, "load participants", move || {
        ctx.storage.participant_ids(conversation_id)
    })
    .await?;
    let removed = storage_call(ctx, "leave conversation", move || {
        ctx.storage.remove_participant(conversation_id, user_id)
    })
    .await?;
    if !removed {
        return Err(ApiError::forbidden("user is not a participant"));
    }

    info!(%conversation_id, %user_id, "participant left conversation");
    ctx.events.publish(
        audience,
        ServerEvent::ConversationUpdated {
            conversation_id,
            change: ConversationChange::Left,
        },
    );
    Ok(())
}

/// Serves a private object when `token` is a valid signature for `path`.
pub async fn fetch_object(
    ctx: &ApiContext,
    path: &str,
    token: &str,
) -> Result<StoredObject, ApiError> {
    if !ctx.objects.verify_signature(path, token) {
        return Err(ApiError::forbidden("invalid or expired object token"));
    }
    storage_call(ctx, "load object", move || ctx.objects.get_object(path))
        .await?
        .ok_or_else(|| ApiError::not_found("object not found"))
}

pub(crate) async fn ensure_participant(
    ctx: &ApiContext,
    conversation_id: ConversationId,
    user_id: UserId,
) -> Result<(), ApiError> {
    let participant = storage_call(ctx, "load participant", move || {
        ctx.storage.participant(conversation_id, user_id)
    })
    .await?;
    if participant.is_some() {
        return Ok(());
    }

    let exists = storage_call(ctx, "load conversation", move || {
        ctx.storage.conversation_exists(conversation_id)
    })
    .await?;
    if exists {
        Err(ApiError::forbidden("user is not a participant"))
    } else {
        Err(ApiError::not_found("conversation not found"))
    }
}

async fn publish_read(
    ctx: &ApiContext,
    conversation_id: ConversationId,
    reader_id: UserId,
    receipt: storage::ReadReceipt,
) -> Result<(), ApiError> {
    let audience = storage_call(ctx, "load participants", move || {
        ctx.storage.participant_ids(conversation_id)
    })
    .await?;
    ctx.events.publish(
        audience,
        ServerEvent::MessagesRead {
            conversation_id,
            reader_id,
            message_ids: receipt.message_ids,
            last_read_at: receipt.last_read_at,
        },
    );
    Ok(())
}

fn message_payload(ctx: &ApiContext, message: StoredMessage) -> Result<MessagePayload, ApiError> {
    let attachments = message
        .attachments
        .into_iter()
        .map(|attachment| {
            let url = ctx
                .objects
                .signed_url(&attachment.storage_path, ctx.limits.signed_url_ttl)
                .map_err(internal)?;
            Ok(AttachmentPayload {
                attachment_id: attachment.attachment_id,
                url,
                filename: attachment.filename,
                size_bytes: attachment.size_bytes,
                mime_type: attachment.mime_type,
            })
        })
        .collect::<Result<Vec<_>, ApiError>>()?;

    Ok(MessagePayload {
        message_id: message.message_id,
        conversation_id: message.conversation_id,
        sender_id: message.sender_id,
        content: message.content,
        sent_at: message.created_at,
        is_read: message.is_read,
        metadata: message.metadata,
        attachments,
    })
}

/// Runs a storage operation under the context's retry policy. Transient failures that
/// outlast the budget surface as `Unavailable`.
pub(crate) async fn storage_call<T, F, Fut>(
    ctx: &ApiContext,
    operation: &'static str,
    op: F,
) -> Result<T, ApiError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    with_retry(&ctx.retry, storage::is_transient, op)
        .await
        .map_err(|err| match err {
            RetryError::Exhausted { attempts, last } => {
                error!(operation, attempts, error = %last, "storage unavailable");
                ApiError::new(
                    ErrorCode::Unavailable,
                    format!("{operation} failed: storage unavailable"),
                )
            }
            RetryError::Permanent(err) => internal(err),
        })
}

fn internal(err: anyhow::Error) -> ApiError {
    error!(error = %err, "internal error");
    ApiError::new(ErrorCode::Internal, err.to_string())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
