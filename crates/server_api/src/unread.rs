//! Unread counts, always derived from stored read flags.

use shared::{
    domain::{ConversationId, UserId},
    error::ApiError,
    protocol::{ConversationUnread, UnreadSummary},
};

use crate::{ensure_participant, storage_call, ApiContext};

pub async fn unread_count(
    ctx: &ApiContext,
    user_id: UserId,
    conversation_id: ConversationId,
) -> Result<u64, ApiError> {
    ensure_participant(ctx, conversation_id, user_id).await?;
    storage_call(ctx, "count unread", move || {
        ctx.storage.unread_count(user_id, conversation_id)
    })
    .await
}

pub async fn unread_summary(ctx: &ApiContext, user_id: UserId) -> Result<UnreadSummary, ApiError> {
    let counts = storage_call(ctx, "count unread", move || {
        ctx.storage.unread_counts_for_user(user_id)
    })
    .await?;
    Ok(UnreadSummary {
        total: counts.iter().map(|(_, count)| count).sum(),
        conversations: counts
            .into_iter()
            .map(|(conversation_id, unread_count)| ConversationUnread {
                conversation_id,
                unread_count,
            })
            .collect(),
    })
}

pub async fn total_unread(ctx: &ApiContext, user_id: UserId) -> Result<u64, ApiError> {
    Ok(unread_summary(ctx, user_id).await?.total)
}
