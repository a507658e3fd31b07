//! Find-or-create of the single conversation owned by an exact participant set.

use chrono::Utc;
use shared::{
    domain::{ConversationId, UserId},
    error::{ApiError, ErrorCode},
};
use storage::{CreateConversationOutcome, ParticipantSet};
use tracing::{debug, info, warn};

use crate::{storage_call, ApiContext};

/// How many lookup/create rounds a resolution gets before giving up. Every lost
/// creation race is followed by a lookup that should find the winner, so a second
/// round is normally enough.
pub const MAX_RESOLVE_ROUNDS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub conversation_id: ConversationId,
    pub was_created: bool,
    /// Members of the set that had left and were added back.
    pub rejoined: Vec<UserId>,
    pub participants: Vec<UserId>,
}

/// Shape checks that need no I/O.
pub fn participant_set_for(
    requesting: UserId,
    others: &[UserId],
) -> Result<ParticipantSet, ApiError> {
    if others.is_empty() {
        return Err(ApiError::validation(
            "at least one other participant is required",
        ));
    }
    let set = ParticipantSet::new(requesting, others.iter().copied());
    if set.len() < 2 {
        return Err(ApiError::validation(
            "cannot start a conversation with yourself",
        ));
    }
    Ok(set)
}

pub async fn resolve(
    ctx: &ApiContext,
    requesting: UserId,
    others: &[UserId],
) -> Result<Resolution, ApiError> {
    let set = participant_set_for(requesting, others)?;
    let set = &set;
    let members = set.to_vec();
    let members_ref = members.as_slice();

    let known = storage_call(ctx, "load participants", move || {
        ctx.storage.existing_users(members_ref)
    })
    .await?;
    if known.len() != set.len() {
        let mut missing: Vec<String> = set
            .iter()
            .filter(|id| !known.contains(id))
            .map(|id| id.to_string())
            .collect();
        missing.sort();
        return Err(ApiError::validation(format!(
            "unknown participant(s): {}",
            missing.join(", ")
        )));
    }

    let key = set.key();
    let key = key.as_str();
    for round in 1..=MAX_RESOLVE_ROUNDS {
        // The key names the set the conversation was created for. Membership drift
        // (someone leaving) never moves a conversation to another key.
        let by_key = storage_call(ctx, "find conversation", move || {
            ctx.storage.find_conversation_by_key(key)
        })
        .await?;
        if let Some(conversation_id) = by_key {
            let now = Utc::now();
            let rejoined = storage_call(ctx, "restore participants", move || {
                ctx.storage.restore_participants(conversation_id, set, now)
            })
            .await?;
            if !rejoined.is_empty() {
                info!(%conversation_id, rejoined = rejoined.len(), "participants rejoined conversation");
            }
            return Ok(Resolution {
                conversation_id,
                was_created: false,
                rejoined,
                participants: members,
            });
        }

        let now = Utc::now();
        let outcome = storage_call(ctx, "create conversation", move || {
            ctx.storage.create_conversation(set, now)
        })
        .await?;
        match outcome {
            CreateConversationOutcome::Created(conversation_id) => {
                info!(
                    %conversation_id,
                    %requesting,
                    participants = set.len(),
                    "conversation created"
                );
                return Ok(Resolution {
                    conversation_id,
                    was_created: true,
                    rejoined: Vec::new(),
                    participants: members,
                });
            }
            CreateConversationOutcome::Conflict => {
                debug!(round, %requesting, "lost creation race, re-resolving");
            }
        }
    }

    warn!(%requesting, rounds = MAX_RESOLVE_ROUNDS, "conversation resolution did not converge");
    Err(ApiError::new(
        ErrorCode::ResolutionFailed,
        "conversation could not be resolved, try again",
    ))
}
