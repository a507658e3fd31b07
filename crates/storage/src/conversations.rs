use anyhow::Result;
use chrono::{DateTime, Utc};
use shared::domain::{ConversationId, UserId, UserProfile};
use sqlx::Row;
use tracing::debug;

use crate::{
    is_unique_violation, profile_from_row, CreateConversationOutcome, ParticipantSet, Storage,
    StoredConversation, StoredParticipant,
};

impl Storage {
    pub async fn find_conversation_by_key(
        &self,
        participant_set_key: &str,
    ) -> Result<Option<ConversationId>> {
        let row = sqlx::query("SELECT id FROM conversations WHERE participant_set_key = ?")
            .bind(participant_set_key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| ConversationId(r.get::<i64, _>(0))))
    }

    /// Inserts the conversation and every participant row in one transaction.
    ///
    /// A unique-key collision on the participant set is reported as
    /// [`CreateConversationOutcome::Conflict`] rather than an error so the caller can
    /// fall back to the lookup path.
    pub async fn create_conversation(
        &self,
        participants: &ParticipantSet,
        now: DateTime<Utc>,
    ) -> Result<CreateConversationOutcome> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            "INSERT INTO conversations (participant_set_key, created_at, last_activity_at)
             VALUES (?, ?, ?)
             RETURNING id",
        )
        .bind(participants.key())
        .bind(now)
        .bind(now)
        .fetch_one(&mut *tx)
        .await;

        let conversation_id = match inserted {
            Ok(row) => ConversationId(row.get::<i64, _>(0)),
            Err(err) if is_unique_violation(&err) => {
                tx.rollback().await?;
                debug!(
                    participants = participants.len(),
                    "conversation insert lost participant-set race"
                );
                return Ok(CreateConversationOutcome::Conflict);
            }
            Err(err) => return Err(err.into()),
        };

        for user_id in participants.iter() {
            sqlx::query(
                "INSERT INTO participants (conversation_id, user_id, joined_at) VALUES (?, ?, ?)",
            )
            .bind(conversation_id.0)
            .bind(user_id.0)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(CreateConversationOutcome::Created(conversation_id))
    }

    /// Restores participant rows for members of the set who previously left.
    /// Returns the users that were re-added.
    pub async fn restore_participants(
        &self,
        conversation_id: ConversationId,
        participants: &ParticipantSet,
        now: DateTime<Utc>,
    ) -> Result<Vec<UserId>> {
        let mut restored = Vec::new();
        for user_id in participants.iter() {
            let inserted = sqlx::query(
                "INSERT INTO participants (conversation_id, user_id, joined_at) VALUES (?, ?, ?)
                 ON CONFLICT(conversation_id, user_id) DO NOTHING",
            )
            .bind(conversation_id.0)
            .bind(user_id.0)
            .bind(now)
            .execute(&self.pool)
            .await?
            .rows_affected();
            if inserted > 0 {
                restored.push(user_id);
            }
        }
        Ok(restored)
    }

    pub async fn participant(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<Option<StoredParticipant>> {
        let row = sqlx::query(
            "SELECT conversation_id, user_id, joined_at, last_read_at, is_pinned
             FROM participants
             WHERE conversation_id = ? AND user_id = ?",
        )
        .bind(conversation_id.0)
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| StoredParticipant {
            conversation_id: ConversationId(r.get::<i64, _>(0)),
            user_id: UserId(r.get::<i64, _>(1)),
            joined_at: r.get::<DateTime<Utc>, _>(2),
            last_read_at: r.get::<Option<DateTime<Utc>>, _>(3),
            is_pinned: r.get::<bool, _>(4),
        }))
    }

    pub async fn participant_ids(&self, conversation_id: ConversationId) -> Result<Vec<UserId>> {
        let rows = sqlx::query(
            "SELECT user_id FROM participants WHERE conversation_id = ? ORDER BY user_id ASC",
        )
        .bind(conversation_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| UserId(r.get::<i64, _>(0)))
            .collect())
    }

    pub async fn conversation_exists(&self, conversation_id: ConversationId) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM conversations WHERE id = ?")
            .bind(conversation_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Conversations the user currently participates in, most recent activity first.
    pub async fn list_conversations_for_user(
        &self,
        user_id: UserId,
    ) -> Result<Vec<StoredConversation>> {
        let rows = sqlx::query(
            "SELECT c.id, c.created_at, c.last_activity_at, p.is_pinned, p.last_read_at
             FROM conversations c
             INNER JOIN participants p ON p.conversation_id = c.id
             WHERE p.user_id = ?
             ORDER BY c.last_activity_at DESC, c.id DESC",
        )
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| StoredConversation {
                conversation_id: ConversationId(r.get::<i64, _>(0)),
                created_at: r.get::<DateTime<Utc>, _>(1),
                last_activity_at: r.get::<DateTime<Utc>, _>(2),
                pinned: r.get::<bool, _>(3),
                last_read_at: r.get::<Option<DateTime<Utc>>, _>(4),
            })
            .collect())
    }

    /// Profiles of everyone except `user_id` in each of the user's conversations.
    pub async fn other_participants_for_user(
        &self,
        user_id: UserId,
    ) -> Result<Vec<(ConversationId, UserProfile)>> {
        let rows = sqlx::query(
            "SELECT p.conversation_id, u.id, u.username, u.display_name, u.avatar_url
             FROM participants p
             INNER JOIN users u ON u.id = p.user_id
             WHERE p.conversation_id IN (SELECT conversation_id FROM participants WHERE user_id = ?)
               AND p.user_id != ?
             ORDER BY p.conversation_id ASC, lower(u.username) ASC",
        )
        .bind(user_id.0)
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| {
                (
                    ConversationId(r.get::<i64, _>(0)),
                    profile_from_row(&r, 1),
                )
            })
            .collect())
    }

    pub async fn set_pinned(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        pinned: bool,
    ) -> Result<bool> {
        let updated = sqlx::query(
            "UPDATE participants SET is_pinned = ? WHERE conversation_id = ? AND user_id = ?",
        )
        .bind(pinned)
        .bind(conversation_id.0)
        .bind(user_id.0)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated > 0)
    }

    /// Removes only the caller's participant row; the conversation stays for everyone else.
    pub async fn remove_participant(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<bool> {
        let removed =
            sqlx::query("DELETE FROM participants WHERE conversation_id = ? AND user_id = ?")
                .bind(conversation_id.0)
                .bind(user_id.0)
                .execute(&self.pool)
                .await?
                .rows_affected();
        Ok(removed > 0)
    }
}
