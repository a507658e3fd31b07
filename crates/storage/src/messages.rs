use std::collections::HashMap;

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::{stream, Stream, TryStreamExt};
use shared::domain::{AttachmentId, ConversationId, MessageId, UserId};
use sqlx::{sqlite::SqliteRow, QueryBuilder, Row, Sqlite};

use crate::{NewAttachment, ReadReceipt, Storage, StoredAttachment, StoredMessage};

const MESSAGE_COLUMNS: &str =
    "id, conversation_id, sender_user_id, content, created_at, is_read, metadata";

impl Storage {
    /// Appends a message and links its already-uploaded attachments.
    ///
    /// Returns `None` when `sender_id` is not a participant of the conversation; nothing
    /// is written in that case. The parent conversation's last activity is advanced in
    /// the same transaction.
    pub async fn append_message(
        &self,
        conversation_id: ConversationId,
        sender_id: UserId,
        content: &str,
        metadata: &serde_json::Value,
        attachments: &[NewAttachment],
        created_at: DateTime<Utc>,
    ) -> Result<Option<StoredMessage>> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            "INSERT INTO messages (conversation_id, sender_user_id, content, created_at, metadata)
             SELECT ?, ?, ?, ?, ?
             WHERE EXISTS (
                SELECT 1 FROM participants WHERE conversation_id = ? AND user_id = ?
             )
             RETURNING id",
        )
        .bind(conversation_id.0)
        .bind(sender_id.0)
        .bind(content)
        .bind(created_at)
        .bind(serde_json::to_string(metadata)?)
        .bind(conversation_id.0)
        .bind(sender_id.0)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = inserted else {
            tx.rollback().await?;
            return Ok(None);
        };
        let message_id = MessageId(row.get::<i64, _>(0));

        sqlx::query(
            "UPDATE conversations
             SET last_activity_at = CASE WHEN last_activity_at < ? THEN ? ELSE last_activity_at END
             WHERE id = ?",
        )
        .bind(created_at)
        .bind(created_at)
        .bind(conversation_id.0)
        .execute(&mut *tx)
        .await?;

        let mut stored_attachments = Vec::with_capacity(attachments.len());
        for attachment in attachments {
            let row = sqlx::query(
                "INSERT INTO attachments (message_id, storage_path, url, filename, mime_type, size_bytes)
                 VALUES (?, ?, ?, ?, ?, ?)
                 RETURNING id",
            )
            .bind(message_id.0)
            .bind(&attachment.storage_path)
            .bind(&attachment.url)
            .bind(&attachment.filename)
            .bind(attachment.mime_type.as_deref())
            .bind(i64::try_from(attachment.size_bytes).unwrap_or(i64::MAX))
            .fetch_one(&mut *tx)
            .await?;
            stored_attachments.push(StoredAttachment {
                attachment_id: AttachmentId(row.get::<i64, _>(0)),
                message_id,
                storage_path: attachment.storage_path.clone(),
                url: attachment.url.clone(),
                filename: attachment.filename.clone(),
                mime_type: attachment.mime_type.clone(),
                size_bytes: attachment.size_bytes,
            });
        }

        tx.commit().await?;

        Ok(Some(StoredMessage {
            message_id,
            conversation_id,
            sender_id,
            content: content.to_string(),
            created_at,
            is_read: false,
            metadata: metadata.clone(),
            attachments: stored_attachments,
        }))
    }

    /// The newest `limit` messages (optionally strictly older than `before`), returned
    /// oldest first.
    pub async fn list_messages(
        &self,
        conversation_id: ConversationId,
        limit: u32,
        before: Option<MessageId>,
    ) -> Result<Vec<StoredMessage>> {
        let mut rows = if let Some(before_id) = before {
            sqlx::query(&format!(
                "SELECT {MESSAGE_COLUMNS}
                 FROM messages
                 WHERE conversation_id = ?
                   AND (created_at, id) < (SELECT created_at, id FROM messages WHERE id = ?)
                 ORDER BY created_at DESC, id DESC
                 LIMIT ?"
            ))
            .bind(conversation_id.0)
            .bind(before_id.0)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query(&format!(
                "SELECT {MESSAGE_COLUMNS}
                 FROM messages
                 WHERE conversation_id = ?
                 ORDER BY created_at DESC, id DESC
                 LIMIT ?"
            ))
            .bind(conversation_id.0)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        };

        rows.reverse();
        self.hydrate_messages(rows).await
    }

    /// Up to `limit` messages strictly after the `after` cursor, oldest first.
    pub async fn list_messages_after(
        &self,
        conversation_id: ConversationId,
        after: Option<MessageId>,
        limit: u32,
    ) -> Result<Vec<StoredMessage>> {
        let rows = if let Some(after_id) = after {
            sqlx::query(&format!(
                "SELECT {MESSAGE_COLUMNS}
                 FROM messages
                 WHERE conversation_id = ?
                   AND (created_at, id) > (SELECT created_at, id FROM messages WHERE id = ?)
                 ORDER BY created_at ASC, id ASC
                 LIMIT ?"
            ))
            .bind(conversation_id.0)
            .bind(after_id.0)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query(&format!(
                "SELECT {MESSAGE_COLUMNS}
                 FROM messages
                 WHERE conversation_id = ?
                 ORDER BY created_at ASC, id ASC
                 LIMIT ?"
            ))
            .bind(conversation_id.0)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        };

        self.hydrate_messages(rows).await
    }

    /// Lazily walks the whole conversation in order, one page at a time.
    ///
    /// The stream is finite and each call starts again from the first message.
    pub fn message_stream(
        &self,
        conversation_id: ConversationId,
        page_size: u32,
    ) -> impl Stream<Item = Result<StoredMessage>> + Send + '_ {
        let page_size = page_size.max(1);
        stream::try_unfold(Some(None::<MessageId>), move |cursor| async move {
            let Some(after) = cursor else {
                return Ok::<_, anyhow::Error>(None);
            };
            let page = self
                .list_messages_after(conversation_id, after, page_size)
                .await?;
            if page.is_empty() {
                return Ok(None);
            }
            let next = if page.len() < page_size as usize {
                None
            } else {
                page.last().map(|message| Some(message.message_id))
            };
            Ok(Some((
                stream::iter(page.into_iter().map(Ok::<_, anyhow::Error>)),
                next,
            )))
        })
        .try_flatten()
    }

    pub async fn last_messages_for_user(
        &self,
        user_id: UserId,
    ) -> Result<HashMap<ConversationId, StoredMessage>> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS}
             FROM messages m
             WHERE m.conversation_id IN (SELECT conversation_id FROM participants WHERE user_id = ?)
               AND m.id = (
                   SELECT latest.id FROM messages latest
                   WHERE latest.conversation_id = m.conversation_id
                   ORDER BY latest.created_at DESC, latest.id DESC
                   LIMIT 1
               )"
        ))
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(message_from_row)
            .map(|message| (message.conversation_id, message))
            .collect())
    }

    /// Marks the given messages from other participants as read and advances the
    /// reader's `last_read_at`. Already-read messages are left untouched.
    pub async fn mark_read(
        &self,
        conversation_id: ConversationId,
        reader_id: UserId,
        message_ids: &[MessageId],
        now: DateTime<Utc>,
    ) -> Result<ReadReceipt> {
        self.mark_read_inner(conversation_id, reader_id, Some(message_ids), None, now)
            .await
    }

    /// Marks every unread message from other participants as read.
    pub async fn mark_conversation_read(
        &self,
        conversation_id: ConversationId,
        reader_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<ReadReceipt> {
        self.mark_read_inner(conversation_id, reader_id, None, None, now)
            .await
    }

    /// Marks unread messages from other participants up to and including `through` in
    /// conversation order. Messages appended after `through` stay unread.
    pub async fn mark_read_through(
        &self,
        conversation_id: ConversationId,
        reader_id: UserId,
        through: MessageId,
        now: DateTime<Utc>,
    ) -> Result<ReadReceipt> {
        self.mark_read_inner(conversation_id, reader_id, None, Some(through), now)
            .await
    }

    async fn mark_read_inner(
        &self,
        conversation_id: ConversationId,
        reader_id: UserId,
        message_ids: Option<&[MessageId]>,
        through: Option<MessageId>,
        now: DateTime<Utc>,
    ) -> Result<ReadReceipt> {
        let mut tx = self.pool.begin().await?;

        let marked = match message_ids {
            Some([]) => Vec::new(),
            _ => {
                let mut query = QueryBuilder::<Sqlite>::new(
                    "UPDATE messages SET is_read = 1 WHERE is_read = 0 AND conversation_id = ",
                );
                query.push_bind(conversation_id.0);
                query.push(" AND sender_user_id != ");
                query.push_bind(reader_id.0);
                if let Some(ids) = message_ids {
                    query.push(" AND id IN (");
                    let mut list = query.separated(", ");
                    for id in ids {
                        list.push_bind(id.0);
                    }
                    list.push_unseparated(")");
                }
                if let Some(through) = through {
                    query.push(
                        " AND (created_at, id) <= (SELECT created_at, id FROM messages WHERE id = ",
                    );
                    query.push_bind(through.0);
                    query.push(")");
                }
                query.push(" RETURNING id");

                let rows = query.build().fetch_all(&mut *tx).await?;
                let mut ids: Vec<MessageId> = rows
                    .into_iter()
                    .map(|r| MessageId(r.get::<i64, _>(0)))
                    .collect();
                ids.sort();
                ids
            }
        };

        sqlx::query(
            "UPDATE participants
             SET last_read_at = CASE
                 WHEN last_read_at IS NULL OR last_read_at < ? THEN ?
                 ELSE last_read_at
             END
             WHERE conversation_id = ? AND user_id = ?",
        )
        .bind(now)
        .bind(now)
        .bind(conversation_id.0)
        .bind(reader_id.0)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(ReadReceipt {
            message_ids: marked,
            last_read_at: now,
        })
    }

    /// Unread messages from others in one conversation.
    pub async fn unread_count(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
    ) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM messages
             WHERE conversation_id = ? AND sender_user_id != ? AND is_read = 0",
        )
        .bind(conversation_id.0)
        .bind(user_id.0)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }

    /// Unread counts for every conversation the user participates in, zeros included.
    pub async fn unread_counts_for_user(
        &self,
        user_id: UserId,
    ) -> Result<Vec<(ConversationId, u64)>> {
        let rows = sqlx::query(
            "SELECT p.conversation_id, COUNT(m.id)
             FROM participants p
             LEFT JOIN messages m
               ON m.conversation_id = p.conversation_id
              AND m.sender_user_id != p.user_id
              AND m.is_read = 0
             WHERE p.user_id = ?
             GROUP BY p.conversation_id
             ORDER BY p.conversation_id ASC",
        )
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| {
                (
                    ConversationId(r.get::<i64, _>(0)),
                    r.get::<i64, _>(1).max(0) as u64,
                )
            })
            .collect())
    }

    async fn hydrate_messages(&self, rows: Vec<SqliteRow>) -> Result<Vec<StoredMessage>> {
        let mut messages: Vec<StoredMessage> = rows.iter().map(message_from_row).collect();
        let ids: Vec<MessageId> = messages.iter().map(|m| m.message_id).collect();
        let mut attachments = self.attachments_for_messages(&ids).await?;
        for message in &mut messages {
            if let Some(found) = attachments.remove(&message.message_id) {
                message.attachments = found;
            }
        }
        Ok(messages)
    }

    pub async fn attachments_for_messages(
        &self,
        message_ids: &[MessageId],
    ) -> Result<HashMap<MessageId, Vec<StoredAttachment>>> {
        if message_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let mut query = QueryBuilder::<Sqlite>::new(
            "SELECT id, message_id, storage_path, url, filename, mime_type, size_bytes
             FROM attachments
             WHERE message_id IN (",
        );
        let mut list = query.separated(", ");
        for id in message_ids {
            list.push_bind(id.0);
        }
        list.push_unseparated(") ORDER BY id ASC");

        let rows = query.build().fetch_all(&self.pool).await?;
        let mut by_message: HashMap<MessageId, Vec<StoredAttachment>> = HashMap::new();
        for r in rows {
            let attachment = StoredAttachment {
                attachment_id: AttachmentId(r.get::<i64, _>(0)),
                message_id: MessageId(r.get::<i64, _>(1)),
                storage_path: r.get::<String, _>(2),
                url: r.get::<String, _>(3),
                filename: r.get::<String, _>(4),
                mime_type: r.get::<Option<String>, _>(5),
                size_bytes: r.get::<i64, _>(6).max(0) as u64,
            };
            by_message
                .entry(attachment.message_id)
                .or_default()
                .push(attachment);
        }
        Ok(by_message)
    }
}

fn message_from_row(r: &SqliteRow) -> StoredMessage {
    StoredMessage {
        message_id: MessageId(r.get::<i64, _>(0)),
        conversation_id: ConversationId(r.get::<i64, _>(1)),
        sender_id: UserId(r.get::<i64, _>(2)),
        content: r.get::<String, _>(3),
        created_at: r.get::<DateTime<Utc>, _>(4),
        is_read: r.get::<bool, _>(5),
        metadata: serde_json::from_str(&r.get::<String, _>(6)).unwrap_or_default(),
        attachments: Vec::new(),
    }
}
