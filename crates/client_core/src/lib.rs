use std::{
    collections::BTreeSet,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use shared::{
    domain::{ConversationId, MessageId, UserId},
    error::ApiError,
    protocol::{
        AttachmentUpload, ConversationChange, ConversationSummary, LoginRequest, LoginResponse,
        MarkReadRequest, MarkReadResponse, MessagePayload, PinConversationRequest,
        ResolveConversationRequest, ResolvedConversation, SendMessageRequest,
        SendMessageResponse, ServerEvent, UnreadSummary,
    },
};
use tokio::{
    sync::broadcast::{self, error::RecvError},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

pub mod cache;
pub mod error;
pub mod multiplexer;
pub mod transport;

pub use cache::{CacheUpdate, ConversationCache};
pub use error::ClientError;
pub use multiplexer::{
    EventStream, EventStreamConnector, FeedEvent, MultiplexerConfig, StreamState,
    SubscriptionHandle, SubscriptionMultiplexer,
};
pub use transport::WsEventStreamConnector;

pub const DEFAULT_PAGE_SIZE: u32 = 50;
const MAX_PAGE_SIZE: u32 = 100;
const UPDATE_BUFFER: usize = 256;

#[derive(Debug, Clone)]
pub struct OutgoingAttachment {
    pub filename: String,
    pub mime_type: Option<String>,
    pub bytes: Vec<u8>,
}

/// What a UI needs to know after the realtime feed moved local state.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientUpdate {
    /// Merged into the cache as-is.
    Event(ServerEvent),
    /// The cache drifted and was reloaded from the server.
    Refreshed,
    RefreshFailed(String),
    StreamDegraded,
    StreamRestored,
}

/// One signed-in user's view of their conversations.
///
/// All reads and writes go over HTTP; the realtime stream is shared through a
/// [`SubscriptionMultiplexer`] so several clients for the same user open one socket.
pub struct ConversationClient {
    http: Client,
    server_url: String,
    user_id: UserId,
    multiplexer: SubscriptionMultiplexer,
    subscription: Mutex<Option<SubscriptionHandle>>,
    cache: Mutex<ConversationCache>,
    updates: broadcast::Sender<ClientUpdate>,
}

impl ConversationClient {
    pub fn new(
        server_url: &str,
        user_id: UserId,
        multiplexer: SubscriptionMultiplexer,
    ) -> Result<Arc<Self>, ClientError> {
        let server_url = validate_server_url(server_url)?;
        let (updates, _) = broadcast::channel(UPDATE_BUFFER);
        Ok(Arc::new(Self {
            http: Client::new(),
            server_url,
            user_id,
            multiplexer,
            subscription: Mutex::new(None),
            cache: Mutex::new(ConversationCache::new(user_id)),
            updates,
        }))
    }

    pub async fn login(
        server_url: &str,
        username: &str,
        multiplexer: SubscriptionMultiplexer,
    ) -> Result<Arc<Self>, ClientError> {
        let username = username.trim();
        if username.is_empty() {
            return Err(ClientError::InvalidInput("username must not be empty".into()));
        }
        let base = validate_server_url(server_url)?;
        let response = Client::new()
            .post(format!("{base}/login"))
            .json(&LoginRequest {
                username: username.to_string(),
            })
            .send()
            .await?;
        let login: LoginResponse = decode(response).await?;
        info!(user_id = %login.user_id, %username, "logged in");
        Self::new(&base, login.user_id, multiplexer)
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn subscribe_updates(&self) -> broadcast::Receiver<ClientUpdate> {
        self.updates.subscribe()
    }

    /// Runs `callback` for every update until the client is dropped.
    pub fn on_update<F>(&self, callback: F) -> JoinHandle<()>
    where
        F: Fn(ClientUpdate) + Send + 'static,
    {
        let mut updates = self.updates.subscribe();
        tokio::spawn(async move {
            loop {
                match updates.recv().await {
                    Ok(update) => callback(update),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "update listener lagged; re-read cached state");
                        callback(ClientUpdate::Refreshed);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    /// Shares this user's realtime stream. Calling it again is a no-op.
    pub fn subscribe(self: &Arc<Self>) {
        let mut slot = lock(&self.subscription);
        if slot.is_some() {
            return;
        }
        let handle = self.multiplexer.acquire(self.user_id);
        let client = Arc::downgrade(self);
        handle.on_event(move |event| {
            if let Some(client) = client.upgrade() {
                client.handle_feed_event(event);
            }
        });
        *slot = Some(handle);
    }

    pub fn is_subscribed(&self) -> bool {
        lock(&self.subscription).is_some()
    }

    /// Releases this client's share of the realtime stream.
    pub fn close(&self) {
        if let Some(handle) = lock(&self.subscription).take() {
            handle.release();
            debug!(user_id = %self.user_id, "client closed its subscription");
        }
    }

    pub fn cached_conversations(&self) -> Vec<ConversationSummary> {
        self.cache().conversations()
    }

    pub fn cached_messages(&self, conversation_id: ConversationId) -> Vec<MessagePayload> {
        self.cache()
            .messages(conversation_id)
            .map(<[MessagePayload]>::to_vec)
            .unwrap_or_default()
    }

    pub fn cached_unread(&self) -> u64 {
        self.cache().total_unread()
    }

    pub async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, ClientError> {
        let response = self
            .http
            .get(self.url("/conversations"))
            .query(&[
                ("user_id", self.user_id.0.to_string()),
                ("pinned_first", "true".to_string()),
            ])
            .send()
            .await?;
        let conversations: Vec<ConversationSummary> = decode(response).await?;
        self.cache().replace_conversations(conversations.clone());
        Ok(conversations)
    }

    /// Finds or creates the conversation with exactly `participant_ids` plus this user,
    /// and makes sure the realtime stream is running.
    pub async fn open_conversation(
        self: &Arc<Self>,
        participant_ids: &[UserId],
    ) -> Result<ResolvedConversation, ClientError> {
        let others: BTreeSet<UserId> = participant_ids
            .iter()
            .copied()
            .filter(|id| *id != self.user_id)
            .collect();
        if others.is_empty() {
            return Err(ClientError::InvalidInput(
                "a conversation needs at least one other participant".into(),
            ));
        }

        let response = self
            .http
            .post(self.url("/conversations/resolve"))
            .json(&ResolveConversationRequest {
                user_id: self.user_id,
                participant_ids: others.into_iter().collect(),
            })
            .send()
            .await?;
        let resolved: ResolvedConversation = decode(response).await?;
        self.subscribe();

        let known = self.cache().conversation(resolved.conversation_id).is_some();
        if !known {
            self.list_conversations().await?;
        }
        Ok(resolved)
    }

    /// Loads a page of messages, oldest first. The server marks what it returns as read,
    /// so the newest page also resets the cached unread count.
    pub async fn get_messages(
        &self,
        conversation_id: ConversationId,
        limit: u32,
        before: Option<MessageId>,
    ) -> Result<Vec<MessagePayload>, ClientError> {
        if limit == 0 || limit > MAX_PAGE_SIZE {
            return Err(ClientError::InvalidInput(format!(
                "page size must be between 1 and {MAX_PAGE_SIZE}"
            )));
        }

        let mut query = vec![
            ("user_id", self.user_id.0.to_string()),
            ("limit", limit.to_string()),
        ];
        if let Some(before) = before {
            query.push(("before", before.0.to_string()));
        }
        let response = self
            .http
            .get(self.url(&format!("/conversations/{}/messages", conversation_id.0)))
            .query(&query)
            .send()
            .await?;
        let messages: Vec<MessagePayload> = decode(response).await?;

        if before.is_none() {
            let mut cache = self.cache();
            cache.replace_messages(conversation_id, messages.clone());
            cache.set_unread(conversation_id, 0);
        }
        Ok(messages)
    }

    pub async fn send_message(
        &self,
        conversation_id: ConversationId,
        content: &str,
        attachments: Vec<OutgoingAttachment>,
    ) -> Result<SendMessageResponse, ClientError> {
        if content.trim().is_empty() {
            return Err(ClientError::InvalidInput(
                "message content must not be empty".into(),
            ));
        }
        if let Some(unnamed) = attachments.iter().find(|a| a.filename.trim().is_empty()) {
            return Err(ClientError::InvalidInput(format!(
                "attachment of {} bytes has no filename",
                unnamed.bytes.len()
            )));
        }

        let request = SendMessageRequest {
            user_id: self.user_id,
            content: content.to_string(),
            metadata: serde_json::json!({}),
            attachments: attachments
                .into_iter()
                .map(|a| AttachmentUpload {
                    filename: a.filename,
                    mime_type: a.mime_type,
                    data_b64: STANDARD.encode(a.bytes),
                })
                .collect(),
        };
        let response = self
            .http
            .post(self.url(&format!("/conversations/{}/messages", conversation_id.0)))
            .json(&request)
            .send()
            .await?;
        let sent: SendMessageResponse = decode(response).await?;
        self.cache().apply(&ServerEvent::MessageCreated {
            message: sent.message.clone(),
        });
        Ok(sent)
    }

    /// Marks `message_ids` read, or the whole conversation when empty.
    pub async fn mark_read(
        &self,
        conversation_id: ConversationId,
        message_ids: &[MessageId],
    ) -> Result<MarkReadResponse, ClientError> {
        let response = self
            .http
            .post(self.url(&format!("/conversations/{}/read", conversation_id.0)))
            .json(&MarkReadRequest {
                user_id: self.user_id,
                message_ids: message_ids.to_vec(),
            })
            .send()
            .await?;
        decode(response).await
    }

    pub async fn pin_conversation(
        &self,
        conversation_id: ConversationId,
        pinned: bool,
    ) -> Result<(), ClientError> {
        let response = self
            .http
            .put(self.url(&format!("/conversations/{}/pin", conversation_id.0)))
            .json(&PinConversationRequest {
                user_id: self.user_id,
                pinned,
            })
            .send()
            .await?;
        check(response).await?;
        let change = if pinned {
            ConversationChange::Pinned
        } else {
            ConversationChange::Unpinned
        };
        self.cache().apply(&ServerEvent::ConversationUpdated {
            conversation_id,
            change,
        });
        Ok(())
    }

    /// Leaves the conversation. Other participants keep it and its history.
    pub async fn delete_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<(), ClientError> {
        let response = self
            .http
            .delete(self.url(&format!("/conversations/{}", conversation_id.0)))
            .query(&[("user_id", self.user_id.0.to_string())])
            .send()
            .await?;
        check(response).await?;
        self.cache().remove_conversation(conversation_id);
        Ok(())
    }

    pub async fn unread_summary(&self) -> Result<UnreadSummary, ClientError> {
        let response = self
            .http
            .get(self.url("/unread"))
            .query(&[("user_id", self.user_id.0.to_string())])
            .send()
            .await?;
        let summary: UnreadSummary = decode(response).await?;
        let mut cache = self.cache();
        for entry in &summary.conversations {
            cache.set_unread(entry.conversation_id, entry.unread_count);
        }
        Ok(summary)
    }

    pub async fn total_unread(&self) -> Result<u64, ClientError> {
        Ok(self.unread_summary().await?.total)
    }

    /// Downloads an attachment through the signed URL carried in a message payload.
    pub async fn download_attachment(&self, signed_url: &str) -> Result<Vec<u8>, ClientError> {
        let response = self.http.get(signed_url).send().await?;
        let response = check(response).await?;
        Ok(response.bytes().await?.to_vec())
    }

    fn handle_feed_event(self: &Arc<Self>, event: &FeedEvent) {
        let update = match event {
            FeedEvent::StreamDegraded => ClientUpdate::StreamDegraded,
            FeedEvent::StreamRestored => ClientUpdate::StreamRestored,
            FeedEvent::Server(server_event) => {
                let outcome = self.cache().apply(server_event);
                match outcome {
                    CacheUpdate::Applied => ClientUpdate::Event(server_event.clone()),
                    CacheUpdate::Ignored => return,
                    CacheUpdate::NeedsRefetch => {
                        self.spawn_refresh(server_event.conversation_id());
                        return;
                    }
                }
            }
        };
        let _ = self.updates.send(update);
    }

    fn spawn_refresh(self: &Arc<Self>, conversation_id: Option<ConversationId>) {
        {
            let mut cache = self.cache();
            match conversation_id {
                Some(conversation_id) => cache.forget_messages(conversation_id),
                None => cache.clear_messages(),
            }
        }
        let client = Arc::clone(self);
        tokio::spawn(async move {
            let update = match client.list_conversations().await {
                Ok(_) => ClientUpdate::Refreshed,
                Err(err) => {
                    warn!(%err, "failed to reload conversations after drift");
                    ClientUpdate::RefreshFailed(err.to_string())
                }
            };
            let _ = client.updates.send(update);
        });
    }

    fn cache(&self) -> MutexGuard<'_, ConversationCache> {
        lock(&self.cache)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.server_url)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn validate_server_url(server_url: &str) -> Result<String, ClientError> {
    let parsed = url::Url::parse(server_url)
        .map_err(|err| ClientError::InvalidInput(format!("invalid server url: {err}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ClientError::InvalidInput(
            "server_url must start with http:// or https://".into(),
        ));
    }
    Ok(server_url.trim_end_matches('/').to_string())
}

async fn check(response: Response) -> Result<Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await?;
    match serde_json::from_str::<ApiError>(&body) {
        Ok(err) => Err(ClientError::Api(err)),
        Err(_) => Err(ClientError::UnexpectedResponse {
            status: status.as_u16(),
            body,
        }),
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ClientError> {
    Ok(check(response).await?.json().await?)
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
