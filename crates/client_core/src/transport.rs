use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{stream, StreamExt};
use shared::{domain::UserId, protocol::ServerEvent};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

use crate::multiplexer::{
    EventStream, EventStreamConnector, MultiplexerConfig, SubscriptionMultiplexer,
};

/// Opens `/ws?user_id=…` on the chat server and decodes each text frame as a
/// [`ServerEvent`].
#[derive(Debug, Clone)]
pub struct WsEventStreamConnector {
    ws_base: String,
}

impl WsEventStreamConnector {
    pub fn new(server_url: &str) -> Result<Self> {
        Ok(Self {
            ws_base: websocket_base(server_url)?,
        })
    }

    pub fn url_for(&self, user_id: UserId) -> String {
        format!("{}/ws?user_id={}", self.ws_base, user_id.0)
    }
}

impl SubscriptionMultiplexer {
    /// Multiplexer whose streams are websockets to `server_url`.
    pub fn websocket(server_url: &str, config: MultiplexerConfig) -> Result<Self> {
        let connector = WsEventStreamConnector::new(server_url)?;
        Ok(Self::new(Arc::new(connector), config))
    }
}

pub(crate) fn websocket_base(server_url: &str) -> Result<String> {
    let server_url = server_url.trim_end_matches('/');
    if let Some(rest) = server_url.strip_prefix("https://") {
        Ok(format!("wss://{rest}"))
    } else if let Some(rest) = server_url.strip_prefix("http://") {
        Ok(format!("ws://{rest}"))
    } else {
        Err(anyhow!("server_url must start with http:// or https://"))
    }
}

#[async_trait]
impl EventStreamConnector for WsEventStreamConnector {
    async fn connect(&self, user_id: UserId) -> Result<EventStream> {
        let ws_url = self.url_for(user_id);
        let (ws_stream, _) = connect_async(&ws_url)
            .await
            .with_context(|| format!("failed to connect websocket: {ws_url}"))?;
        debug!(%user_id, "websocket connected");

        let events = stream::unfold(ws_stream, |mut ws_stream| async move {
            loop {
                match ws_stream.next().await? {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerEvent>(&text) {
                        Ok(event) => return Some((Ok(event), ws_stream)),
                        Err(err) => warn!(%err, "skipping undecodable server event"),
                    },
                    Ok(Message::Close(_)) => return None,
                    Ok(_) => {}
                    Err(err) => {
                        return Some((
                            Err(anyhow::Error::new(err).context("websocket read failed")),
                            ws_stream,
                        ))
                    }
                }
            }
        });
        Ok(events.boxed())
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
