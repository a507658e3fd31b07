use std::{path::Path, sync::Arc};

use anyhow::{anyhow, bail, Result};
use clap::Parser;
use client_core::{
    ClientUpdate, ConversationClient, MultiplexerConfig, OutgoingAttachment,
    SubscriptionMultiplexer, DEFAULT_PAGE_SIZE,
};
use shared::{
    domain::{ConversationId, UserId},
    protocol::{DeliveryStatus, MessagePayload, ServerEvent},
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value = "http://127.0.0.1:8443")]
    server_url: String,
    #[arg(long)]
    username: String,
}

const HELP: &str = "\
/list                     conversations, pinned first
/open <user_id>...        open the conversation with these users
/more                     load older messages
/read                     mark the open conversation read
/pin, /unpin              pin state of the open conversation
/leave                    leave the open conversation
/attach <path> <text>     send a message with a file attached
/unread                   total unread messages
/quit
anything else is sent to the open conversation";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();
    let args = Args::parse();

    let multiplexer = SubscriptionMultiplexer::websocket(&args.server_url, MultiplexerConfig::default())?;
    let client = ConversationClient::login(&args.server_url, &args.username, multiplexer).await?;
    println!("logged in as user_id={}", client.user_id());
    client.subscribe();
    print_updates(&client);

    let mut session = Session {
        client,
        current: None,
        oldest: None,
    };
    println!("{HELP}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" {
            break;
        }
        if let Err(err) = session.handle(line).await {
            println!("error: {err}");
        }
    }

    session.client.close();
    Ok(())
}

fn print_updates(client: &Arc<ConversationClient>) {
    let me = client.user_id();
    client.on_update(move |update| match update {
        ClientUpdate::Event(ServerEvent::MessageCreated { message }) if message.sender_id != me => {
            print_message(&message);
        }
        ClientUpdate::Event(_) => {}
        ClientUpdate::Refreshed => println!("(conversations reloaded)"),
        ClientUpdate::RefreshFailed(reason) => warn!(%reason, "reload failed"),
        ClientUpdate::StreamDegraded => println!("(realtime updates paused, reconnecting)"),
        ClientUpdate::StreamRestored => println!("(realtime updates restored)"),
    });
}

fn print_message(message: &MessagePayload) {
    println!(
        "[{}] #{} user {}: {}",
        message.conversation_id, message.message_id, message.sender_id, message.content
    );
    for attachment in &message.attachments {
        println!("    attachment {} ({} bytes) {}", attachment.filename, attachment.size_bytes, attachment.url);
    }
}

struct Session {
    client: Arc<ConversationClient>,
    current: Option<ConversationId>,
    oldest: Option<MessagePayload>,
}

impl Session {
    fn current(&self) -> Result<ConversationId> {
        self.current
            .ok_or_else(|| anyhow!("no open conversation; use /open <user_id>"))
    }

    async fn handle(&mut self, line: &str) -> Result<()> {
        let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
        match command {
            "/help" => println!("{HELP}"),
            "/list" => {
                for summary in self.client.list_conversations().await? {
                    let names: Vec<&str> = summary.participants.iter().map(|p| p.label()).collect();
                    let preview = summary
                        .last_message
                        .as_ref()
                        .map(|m| m.content.as_str())
                        .unwrap_or("");
                    println!(
                        "{}{} [{}] unread={} {}",
                        if summary.pinned { "* " } else { "  " },
                        summary.conversation_id,
                        names.join(", "),
                        summary.unread_count,
                        preview
                    );
                }
            }
            "/open" => {
                let ids = rest
                    .split_whitespace()
                    .map(|raw| raw.parse::<i64>().map(UserId))
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|_| anyhow!("user ids must be numbers"))?;
                let resolved = self.client.open_conversation(&ids).await?;
                self.current = Some(resolved.conversation_id);
                let page = self
                    .client
                    .get_messages(resolved.conversation_id, DEFAULT_PAGE_SIZE, None)
                    .await?;
                println!(
                    "opened conversation {}{}",
                    resolved.conversation_id,
                    if resolved.was_created { " (new)" } else { "" }
                );
                page.iter().for_each(print_message);
                self.oldest = page.into_iter().next();
            }
            "/more" => {
                let conversation_id = self.current()?;
                let before = self.oldest.as_ref().map(|m| m.message_id);
                if before.is_none() {
                    bail!("nothing older to load");
                }
                let page = self
                    .client
                    .get_messages(conversation_id, DEFAULT_PAGE_SIZE, before)
                    .await?;
                if page.is_empty() {
                    println!("(start of conversation)");
                }
                page.iter().for_each(print_message);
                if let Some(first) = page.into_iter().next() {
                    self.oldest = Some(first);
                }
            }
            "/read" => {
                let marked = self.client.mark_read(self.current()?, &[]).await?.marked;
                println!("marked {marked} message(s) read");
            }
            "/pin" | "/unpin" => {
                self.client
                    .pin_conversation(self.current()?, command == "/pin")
                    .await?;
            }
            "/leave" => {
                self.client.delete_conversation(self.current()?).await?;
                self.current = None;
                self.oldest = None;
            }
            "/unread" => println!("unread: {}", self.client.total_unread().await?),
            "/attach" => {
                let (path, text) = rest.split_once(' ').unwrap_or((rest, ""));
                let bytes = tokio::fs::read(path).await?;
                let filename = Path::new(path)
                    .file_name()
                    .and_then(|n| n.to_str())
                    .ok_or_else(|| anyhow!("'{path}' has no file name"))?
                    .to_string();
                let content = if text.trim().is_empty() { filename.as_str() } else { text };
                let attachment = OutgoingAttachment {
                    filename: filename.clone(),
                    mime_type: None,
                    bytes,
                };
                self.send(content, vec![attachment]).await?;
            }
            _ if command.starts_with('/') => bail!("unknown command {command}; try /help"),
            _ => self.send(line, Vec::new()).await?,
        }
        Ok(())
    }

    async fn send(&self, content: &str, attachments: Vec<OutgoingAttachment>) -> Result<()> {
        let sent = self
            .client
            .send_message(self.current()?, content, attachments)
            .await?;
        if sent.status == DeliveryStatus::PartialFailure {
            for failure in &sent.failed_attachments {
                println!("attachment {} was dropped: {}", failure.filename, failure.reason);
            }
        }
        print_message(&sent.message);
        Ok(())
    }
}
