use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use server_api::{ApiContext, EventBus};
use shared::domain::{ConversationId, UserId};
use storage::{DatabaseObjectStore, Storage};
use tracing_subscriber::EnvFilter;

/// Operator commands that act on the chat database directly, without a running server.
#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://./data/server.db")]
    database_url: String,
    /// Base URL written into attachment links.
    #[arg(long, default_value = "http://127.0.0.1:8443")]
    public_url: String,
    #[arg(long, default_value = "dev-object-signing-secret")]
    object_signing_secret: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    CreateUser {
        username: String,
        #[arg(long)]
        display_name: Option<String>,
    },
    /// Finds or creates the conversation between `user_id` and `with`.
    Resolve {
        user_id: i64,
        #[arg(long = "with", required = true, num_args = 1..)]
        with: Vec<i64>,
    },
    Send {
        user_id: i64,
        conversation_id: i64,
        content: String,
    },
    List {
        user_id: i64,
    },
    Messages {
        user_id: i64,
        conversation_id: i64,
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    Unread {
        user_id: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();
    let cli = Cli::parse();

    let storage = Storage::new(&cli.database_url).await?;
    let objects = Arc::new(DatabaseObjectStore::new(
        storage.clone(),
        &cli.public_url,
        &cli.object_signing_secret,
    ));
    let ctx = ApiContext::new(storage.clone(), objects, EventBus::new(16));

    match cli.command {
        Command::CreateUser {
            username,
            display_name,
        } => {
            let user_id = storage.create_user(username.trim()).await?;
            if display_name.is_some() {
                storage
                    .update_profile(user_id, display_name.as_deref(), None)
                    .await?;
            }
            println!("user_id={user_id}");
        }
        Command::Resolve { user_id, with } => {
            let others: Vec<UserId> = with.into_iter().map(UserId).collect();
            let resolved = server_api::resolve_conversation(&ctx, UserId(user_id), &others)
                .await?;
            println!(
                "conversation_id={} created={}",
                resolved.conversation_id, resolved.was_created
            );
        }
        Command::Send {
            user_id,
            conversation_id,
            content,
        } => {
            let sent = server_api::send_message(
                &ctx,
                UserId(user_id),
                ConversationId(conversation_id),
                &content,
                serde_json::Value::Null,
                &[],
            )
            .await?;
            println!("message_id={}", sent.message.message_id);
        }
        Command::List { user_id } => {
            let conversations = server_api::list_conversations(&ctx, UserId(user_id), true)
                .await?;
            println!("{}", serde_json::to_string_pretty(&conversations)?);
        }
        Command::Messages {
            user_id,
            conversation_id,
            limit,
        } => {
            let messages = server_api::get_messages(
                &ctx,
                UserId(user_id),
                ConversationId(conversation_id),
                limit,
                None,
            )
            .await?;
            for message in messages {
                println!(
                    "[{}] {} #{}: {}",
                    message.sent_at.to_rfc3339(),
                    message.sender_id,
                    message.message_id,
                    message.content
                );
            }
        }
        Command::Unread { user_id } => {
            let summary = server_api::unread_summary(&ctx, UserId(user_id))
                .await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }

    Ok(())
}
