use super::*;
use std::time::Duration;

use axum::{
    extract::ws::{Message, WebSocketUpgrade},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use shared::error::ErrorCode;
use tokio::net::TcpListener;

const ME: UserId = UserId(1);
const BOB: UserId = UserId(2);
const CONV: ConversationId = ConversationId(7);

async fn serve(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn offline_client() -> Arc<ConversationClient> {
    let url = "http://127.0.0.1:9";
    let multiplexer = SubscriptionMultiplexer::websocket(url, MultiplexerConfig::default()).unwrap();
    ConversationClient::new(url, ME, multiplexer).unwrap()
}

fn incoming() -> MessagePayload {
    MessagePayload {
        message_id: MessageId(1),
        conversation_id: CONV,
        sender_id: BOB,
        content: "hello".into(),
        sent_at: Utc::now(),
        is_read: false,
        metadata: serde_json::json!({}),
        attachments: Vec::new(),
    }
}

fn summary() -> ConversationSummary {
    ConversationSummary {
        conversation_id: CONV,
        participants: Vec::new(),
        last_message: None,
        unread_count: 0,
        pinned: false,
        last_activity_at: Utc::now() - chrono::Duration::minutes(1),
    }
}

async fn stub_ws(ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(|mut socket| async move {
        let event = ServerEvent::MessageCreated {
            message: incoming(),
        };
        let text = serde_json::to_string(&event).unwrap();
        if socket.send(Message::Text(text)).await.is_ok() {
            while let Some(Ok(_)) = socket.recv().await {}
        }
    })
}

fn stub_server() -> Router {
    Router::new()
        .route("/conversations", get(|| async { Json(vec![summary()]) }))
        .route(
            "/conversations/resolve",
            post(|| async {
                (
                    StatusCode::CREATED,
                    Json(ResolvedConversation {
                        conversation_id: CONV,
                        was_created: true,
                    }),
                )
            }),
        )
        .route(
            "/conversations/:conversation_id/messages",
            post(|| async {
                (
                    StatusCode::FORBIDDEN,
                    Json(ApiError::forbidden("not a participant")),
                )
            }),
        )
        .route("/ws", get(stub_ws))
}

#[tokio::test]
async fn rejects_bad_input_before_any_request() {
    let client = offline_client();

    for others in [vec![], vec![ME]] {
        let err = client.open_conversation(&others).await.unwrap_err();
        assert!(matches!(err, ClientError::InvalidInput(_)), "{err}");
    }
    let err = client
        .send_message(CONV, "   ", Vec::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::InvalidInput(_)));
    let err = client.get_messages(CONV, 0, None).await.unwrap_err();
    assert!(matches!(err, ClientError::InvalidInput(_)));
    assert!(!client.is_subscribed());

    let multiplexer =
        SubscriptionMultiplexer::websocket("http://127.0.0.1:9", MultiplexerConfig::default())
            .unwrap();
    assert!(matches!(
        ConversationClient::new("ftp://example.com", ME, multiplexer.clone()),
        Err(ClientError::InvalidInput(_))
    ));
    assert!(matches!(
        ConversationClient::login("http://127.0.0.1:9", "  ", multiplexer).await,
        Err(ClientError::InvalidInput(_))
    ));
}

#[tokio::test]
async fn unreachable_server_is_a_retryable_transport_error() {
    let client = offline_client();
    let err = client.list_conversations().await.unwrap_err();
    assert!(matches!(err, ClientError::Transport(_)));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn realtime_message_updates_cached_unread() {
    let url = serve(stub_server()).await;
    let multiplexer = SubscriptionMultiplexer::websocket(&url, MultiplexerConfig::default()).unwrap();
    let client = ConversationClient::new(&url, ME, multiplexer.clone()).unwrap();

    client.list_conversations().await.unwrap();
    let mut updates = client.subscribe_updates();
    let resolved = client.open_conversation(&[BOB, ME]).await.unwrap();
    assert_eq!(resolved.conversation_id, CONV);
    assert!(client.is_subscribed());

    let update = tokio::time::timeout(Duration::from_secs(5), updates.recv())
        .await
        .expect("no realtime update")
        .unwrap();
    assert!(matches!(
        update,
        ClientUpdate::Event(ServerEvent::MessageCreated { ref message }) if message.content == "hello"
    ));
    assert_eq!(client.cached_unread(), 1);
    let preview = client.cached_conversations()[0].last_message.clone().unwrap();
    assert_eq!(preview.sender_id, BOB);

    // A second open shares the same subscription.
    client.open_conversation(&[BOB]).await.unwrap();
    assert_eq!(multiplexer.ref_count(ME), 1);

    client.close();
    assert!(!client.is_subscribed());
    assert_eq!(multiplexer.ref_count(ME), 0);
}

#[tokio::test]
async fn server_errors_surface_as_api_errors() {
    let url = serve(stub_server()).await;
    let multiplexer = SubscriptionMultiplexer::websocket(&url, MultiplexerConfig::default()).unwrap();
    let client = ConversationClient::new(&url, ME, multiplexer).unwrap();

    let err = client
        .send_message(ConversationId(8), "hi", Vec::new())
        .await
        .unwrap_err();
    match err {
        ClientError::Api(api) => assert_eq!(api.code, ErrorCode::Forbidden),
        other => panic!("unexpected error: {other}"),
    }

    let err = client.total_unread().await.unwrap_err();
    assert!(matches!(
        err,
        ClientError::UnexpectedResponse { status: 404, .. }
    ));
}
