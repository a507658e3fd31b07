use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{DefaultBodyLimit, Path, Query, State, WebSocketUpgrade},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::IntoResponse,
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::Deserialize;
use server_api::{
    delete_conversation, fetch_object, get_messages, list_conversations, mark_read,
    pin_conversation, resolve_conversation, send_message, unread_summary, ApiContext, EventBus,
};
use shared::{
    domain::{ConversationId, MessageId, UserId},
    error::{ApiError, ErrorCode},
    protocol::{
        ConversationSummary, LoginRequest, LoginResponse, MarkReadRequest, MarkReadResponse,
        MessagePayload, PinConversationRequest, ResolveConversationRequest, ResolvedConversation,
        SendMessageRequest, SendMessageResponse, UnreadSummary,
    },
};
use storage::{DatabaseObjectStore, Storage};
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod app_state;
mod config;

use app_state::AppState;
use config::{load_settings, prepare_database_url};

type HttpError = (StatusCode, Json<ApiError>);

const MAX_USERNAME_BYTES: usize = 64;

#[derive(Debug, Deserialize)]
struct UserQuery {
    user_id: i64,
}

#[derive(Debug, Deserialize)]
struct ListConversationsQuery {
    user_id: i64,
    #[serde(default)]
    pinned_first: bool,
}

#[derive(Debug, Deserialize)]
struct ListMessagesQuery {
    user_id: i64,
    limit: Option<u32>,
    before: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ObjectQuery {
    token: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;

    let objects = Arc::new(DatabaseObjectStore::new(
        storage.clone(),
        settings.public_url(),
        &settings.object_signing_secret,
    ));
    let mut api = ApiContext::new(storage, objects, EventBus::new(settings.event_buffer));
    api.retry = settings.retry_config();
    api.limits = settings.api_limits();

    let app = build_router(Arc::new(AppState { api }), settings.max_request_bytes);

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, public_url = %settings.public_url(), "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        error!(%error, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

fn build_router(state: Arc<AppState>, max_request_bytes: usize) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/login", post(login))
        .route("/conversations", get(http_list_conversations))
        .route("/conversations/resolve", post(http_resolve_conversation))
        .route(
            "/conversations/:conversation_id/messages",
            get(http_get_messages).post(http_send_message),
        )
        .route("/conversations/:conversation_id/read", post(http_mark_read))
        .route("/conversations/:conversation_id/pin", put(http_pin_conversation))
        .route("/conversations/:conversation_id", delete(http_delete_conversation))
        .route("/unread", get(http_unread))
        .route("/objects/*path", get(http_get_object))
        .route("/ws", get(ws_handler))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_request_bytes))
        .with_state(state)
}

fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::ResolutionFailed => StatusCode::CONFLICT,
        ErrorCode::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn http_error(err: ApiError) -> HttpError {
    (status_for(err.code), Json(err))
}

async fn healthz(State(state): State<Arc<AppState>>) -> Result<&'static str, HttpError> {
    state
        .api
        .storage
        .health_check()
        .await
        .map_err(|e| http_error(ApiError::new(ErrorCode::Unavailable, e.to_string())))?;
    Ok("ok")
}

async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, HttpError> {
    let username = req.username.trim();
    if username.is_empty() || username.len() > MAX_USERNAME_BYTES {
        return Err(http_error(ApiError::validation(format!(
            "username must be 1 to {MAX_USERNAME_BYTES} bytes"
        ))));
    }

    let user_id = state
        .api
        .storage
        .create_user(username)
        .await
        .map_err(|e| http_error(ApiError::new(ErrorCode::Internal, e.to_string())))?;
    info!(%user_id, %username, "user logged in");
    Ok(Json(LoginResponse { user_id }))
}

async fn http_list_conversations(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ListConversationsQuery>,
) -> Result<Json<Vec<ConversationSummary>>, HttpError> {
    let conversations = list_conversations(&state.api, UserId(q.user_id), q.pinned_first)
        .await
        .map_err(http_error)?;
    Ok(Json(conversations))
}

async fn http_resolve_conversation(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ResolveConversationRequest>,
) -> Result<(StatusCode, Json<ResolvedConversation>), HttpError> {
    let resolved = resolve_conversation(&state.api, req.user_id, &req.participant_ids)
        .await
        .map_err(http_error)?;
    let status = if resolved.was_created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(resolved)))
}

async fn http_get_messages(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<i64>,
    Query(q): Query<ListMessagesQuery>,
) -> Result<Json<Vec<MessagePayload>>, HttpError> {
    let limit = q.limit.unwrap_or(100);
    let messages = get_messages(
        &state.api,
        UserId(q.user_id),
        ConversationId(conversation_id),
        limit,
        q.before.map(MessageId),
    )
    .await
    .map_err(http_error)?;
    Ok(Json(messages))
}

async fn http_send_message(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<i64>,
    Json(req): Json<SendMessageRequest>,
) -> Result<Json<SendMessageResponse>, HttpError> {
    let response = send_message(
        &state.api,
        req.user_id,
        ConversationId(conversation_id),
        &req.content,
        req.metadata,
        &req.attachments,
    )
    .await
    .map_err(http_error)?;
    Ok(Json(response))
}

async fn http_mark_read(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<i64>,
    Json(req): Json<MarkReadRequest>,
) -> Result<Json<MarkReadResponse>, HttpError> {
    let response = mark_read(
        &state.api,
        req.user_id,
        ConversationId(conversation_id),
        &req.message_ids,
    )
    .await
    .map_err(http_error)?;
    Ok(Json(response))
}

async fn http_pin_conversation(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<i64>,
    Json(req): Json<PinConversationRequest>,
) -> Result<StatusCode, HttpError> {
    pin_conversation(
        &state.api,
        req.user_id,
        ConversationId(conversation_id),
        req.pinned,
    )
    .await
    .map_err(http_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_delete_conversation(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<i64>,
    Query(q): Query<UserQuery>,
) -> Result<StatusCode, HttpError> {
    delete_conversation(&state.api, UserId(q.user_id), ConversationId(conversation_id))
        .await
        .map_err(http_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_unread(
    State(state): State<Arc<AppState>>,
    Query(q): Query<UserQuery>,
) -> Result<Json<UnreadSummary>, HttpError> {
    let summary = unread_summary(&state.api, UserId(q.user_id))
        .await
        .map_err(http_error)?;
    Ok(Json(summary))
}

async fn http_get_object(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
    Query(q): Query<ObjectQuery>,
) -> Result<impl IntoResponse, HttpError> {
    let object = fetch_object(&state.api, &path, &q.token)
        .await
        .map_err(http_error)?;

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&object.content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("private, max-age=300"),
    );
    Ok((StatusCode::OK, headers, object.bytes))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(q): Query<UserQuery>,
) -> Result<impl IntoResponse, HttpError> {
    let user_id = UserId(q.user_id);
    let known = state
        .api
        .storage
        .existing_users(&[user_id])
        .await
        .map_err(|e| http_error(ApiError::new(ErrorCode::Internal, e.to_string())))?;
    if known.is_empty() {
        return Err(http_error(ApiError::not_found("user not found")));
    }
    Ok(ws.on_upgrade(move |socket| ws_connection(state, socket, user_id)))
}

async fn ws_connection(
    state: Arc<AppState>,
    socket: axum::extract::ws::WebSocket,
    user_id: UserId,
) {
    use axum::extract::ws::Message;
    use futures::{SinkExt, StreamExt};

    let (mut sender, mut receiver) = socket.split();
    let mut feed = state.api.events.subscribe(user_id);
    info!(%user_id, "event stream connected");

    let send_task = tokio::spawn(async move {
        while let Some(event) = feed.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = receiver.next().await {
        if matches!(msg, Message::Close(_)) {
            break;
        }
    }

    send_task.abort();
    info!(%user_id, "event stream closed");
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
