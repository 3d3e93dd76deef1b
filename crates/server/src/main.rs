use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use server_api::ApiContext;
use shared::{
    domain::ChatId,
    error::{ApiError, ErrorCode},
    protocol::{
        ClientEvent, CreateChatRequest, CreateChatResponse, HistoryResponse, JoinChatRequest,
        JoinChatResponse, ListChatsResponse, PendingInvitationsResponse, RespondInviteRequest,
        SendInviteRequest, ServerEvent,
    },
};
use storage::Storage;
use tracing::{debug, error, info};
use uuid::Uuid;

mod auth;
mod config;
mod relay;

use auth::AuthUser;
use config::{load_settings, prepare_database_url};
use relay::RoomRelay;

#[derive(Clone)]
struct AppState {
    api: ApiContext,
    relay: RoomRelay,
    jwt_secret: String,
}

// Raw strings so malformed values reach the handler and map onto the
// serialized error envelope instead of the extractor's plain-text rejection.
#[derive(Debug, Deserialize)]
struct HistoryQuery {
    skip: Option<String>,
    limit: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

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
    let api = ApiContext { storage };
    let relay = RoomRelay::new(api.clone());

    let state = AppState {
        api,
        relay,
        jwt_secret: settings.jwt_secret,
    };
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/chats", post(http_create_chat).get(http_list_chats))
        .route("/chats/join", post(http_join_chat))
        .route("/chats/:chat_id/messages", get(http_message_history))
        .route("/invitations", post(http_send_invite))
        .route("/invitations/respond", post(http_respond_invite))
        .route("/invitations/pending", get(http_pending_invitations))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn http_create_chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CreateChatRequest>,
) -> Result<Json<CreateChatResponse>, (StatusCode, Json<ApiError>)> {
    let user = authed(&state, &headers)?;
    let chat_id = server_api::create_chat(
        &state.api,
        &user.user_id,
        req.members,
        req.invite,
        req.is_private,
        req.pub_key.as_deref(),
    )
    .await
    .map_err(reject)?;
    Ok(Json(CreateChatResponse { chat_id }))
}

async fn http_join_chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<JoinChatRequest>,
) -> Result<Json<JoinChatResponse>, (StatusCode, Json<ApiError>)> {
    let user = authed(&state, &headers)?;
    server_api::join_chat(&state.api, &user.user_id, req.chat_id, req.pub_key.as_deref())
        .await
        .map_err(reject)?;
    Ok(Json(JoinChatResponse { success: true }))
}

async fn http_list_chats(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<ListChatsResponse>, (StatusCode, Json<ApiError>)> {
    let user = authed(&state, &headers)?;
    let listed = server_api::list_chats(&state.api, &user.user_id)
        .await
        .map_err(reject)?;
    Ok(Json(listed))
}

async fn http_message_history(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(chat_id): Path<Uuid>,
    Query(q): Query<HistoryQuery>,
) -> Result<Json<HistoryResponse>, (StatusCode, Json<ApiError>)> {
    let user = authed(&state, &headers)?;
    let (Some(skip), Some(limit)) = (q.skip, q.limit) else {
        return Err(reject(ApiError::new(
            ErrorCode::Validation,
            "skip and limit are required",
        )));
    };
    let (Ok(skip), Ok(limit)) = (skip.parse::<i64>(), limit.parse::<i64>()) else {
        return Err(reject(ApiError::new(
            ErrorCode::Validation,
            "skip and limit must be integers",
        )));
    };
    let messages =
        server_api::message_history(&state.api, &user.user_id, ChatId(chat_id), skip, limit)
            .await
            .map_err(reject)?;
    Ok(Json(HistoryResponse { messages }))
}

async fn http_send_invite(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<SendInviteRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<ApiError>)> {
    let user = authed(&state, &headers)?;
    let invitation =
        server_api::send_invite(&state.api, &user.user_id, &req.receiver_id, req.chat_id)
            .await
            .map_err(reject)?;
    Ok(Json(invitation))
}

async fn http_respond_invite(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<RespondInviteRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<ApiError>)> {
    let user = authed(&state, &headers)?;
    let invitation = server_api::respond_invitation(
        &state.api,
        &user.user_id,
        req.invitation_id,
        req.decision,
    )
    .await
    .map_err(reject)?;
    Ok(Json(invitation))
}

async fn http_pending_invitations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<PendingInvitationsResponse>, (StatusCode, Json<ApiError>)> {
    let user = authed(&state, &headers)?;
    let notifications = server_api::list_pending_invitations(&state.api, &user.user_id)
        .await
        .map_err(reject)?;
    Ok(Json(PendingInvitationsResponse { notifications }))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(q): Query<WsQuery>,
) -> Result<impl IntoResponse, (StatusCode, Json<ApiError>)> {
    let user = auth::verify_token(&state.jwt_secret, &q.token).map_err(reject)?;
    Ok(ws.on_upgrade(move |socket| ws_connection(state, socket, user)))
}

async fn ws_connection(
    state: Arc<AppState>,
    socket: axum::extract::ws::WebSocket,
    user: AuthUser,
) {
    use axum::extract::ws::Message;
    use futures::{SinkExt, StreamExt};

    let (session, mut events_rx) = state.relay.connect();
    let (mut sender, mut receiver) = socket.split();

    let send_task = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
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
        let Message::Text(text) = msg else {
            continue;
        };
        match serde_json::from_str::<ClientEvent>(&text) {
            Ok(ClientEvent::JoinRoom { chat_id }) => {
                match server_api::ensure_participant(&state.api, &user.user_id, chat_id).await {
                    Ok(()) => state.relay.subscribe(session, chat_id),
                    Err(error) => state.relay.send_to(session, ServerEvent::Error(error)),
                }
            }
            Ok(ClientEvent::SendMessage { chat_id, text, iv }) => {
                match server_api::ensure_participant(&state.api, &user.user_id, chat_id).await {
                    Ok(()) => state.relay.publish(chat_id, &user.user_id, &text, iv.as_deref()),
                    Err(error) => state.relay.send_to(session, ServerEvent::Error(error)),
                }
            }
            Err(_) => {
                // Malformed live events are dropped, not surfaced.
                debug!(user_id = %user.user_id, "dropping malformed live event");
            }
        }
    }

    state.relay.disconnect(session);
    send_task.abort();
}

fn authed(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<AuthUser, (StatusCode, Json<ApiError>)> {
    auth::bearer_user(&state.jwt_secret, headers).map_err(reject)
}

fn reject(error: ApiError) -> (StatusCode, Json<ApiError>) {
    let status = match error.code {
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::InvalidTransition => StatusCode::CONFLICT,
        ErrorCode::StoreUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(error))
}
