use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use auth::{AuthConfig, AuthError, Authenticator};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        FromRequestParts, Path, Query, State, WebSocketUpgrade,
    },
    http::{header, request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use server_api::{
    ledger::PageRequest, membership, ApiContext, ChatError, ConnectionHandle, ConnectionId,
    Identity, Session,
};
use shared::{
    domain::{ChatId, PublicUser, UserId},
    error::{ApiError, ErrorCode},
    protocol::{
        AddParticipantsRequest, ChatDetail, ChatSummary, CreateChatRequest, CreateChatResponse,
        PublicKeyResponse, UserProfile,
    },
};
use storage::Storage;
use tokio::sync::Mutex;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

mod config;

use config::{load_settings, prepare_database_url, Settings, DEV_JWT_SECRET};

const MAX_BODY_BYTES: usize = 1024 * 1024;

#[derive(Clone)]
struct AppState {
    api: ApiContext,
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    username: String,
    email: String,
    password: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct RegisterResponse {
    user_id: UserId,
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    email: String,
    password: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct LoginResponse {
    token: String,
}

#[derive(Debug, Deserialize)]
struct SaveKeyRequest {
    public_key: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct AddParticipantsResponse {
    added: Vec<UserId>,
}

/// Raw strings so malformed values fall back to defaults instead of rejecting.
#[derive(Debug, Deserialize)]
struct ChatPageQuery {
    page: Option<String>,
    limit: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchQuery {
    #[serde(default)]
    q: String,
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: Option<String>,
}

/// [`ApiError`] rendered with the matching HTTP status.
#[derive(Debug)]
struct HttpError(ApiError);

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        (status_for(self.0.code), Json(self.0)).into_response()
    }
}

impl From<ApiError> for HttpError {
    fn from(err: ApiError) -> Self {
        Self(err)
    }
}

impl From<ChatError> for HttpError {
    fn from(err: ChatError) -> Self {
        Self(err.into())
    }
}

impl From<AuthError> for HttpError {
    fn from(err: AuthError) -> Self {
        if let AuthError::Internal(source) = &err {
            error!(error = %format!("{source:#}"), "auth failure");
            return Self(ApiError::internal("internal server error"));
        }
        Self(err.into())
    }
}

type HttpResult<T> = Result<T, HttpError>;

fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Conflict => StatusCode::CONFLICT,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Locked => StatusCode::LOCKED,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Caller identity from `Authorization: Bearer <token>`.
struct AuthUser(Identity);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = HttpError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| {
                HttpError(ApiError::new(
                    ErrorCode::Unauthorized,
                    "missing bearer token",
                ))
            })?;
        Ok(Self(state.api.auth.verify(token)?))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let settings = load_settings();
    if settings.jwt_secret == DEV_JWT_SECRET {
        warn!("using the built-in development JWT secret; set APP__JWT_SECRET");
    }
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;

    let api = build_context(storage, &settings);
    let app = build_router(Arc::new(AppState { api }));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("server stopped");
    Ok(())
}

fn build_context(storage: Storage, settings: &Settings) -> ApiContext {
    let auth = Authenticator::new(
        storage.clone(),
        AuthConfig {
            jwt_secret: settings.jwt_secret.clone(),
            token_ttl: chrono::Duration::hours(settings.token_ttl_hours),
            max_failed_attempts: settings.max_failed_logins,
            lockout: chrono::Duration::minutes(settings.lockout_minutes),
        },
    );
    ApiContext::new(storage, auth, settings.ws_write_timeout())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        error!(%error, "failed to listen for shutdown signal");
        return;
    }
    info!("shutdown requested");
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/register", post(register))
        .route("/login", post(login))
        .route("/api/profile", get(http_profile))
        .route("/api/chats", post(http_create_chat).get(http_list_chats))
        .route("/api/chats/:chat_id", get(http_get_chat))
        .route("/api/chats/:chat_id/participants", post(http_add_participants))
        .route(
            "/api/chats/:chat_id/participants/:user_id",
            delete(http_remove_participant),
        )
        .route("/api/users/search", get(http_search_users))
        .route("/api/users/:user_id/public_key", get(http_public_key))
        .route("/api/keys", post(http_save_key))
        .route("/ws", get(ws_handler))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .with_state(state)
}

async fn healthz(State(state): State<Arc<AppState>>) -> Response {
    match state.api.storage.health_check().await {
        Ok(()) => "ok".into_response(),
        Err(error) => {
            error!(error = %format!("{error:#}"), "health check failed");
            (StatusCode::SERVICE_UNAVAILABLE, "storage unavailable").into_response()
        }
    }
}

async fn register(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterRequest>,
) -> HttpResult<(StatusCode, Json<RegisterResponse>)> {
    let user_id = state
        .api
        .auth
        .register(&req.username, &req.email, &req.password)
        .await?;
    Ok((StatusCode::CREATED, Json(RegisterResponse { user_id })))
}

async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> HttpResult<Json<LoginResponse>> {
    let token = state.api.auth.authenticate(&req.email, &req.password).await?;
    Ok(Json(LoginResponse { token }))
}

async fn http_profile(
    State(state): State<Arc<AppState>>,
    AuthUser(me): AuthUser,
) -> HttpResult<Json<UserProfile>> {
    Ok(Json(server_api::profile(&state.api, me.user_id).await?))
}

async fn http_create_chat(
    State(state): State<Arc<AppState>>,
    AuthUser(me): AuthUser,
    Json(req): Json<CreateChatRequest>,
) -> HttpResult<(StatusCode, Json<CreateChatResponse>)> {
    let created = membership::create_chat(&state.api, &me, req).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn http_list_chats(
    State(state): State<Arc<AppState>>,
    AuthUser(me): AuthUser,
) -> HttpResult<Json<Vec<ChatSummary>>> {
    Ok(Json(membership::list_chats_for(&state.api, me.user_id).await?))
}

async fn http_get_chat(
    State(state): State<Arc<AppState>>,
    AuthUser(me): AuthUser,
    Path(chat_id): Path<i64>,
    Query(q): Query<ChatPageQuery>,
) -> HttpResult<Json<ChatDetail>> {
    let page = PageRequest::from_query(
        q.page.and_then(|v| v.parse().ok()),
        q.limit.and_then(|v| v.parse().ok()),
    );
    let detail = membership::get_chat(&state.api, me.user_id, ChatId(chat_id), page).await?;
    Ok(Json(detail))
}

async fn http_add_participants(
    State(state): State<Arc<AppState>>,
    AuthUser(me): AuthUser,
    Path(chat_id): Path<i64>,
    Json(req): Json<AddParticipantsRequest>,
) -> HttpResult<(StatusCode, Json<AddParticipantsResponse>)> {
    let added =
        membership::add_participants(&state.api, me.user_id, ChatId(chat_id), &req.participants)
            .await?;
    Ok((StatusCode::CREATED, Json(AddParticipantsResponse { added })))
}

async fn http_remove_participant(
    State(state): State<Arc<AppState>>,
    AuthUser(me): AuthUser,
    Path((chat_id, user_id)): Path<(i64, i64)>,
) -> HttpResult<StatusCode> {
    membership::remove_participant(&state.api, me.user_id, ChatId(chat_id), UserId(user_id))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_search_users(
    State(state): State<Arc<AppState>>,
    AuthUser(_me): AuthUser,
    Query(q): Query<SearchQuery>,
) -> HttpResult<Json<Vec<PublicUser>>> {
    Ok(Json(server_api::search_users(&state.api, &q.q).await?))
}

async fn http_public_key(
    State(state): State<Arc<AppState>>,
    AuthUser(_me): AuthUser,
    Path(user_id): Path<i64>,
) -> HttpResult<Json<PublicKeyResponse>> {
    let key = server_api::public_key_for(&state.api, UserId(user_id)).await?;
    Ok(Json(key))
}

async fn http_save_key(
    State(state): State<Arc<AppState>>,
    AuthUser(me): AuthUser,
    Json(req): Json<SaveKeyRequest>,
) -> HttpResult<StatusCode> {
    server_api::save_public_key(&state.api, me.user_id, &req.public_key).await?;
    Ok(StatusCode::CREATED)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(q): Query<WsQuery>,
) -> HttpResult<Response> {
    let token = q
        .token
        .filter(|t| !t.is_empty())
        .ok_or_else(|| HttpError(ApiError::new(ErrorCode::Unauthorized, "missing token")))?;
    let identity = state.api.auth.verify(&token)?;
    Ok(ws.on_upgrade(move |socket| ws_connection(state, socket, identity)))
}

/// Write half of an upgraded socket, shared between the session and the dispatcher.
struct WsHandle {
    id: ConnectionId,
    sink: Mutex<SplitSink<WebSocket, Message>>,
}

#[async_trait]
impl ConnectionHandle for WsHandle {
    fn connection_id(&self) -> ConnectionId {
        self.id
    }

    async fn send_text(&self, text: String) -> anyhow::Result<()> {
        self.sink.lock().await.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn close(&self) {
        if let Err(error) = self.sink.lock().await.close().await {
            debug!(connection_id = %self.id, %error, "websocket already closed");
        }
    }
}

async fn ws_connection(state: Arc<AppState>, socket: WebSocket, identity: Identity) {
    let (sender, mut receiver) = socket.split();
    let handle = Arc::new(WsHandle {
        id: ConnectionId::new(),
        sink: Mutex::new(sender),
    });
    let session = Session::open(state.api.clone(), identity, handle);

    while let Some(frame) = receiver.next().await {
        match frame {
            Ok(Message::Text(text)) => session.dispatch(&text).await,
            Ok(Message::Close(_)) => break,
            Ok(Message::Binary(_)) => {
                debug!(user_id = %session.identity().user_id, "ignoring binary frame");
            }
            Ok(_) => {}
            Err(error) => {
                debug!(user_id = %session.identity().user_id, %error, "websocket read failed");
                break;
            }
        }
    }

    session.close().await;
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
