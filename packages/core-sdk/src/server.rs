use std::{path::PathBuf, sync::Arc};

use anyhow::Result;
use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, Any, CorsLayer};
use tower_http::services::ServeDir;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    chat::{ChatService, ChatTurn},
    config::{AppConfig, AuthConfig},
    error::ChatError,
    models::{now_timestamp, Message, Role, Session, SessionPatch, NEW_SESSION_TITLE},
    payload::UPLOADS_PREFIX,
    providers::ProviderCatalog,
};

type ApiError = (StatusCode, Json<Value>);
type ApiResult<T> = Result<Json<T>, ApiError>;

/**
 * \brief 请求处理器共享的状态，启动时构建后注入路由。
 */
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ChatService>,
    pub auth: Arc<AuthConfig>,
    pub upload_dir: PathBuf,
}

impl AppState {
    pub fn new(service: Arc<ChatService>, config: &AppConfig) -> Self {
        Self {
            service,
            auth: Arc::new(config.auth.clone()),
            upload_dir: config.upload_dir.clone(),
        }
    }
}

/**
 * \brief 启动 HTTP 服务，Ctrl-C 时优雅退出。
 */
pub async fn run(config: AppConfig) -> Result<()> {
    let service = Arc::new(ChatService::from_config(&config)?);
    let app = router(AppState::new(service, &config), &config);

    if config.local_attachments {
        warn!("local attachment paths are enabled for HTTP clients");
    }
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!(
        auth = config.auth.enabled,
        "server listening on http://{}", config.bind_addr
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
    }
}

/**
 * \brief 组装路由：会话、消息、对话、配置发现、上传与静态文件。
 */
pub fn router(state: AppState, config: &AppConfig) -> Router {
    let uploads = ServeDir::new(&state.upload_dir);

    Router::new()
        .route("/", get(root))
        .route("/sessions", get(list_sessions).post(create_session))
        .route(
            "/sessions/{id}",
            get(get_session).put(update_session).delete(delete_session),
        )
        .route(
            "/sessions/{id}/messages",
            post(add_message).delete(clear_messages),
        )
        .route(
            "/sessions/{id}/messages/{index}",
            put(edit_message).delete(delete_message),
        )
        .route("/chat", post(chat))
        .route("/config", get(get_config))
        .route("/upload", post(upload_file))
        .nest_service("/uploads", uploads)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_basic_auth,
        ))
        .layer(DefaultBodyLimit::max(config.max_upload_bytes))
        .with_state(state)
        .layer(cors_layer(&config.cors_origins))
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.iter().any(|o| o == "*") {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
    }
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
}

async fn require_basic_auth(State(state): State<AppState>, req: Request, next: Next) -> Response {
    if !state.auth.enabled || is_authorized(&state.auth, req.headers()) {
        return next.run(req).await;
    }
    warn!(path = %req.uri().path(), "rejected unauthenticated request");
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Basic realm=\"easychat\"")],
        Json(json!({"error": "unauthorized"})),
    )
        .into_response()
}

fn is_authorized(auth: &AuthConfig, headers: &HeaderMap) -> bool {
    let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    else {
        return false;
    };
    let Some((scheme, encoded)) = value.trim().split_once(' ') else {
        return false;
    };
    if !scheme.eq_ignore_ascii_case("basic") {
        return false;
    }
    let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded.trim()) else {
        return false;
    };
    let Ok(decoded) = String::from_utf8(decoded) else {
        return false;
    };
    match decoded.split_once(':') {
        Some((user, pass)) => {
            let user_ok = constant_time_eq(user.as_bytes(), auth.username.as_bytes());
            let pass_ok = constant_time_eq(pass.as_bytes(), auth.password.as_bytes());
            user_ok & pass_ok
        }
        None => false,
    }
}

/** \brief 长度相同时按字节异或比较，耗时与首个差异位置无关。 */
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn error_response(err: ChatError) -> ApiError {
    let status = match &err {
        ChatError::NotFound(_) => StatusCode::NOT_FOUND,
        ChatError::Unconfigured(_) => StatusCode::SERVICE_UNAVAILABLE,
        ChatError::ProviderCallFailed(_) => StatusCode::BAD_GATEWAY,
        ChatError::PersistenceFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        error!(error = %err, "request failed");
    }
    (status, Json(json!({"error": err.to_string()})))
}

fn bad_request<E: std::fmt::Display>(e: E) -> ApiError {
    (StatusCode::BAD_REQUEST, Json(json!({"error": e.to_string()})))
}

fn internal_err<E: std::fmt::Display>(e: E) -> ApiError {
    error!(error = %e, "internal error");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": e.to_string()})),
    )
}

#[derive(Deserialize, Debug)]
struct CreateSessionQuery {
    /** \brief 新会话标题，可选。 */
    title: Option<String>,
}

/**
 * \brief 客户端提交的消息；未给出时间戳时由服务端补全。
 */
#[derive(Deserialize, Debug)]
struct MessageInput {
    role: Role,
    content: String,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default, alias = "file_urls")]
    attachments: Option<Vec<String>>,
}

impl From<MessageInput> for Message {
    fn from(input: MessageInput) -> Self {
        Message {
            role: input.role,
            content: input.content,
            timestamp: input.timestamp.unwrap_or_else(now_timestamp),
            attachments: input.attachments.unwrap_or_default(),
        }
    }
}

#[derive(Deserialize, Debug)]
struct ChatRequest {
    message: String,
    session_id: String,
    #[serde(default, alias = "file_urls")]
    attachments: Option<Vec<String>>,
}

#[derive(Serialize, Debug)]
struct UploadResponse {
    url: String,
    filename: String,
}

async fn root() -> Json<Value> {
    Json(json!({"message": "EasyChat API"}))
}

async fn list_sessions(State(state): State<AppState>) -> Json<Vec<Session>> {
    Json(state.service.list_sessions())
}

async fn create_session(
    State(state): State<AppState>,
    Query(q): Query<CreateSessionQuery>,
) -> ApiResult<Session> {
    let title = q
        .title
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| NEW_SESSION_TITLE.to_string());
    state
        .service
        .create_session(&title)
        .map(Json)
        .map_err(error_response)
}

async fn get_session(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Session> {
    state
        .service
        .get_session(&id)
        .map(Json)
        .ok_or_else(|| error_response(ChatError::session_not_found(&id)))
}

async fn update_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<SessionPatch>,
) -> ApiResult<Session> {
    state
        .service
        .update_session(&id, &patch)
        .map(Json)
        .map_err(error_response)
}

async fn delete_session(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Value> {
    if state.service.delete_session(&id).map_err(error_response)? {
        info!(session_id = %id, "session deleted");
        Ok(Json(json!({"message": "session deleted"})))
    } else {
        Err(error_response(ChatError::session_not_found(&id)))
    }
}

async fn add_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<MessageInput>,
) -> ApiResult<Session> {
    state
        .service
        .append_message(&id, input.into())
        .map(Json)
        .map_err(error_response)
}

async fn clear_messages(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Session> {
    state
        .service
        .clear_messages(&id)
        .map(Json)
        .map_err(error_response)
}

async fn edit_message(
    State(state): State<AppState>,
    Path((id, index)): Path<(String, usize)>,
    Json(input): Json<MessageInput>,
) -> ApiResult<Session> {
    state
        .service
        .edit_message(&id, index, input.into())
        .map(Json)
        .map_err(error_response)
}

async fn delete_message(
    State(state): State<AppState>,
    Path((id, index)): Path<(String, usize)>,
) -> ApiResult<Session> {
    state
        .service
        .delete_message(&id, index)
        .map(Json)
        .map_err(error_response)
}

async fn chat(State(state): State<AppState>, Json(req): Json<ChatRequest>) -> ApiResult<ChatTurn> {
    state
        .service
        .chat(
            &req.session_id,
            &req.message,
            req.attachments.unwrap_or_default(),
        )
        .await
        .map(Json)
        .map_err(error_response)
}

async fn get_config(State(state): State<AppState>) -> Json<ProviderCatalog> {
    Json(state.service.list_providers_and_models())
}

/**
 * \brief 保存上传文件，返回可作为附件引用的 URL。
 */
async fn upload_file(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<UploadResponse> {
    while let Some(field) = multipart.next_field().await.map_err(bad_request)? {
        let Some(original) = field.file_name().map(str::to_string) else {
            continue;
        };
        let data = field.bytes().await.map_err(bad_request)?;
        let stored = format!("{}_{}", Uuid::new_v4().simple(), sanitize_file_name(&original));

        tokio::fs::create_dir_all(&state.upload_dir)
            .await
            .map_err(internal_err)?;
        tokio::fs::write(state.upload_dir.join(&stored), &data)
            .await
            .map_err(internal_err)?;
        info!(file = %stored, bytes = data.len(), "file uploaded");

        return Ok(Json(UploadResponse {
            url: format!("{}{}", UPLOADS_PREFIX, stored),
            filename: original,
        }));
    }
    Err(bad_request("multipart body has no file field"))
}

fn sanitize_file_name(name: &str) -> String {
    let base = std::path::Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("");
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "file".to_string()
    } else {
        cleaned.to_string()
    }
}
