//! HTTP server implementation using Axum.

use crate::bridge::{resolve_target, StreamMode, Target};
use crate::connection;
use crate::security::{client_identity, constant_time_eq};
use crate::state::AppState;
use axum::{
    extract::{ConnectInfo, Request, State, WebSocketUpgrade},
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub const SESSION_COOKIE: &str = "webterm_session";

#[derive(Deserialize)]
struct LoginRequest {
    #[serde(default)]
    password: String,
}

#[derive(Debug, Serialize)]
pub struct ApiResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Seconds until another attempt is allowed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl ApiResponse {
    fn ok(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            success: true,
            message: Some(message.into()),
            retry_after: None,
        })
    }
}

type ApiError = (StatusCode, Json<ApiResponse>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ApiResponse {
            success: false,
            message: Some(message.into()),
            retry_after: None,
        }),
    )
}

fn too_many_attempts(remaining: Duration) -> ApiError {
    let secs = remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0);
    (
        StatusCode::TOO_MANY_REQUESTS,
        Json(ApiResponse {
            success: false,
            message: Some("Too many failed attempts".to_string()),
            retry_after: Some(secs),
        }),
    )
}

#[derive(Serialize)]
struct InfoResponse {
    file: Option<String>,
    path: Option<String>,
    command: Option<String>,
    root: String,
    mode: StreamMode,
    auth: bool,
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/api/info", get(info))
        .route("/ws", get(exec_socket))
        .route("/ws/shell", get(shell_socket))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_session));

    Router::new()
        .route("/health", get(health))
        .route("/login", post(login))
        .route("/logout", post(logout))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve on an already-bound listener until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = router(state).into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
}

/// Run the HTTP server on the given port with the provided state.
pub async fn run_server(port: u16, state: AppState) -> io::Result<()> {
    let sweepers = state.start_sweepers();

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!("Starting HTTP server on {}", addr);

    let result = serve(listener, state, shutdown_signal()).await;
    for sweeper in sweepers {
        sweeper.stop();
    }
    info!("Server stopped");
    result
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Listening for Ctrl-C failed: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

async fn health() -> &'static str {
    "OK"
}

/// Pull the session token out of the `Cookie` header.
fn session_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, token)| token)
}

async fn require_session(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if !state.config.auth_enabled() {
        return next.run(request).await;
    }
    let token = session_token(request.headers()).map(str::to_owned);
    let authorized = match token {
        Some(token) => state.sessions.validate(&token).await,
        None => false,
    };
    if authorized {
        next.run(request).await
    } else {
        api_error(StatusCode::UNAUTHORIZED, "Authentication required").into_response()
    }
}

async fn login(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(req): Json<LoginRequest>,
) -> Result<Response, ApiError> {
    let Some(password) = state.config.password.as_deref() else {
        return Ok(ApiResponse::ok("Authentication disabled").into_response());
    };

    let identity = client_identity(&headers, peer, state.config.trust_proxy);
    if let Some(remaining) = state.limiter.is_blocked(&identity).await {
        return Err(too_many_attempts(remaining));
    }

    if !constant_time_eq(req.password.as_bytes(), password.as_bytes()) {
        if let Some(lockout) = state.limiter.record_failure(&identity).await {
            return Err(too_many_attempts(lockout));
        }
        return Err(api_error(StatusCode::UNAUTHORIZED, "Invalid password"));
    }

    state.limiter.record_success(&identity).await;
    let token = state.sessions.create().await;
    info!(client = %identity, "Login succeeded");
    let cookie = format!(
        "{}={}; HttpOnly; Path=/; SameSite=Strict; Max-Age={}",
        SESSION_COOKIE,
        token,
        state.sessions.ttl().as_secs()
    );
    Ok(([(header::SET_COOKIE, cookie)], ApiResponse::ok("Logged in")).into_response())
}

async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Some(token) = session_token(&headers) {
        state.sessions.remove(token).await;
    }
    let cookie = format!(
        "{}=; HttpOnly; Path=/; SameSite=Strict; Max-Age=0",
        SESSION_COOKIE
    );
    ([(header::SET_COOKIE, cookie)], ApiResponse::ok("Logged out")).into_response()
}

async fn info(State(state): State<AppState>) -> Json<InfoResponse> {
    let config = &state.config;
    let path = config
        .default_file
        .as_deref()
        .and_then(|file| resolve_target(&config.root, file).ok())
        .map(|path| path.display().to_string());
    let command = config
        .default_file
        .as_ref()
        .and_then(|_| Target::Script(None).launch(config).ok())
        .map(|launch| launch.display());

    Json(InfoResponse {
        file: config.default_file.clone(),
        path,
        command,
        root: config.root.display().to_string(),
        mode: config.stream_mode,
        auth: config.auth_enabled(),
    })
}

async fn exec_socket(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| connection::serve_exec(socket, state))
}

async fn shell_socket(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| connection::serve_shell(socket, state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn session_token_found_among_other_cookies() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("theme=dark; webterm_session=abc123; lang=en"),
        );
        assert_eq!(session_token(&headers), Some("abc123"));
    }

    #[test]
    fn session_token_absent() {
        let mut headers = HeaderMap::new();
        assert_eq!(session_token(&headers), None);
        headers.insert(header::COOKIE, HeaderValue::from_static("webterm=nope"));
        assert_eq!(session_token(&headers), None);
    }

    #[test]
    fn retry_after_rounds_up() {
        let (status, Json(body)) = too_many_attempts(Duration::from_millis(59_001));
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body.retry_after, Some(60));
    }
}
