//! Streamable HTTP endpoint for a [`ToolServer`].
//!
//! One path accepts every verb: POST carries client messages, GET holds an SSE
//! stream open for server-initiated messages, DELETE ends the session. The
//! session id is issued in the `Mcp-Session-Id` header of the `initialize`
//! response and must be echoed on every later request.

use super::{ProviderSession, ToolServer};
use crate::config::HttpConfig;
use crate::protocol::{Message, Response as RpcResponse, RpcError, SESSION_ID_HEADER, error_codes, methods};
use anyhow::Context;
use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::get,
};
use dashmap::DashMap;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const MCP_PATH: &str = "/mcp";

const PUSH_BUFFER: usize = 64;

/// Upper bound on how often idle sessions are swept
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct HttpState {
    server: ToolServer,
    sessions: Arc<DashMap<String, Arc<ProviderSession>>>,
    keep_alive: Duration,
}

impl HttpState {
    pub fn new(server: ToolServer, keep_alive: Duration) -> Self {
        Self {
            server,
            sessions: Arc::new(DashMap::new()),
            keep_alive,
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Drop sessions not heard from within `max_idle`. Sessions with an open
    /// push stream are kept. Returns how many were removed.
    pub fn expire_idle(&self, max_idle: Duration) -> usize {
        let mut expired = 0;
        self.sessions.retain(|id, session| {
            if session.has_subscribers() || session.idle_for() <= max_idle {
                return true;
            }
            info!("Expiring idle HTTP session {}", id);
            expired += 1;
            false
        });
        expired
    }

    fn lookup(&self, headers: &HeaderMap) -> Result<Arc<ProviderSession>, Response> {
        let id = headers
            .get(SESSION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                session_invalid(StatusCode::BAD_REQUEST, "Missing Mcp-Session-Id header")
            })?;

        self.sessions
            .get(id)
            .map(|entry| {
                entry.value().touch();
                Arc::clone(entry.value())
            })
            .ok_or_else(|| {
                session_invalid(StatusCode::NOT_FOUND, &format!("Unknown session: {}", id))
            })
    }
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/info", get(server_info))
        .route(
            MCP_PATH,
            get(open_stream).post(post_message).delete(end_session),
        )
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until `shutdown` fires
pub async fn serve_http(
    server: ToolServer,
    config: &HttpConfig,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let state = HttpState::new(server, Duration::from_secs(config.sse_keep_alive_secs));
    let app = router(state.clone());

    if config.session_idle_timeout_secs > 0 {
        let max_idle = Duration::from_secs(config.session_idle_timeout_secs);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(max_idle.min(SWEEP_INTERVAL));
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let expired = state.expire_idle(max_idle);
                        if expired > 0 {
                            debug!("{} idle session(s) expired", expired);
                        }
                    }
                }
            }
        });
    }

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("HTTP server listening on {}", addr);
    info!("Health check: http://{}/health", addr);
    info!("MCP endpoint: http://{}{}", addr, MCP_PATH);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}

pub(crate) async fn health_check() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub(crate) async fn server_info(State(state): State<HttpState>) -> impl IntoResponse {
    let info = state.server.info();
    Json(json!({
        "name": info.name,
        "version": info.version,
        "tools": state.server.registry().len(),
        "sessions": state.session_count(),
    }))
}

fn session_invalid(status: StatusCode, message: &str) -> Response {
    let body = RpcResponse::failure(None, RpcError::new(error_codes::INVALID_REQUEST, message));
    (status, Json(body)).into_response()
}

fn parse_error(details: impl std::fmt::Display) -> Response {
    let body = RpcResponse::failure(
        None,
        RpcError::new(error_codes::PARSE_ERROR, format!("Parse error: {}", details)),
    );
    (StatusCode::BAD_REQUEST, Json(body)).into_response()
}

pub(crate) async fn post_message(
    State(state): State<HttpState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let value: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(e) => return parse_error(e),
    };

    let batch = value.is_array();
    let messages: Vec<Message> = match value {
        Value::Array(items) => match items
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<Vec<_>, _>>()
        {
            Ok(messages) => messages,
            Err(e) => return parse_error(e),
        },
        single => match serde_json::from_value(single) {
            Ok(message) => vec![message],
            Err(e) => return parse_error(e),
        },
    };

    if messages.iter().any(|m| m.is_request(methods::INITIALIZE)) {
        if messages.len() != 1 {
            return session_invalid(
                StatusCode::BAD_REQUEST,
                "initialize must not be batched",
            );
        }
        return initialize(&state, messages.into_iter().next()).await;
    }

    let session = match state.lookup(&headers) {
        Ok(session) => session,
        Err(response) => return response,
    };

    let mut responses = Vec::new();
    for message in messages {
        if let Some(response) = state.server.handle(&session, message).await {
            responses.push(response);
        }
    }

    match (batch, responses.len()) {
        (_, 0) => StatusCode::ACCEPTED.into_response(),
        (false, _) => Json(responses.remove(0)).into_response(),
        (true, _) => Json(responses).into_response(),
    }
}

async fn initialize(state: &HttpState, message: Option<Message>) -> Response {
    let Some(message) = message else {
        return StatusCode::ACCEPTED.into_response();
    };

    let id = Uuid::new_v4().to_string();
    let (push_tx, _) = broadcast::channel(PUSH_BUFFER);
    let session = Arc::new(ProviderSession::with_broadcast(id.clone(), push_tx));

    let Some(response) = state.server.handle(&session, message).await else {
        return StatusCode::ACCEPTED.into_response();
    };

    if response.error.is_some() {
        return Json(response).into_response();
    }

    state.sessions.insert(id.clone(), session);
    info!("Created HTTP session {}", id);

    ([(SESSION_ID_HEADER, id)], Json(response)).into_response()
}

pub(crate) async fn open_stream(State(state): State<HttpState>, headers: HeaderMap) -> Response {
    let session = match state.lookup(&headers) {
        Ok(session) => session,
        Err(response) => return response,
    };
    let Some(rx) = session.subscribe() else {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    };
    debug!("Opened push stream for session {}", session.id());
    drop(session);

    let stream = futures::stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(message) => {
                    let event = Event::default().event("message").json_data(&message);
                    return Some((event, rx));
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Push stream lagged, {} message(s) skipped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });

    Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(state.keep_alive))
        .into_response()
}

pub(crate) async fn end_session(State(state): State<HttpState>, headers: HeaderMap) -> Response {
    let session = match state.lookup(&headers) {
        Ok(session) => session,
        Err(response) => return response,
    };

    state.sessions.remove(session.id());
    info!("Ended HTTP session {}", session.id());
    StatusCode::OK.into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{PROTOCOL_VERSION, Request};
    use crate::registry::ToolRegistry;
    use crate::registry::builtin::register_builtin_tools;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use tower::ServiceExt;

    fn test_state() -> HttpState {
        let mut registry = ToolRegistry::new();
        register_builtin_tools(&mut registry).unwrap();
        HttpState::new(ToolServer::new(registry), Duration::from_secs(15))
    }

    fn post(body: Value, session: Option<&str>) -> HttpRequest<Body> {
        let mut builder = HttpRequest::builder()
            .method("POST")
            .uri(MCP_PATH)
            .header("content-type", "application/json");
        if let Some(session) = session {
            builder = builder.header(SESSION_ID_HEADER, session);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    fn initialize_body() -> Value {
        serde_json::to_value(Request::new(
            1u64,
            methods::INITIALIZE,
            Some(json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {"name": "test", "version": "0"}
            })),
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn test_initialize_issues_session_id() {
        let state = test_state();
        let app = router(state.clone());

        let response = app.oneshot(post(initialize_body(), None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let id = response.headers().get(SESSION_ID_HEADER).unwrap().to_str().unwrap();
        assert!(Uuid::parse_str(id).is_ok());
        assert_eq!(state.session_count(), 1);
    }

    #[tokio::test]
    async fn test_missing_and_unknown_session() {
        let app = router(test_state());
        let list = json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"});

        let response = app.clone().oneshot(post(list.clone(), None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app.oneshot(post(list, Some("nope"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_idle_sessions_expire() {
        let state = test_state();
        let app = router(state.clone());

        for _ in 0..2 {
            let response = app
                .clone()
                .oneshot(post(initialize_body(), None))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
        assert_eq!(state.session_count(), 2);
        assert_eq!(state.expire_idle(Duration::from_secs(60)), 0);

        // An attached push stream keeps its session alive
        let streaming = state
            .sessions
            .iter()
            .next()
            .map(|entry| Arc::clone(entry.value()))
            .unwrap();
        let _rx = streaming.subscribe().unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(state.expire_idle(Duration::from_millis(10)), 1);
        assert_eq!(state.session_count(), 1);

        let ping = json!({"jsonrpc": "2.0", "id": 9, "method": "ping"});
        let response = app
            .oneshot(post(ping, Some(streaming.id())))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_garbage_body_is_parse_error() {
        let app = router(test_state());
        let request = HttpRequest::builder()
            .method("POST")
            .uri(MCP_PATH)
            .body(Body::from("{not json"))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
