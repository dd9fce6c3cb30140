#![allow(dead_code)]

use axum::Router;
use mcp_bridge::{
    protocol::PeerInfo,
    registry::builtin::register_builtin_tools,
    server::http::{HttpState, router},
    transport::MemoryTransport,
    Session, SessionOptions, ToolRegistry, ToolServer,
};
use serde_json::{Value, json};
use std::{net::SocketAddr, sync::Arc, time::Duration};

// ──────────────────────────────────────────────
// Providers
// ──────────────────────────────────────────────

/// Provider serving only the built-in `add` tool.
pub fn demo_server() -> ToolServer {
    let mut registry = ToolRegistry::new();
    register_builtin_tools(&mut registry).unwrap();
    ToolServer::new(registry).with_info(PeerInfo::new("MCP Demo Server", "1.0.0"))
}

/// Provider with `count` extra echo tools, listed `page_size` at a time.
pub fn paged_server(count: usize, page_size: usize) -> ToolServer {
    let mut registry = ToolRegistry::new();
    register_builtin_tools(&mut registry).unwrap();
    for i in 0..count {
        let schema = json!({
            "type": "object",
            "properties": {"text": {"type": "string"}},
            "required": ["text"]
        });
        registry
            .register(
                format!("echo_{}", i),
                schema.as_object().cloned().unwrap(),
                format!("Echo tool number {}", i),
                mcp_bridge::handler_fn(|args| async move {
                    let text = args
                        .get("text")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    Ok::<_, anyhow::Error>(rmcp::model::CallToolResult::success(vec![
                        rmcp::model::Content::text(text),
                    ]))
                }),
            )
            .unwrap();
    }
    ToolServer::new(registry).with_page_size(page_size)
}

// ──────────────────────────────────────────────
// Shared helpers
// ──────────────────────────────────────────────

/// Build a test Router (no HTTP server, uses tower::oneshot).
pub fn build_test_app() -> Router {
    router(HttpState::new(demo_server(), Duration::from_secs(15)))
}

/// Serve `server` over streamable HTTP on an ephemeral local port.
pub async fn spawn_http_provider(server: ToolServer) -> SocketAddr {
    let app = router(HttpState::new(server, Duration::from_secs(15)));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// A Ready session talking to `server` over an in-memory pipe.
pub async fn connect_in_memory(server: ToolServer) -> Arc<Session> {
    let (client_end, server_end) = MemoryTransport::pair();
    tokio::spawn(async move { server.serve(Arc::new(server_end)).await });

    let session = Arc::new(Session::new(Arc::new(client_end), SessionOptions::default()));
    session.connect().await.unwrap();
    session
}

pub fn initialize_body(id: u64) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "initialize",
        "params": {
            "protocolVersion": mcp_bridge::protocol::PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {"name": "integration-test", "version": "0.0.0"}
        }
    })
}

/// Mount the handshake on a mock provider: `initialize` issues session
/// `mock-session`, the push stream is refused, DELETE succeeds.
pub async fn mock_handshake(server: &httpmock::MockServer) {
    use httpmock::Method::{DELETE, GET, POST};

    server
        .mock_async(|when, then| {
            when.method(POST).path("/mcp").body_contains("\"initialize\"");
            then.status(200)
                .header("content-type", "application/json")
                .header(mcp_bridge::protocol::SESSION_ID_HEADER, "mock-session")
                .json_body(json!({
                    "jsonrpc": "2.0",
                    "id": 1,
                    "result": {
                        "protocolVersion": mcp_bridge::protocol::PROTOCOL_VERSION,
                        "capabilities": {"tools": {}},
                        "serverInfo": {"name": "mock-provider", "version": "0.0.0"}
                    }
                }));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/mcp")
                .body_contains("notifications/initialized");
            then.status(202);
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/mcp");
            then.status(405);
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(DELETE).path("/mcp");
            then.status(200);
        })
        .await;
}

/// Helper to extract JSON from a response body.
pub async fn response_json(response: axum::http::Response<axum::body::Body>) -> Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}
