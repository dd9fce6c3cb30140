//! Provider side: answers MCP requests from a [`ToolRegistry`].
//!
//! `ToolServer` is transport-agnostic. `serve` drives it over any
//! [`Transport`] (stdio in practice); the `http` module mounts it behind the
//! streamable HTTP endpoint.

pub mod http;

use crate::error::{BridgeError, Result};
use crate::protocol::{
    InitializeParams, InitializeResult, Message, Notification, PROTOCOL_VERSION, PeerInfo,
    Request, Response, RpcError, error_codes, methods,
};
use crate::registry::ToolRegistry;
use crate::session::SessionState;
use crate::transport::Transport;
use rmcp::model::{
    CallToolRequestParams, CallToolResult, Content, ListToolsResult, PaginatedRequestParams,
    ServerCapabilities,
};
use serde_json::{Value, json};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

const OUTBOUND_BUFFER: usize = 64;

/// Where server-initiated messages for a session go
#[derive(Debug)]
enum Outbound {
    None,
    Channel(mpsc::Sender<Message>),
    Broadcast(broadcast::Sender<Message>),
}

/// Per-connection handshake state on the provider side
#[derive(Debug)]
pub struct ProviderSession {
    id: String,
    initialized: AtomicBool,
    client_info: OnceLock<PeerInfo>,
    outbound: Outbound,
    created: Instant,
    /// Milliseconds after `created` of the last request seen
    last_seen_ms: AtomicU64,
}

impl ProviderSession {
    /// Session with nowhere to push server-initiated messages
    pub fn new(id: impl Into<String>) -> Self {
        Self::with_outbound(id, Outbound::None)
    }

    /// Pushed messages are queued on `tx` next to the responses
    pub fn with_channel(id: impl Into<String>, tx: mpsc::Sender<Message>) -> Self {
        Self::with_outbound(id, Outbound::Channel(tx))
    }

    /// Pushed messages fan out to whoever is subscribed at the time
    pub fn with_broadcast(id: impl Into<String>, tx: broadcast::Sender<Message>) -> Self {
        Self::with_outbound(id, Outbound::Broadcast(tx))
    }

    fn with_outbound(id: impl Into<String>, outbound: Outbound) -> Self {
        Self {
            id: id.into(),
            initialized: AtomicBool::new(false),
            client_info: OnceLock::new(),
            outbound,
            created: Instant::now(),
            last_seen_ms: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn client_info(&self) -> Option<&PeerInfo> {
        self.client_info.get()
    }

    /// Record client activity
    pub fn touch(&self) {
        let elapsed = self.created.elapsed().as_millis() as u64;
        self.last_seen_ms.fetch_max(elapsed, Ordering::Relaxed);
    }

    /// Time since the client was last heard from
    pub fn idle_for(&self) -> Duration {
        let last_seen = Duration::from_millis(self.last_seen_ms.load(Ordering::Relaxed));
        self.created.elapsed().saturating_sub(last_seen)
    }

    /// Whether a push stream is currently attached
    pub fn has_subscribers(&self) -> bool {
        match &self.outbound {
            Outbound::Broadcast(tx) => tx.receiver_count() > 0,
            _ => false,
        }
    }

    /// Subscribe to server-initiated messages (broadcast sessions only)
    pub fn subscribe(&self) -> Option<broadcast::Receiver<Message>> {
        match &self.outbound {
            Outbound::Broadcast(tx) => Some(tx.subscribe()),
            _ => None,
        }
    }

    fn push(&self, message: Message) {
        match &self.outbound {
            Outbound::None => {}
            Outbound::Channel(tx) => {
                if tx.try_send(message).is_err() {
                    debug!("Dropping pushed message for session {}", self.id);
                }
            }
            Outbound::Broadcast(tx) => {
                // No open stream means nobody to tell
                let _ = tx.send(message);
            }
        }
    }
}

/// Answers `initialize`, `ping`, `tools/list` and `tools/call`.
/// Cheap to clone; the registry is shared read-only.
#[derive(Clone)]
pub struct ToolServer {
    registry: Arc<ToolRegistry>,
    info: PeerInfo,
    instructions: Option<String>,
    page_size: Option<usize>,
}

impl ToolServer {
    pub fn new(registry: ToolRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
            info: PeerInfo::new(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
            instructions: None,
            page_size: None,
        }
    }

    pub fn with_info(mut self, info: PeerInfo) -> Self {
        self.info = info;
        self
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    /// Split `tools/list` results into pages of `size` descriptors
    pub fn with_page_size(mut self, size: usize) -> Self {
        self.page_size = (size > 0).then_some(size);
        self
    }

    pub fn info(&self) -> &PeerInfo {
        &self.info
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Handle one inbound message. Requests always yield a response;
    /// notifications and stray responses yield nothing.
    pub async fn handle(&self, session: &ProviderSession, message: Message) -> Option<Response> {
        match message {
            Message::Request(request) => Some(self.handle_request(session, request).await),
            Message::Notification(notification) => {
                self.handle_notification(session, notification);
                None
            }
            Message::Response(response) => {
                debug!("Ignoring response {:?} from client", response.id);
                None
            }
        }
    }

    async fn handle_request(&self, session: &ProviderSession, request: Request) -> Response {
        let Request {
            id, method, params, ..
        } = request;
        debug!("Session {} <- {} ({})", session.id, method, id);

        let result = match method.as_str() {
            methods::INITIALIZE => self.initialize(session, params),
            methods::PING => Ok(json!({})),
            _ if !session.is_initialized() => {
                Err(BridgeError::SessionNotReady(SessionState::Uninitialized))
            }
            methods::TOOLS_LIST => self.list_tools(params),
            methods::TOOLS_CALL => self.call_tool(session, params).await,
            other => Err(BridgeError::protocol(
                error_codes::METHOD_NOT_FOUND,
                format!("Method not found: {}", other),
            )),
        };

        match result {
            Ok(value) => Response::success(id, value),
            Err(e) => {
                debug!("Request {} failed: {}", id, e);
                Response::failure(Some(id), RpcError::from(&e))
            }
        }
    }

    fn handle_notification(&self, session: &ProviderSession, notification: Notification) {
        if notification.method == methods::INITIALIZED {
            info!("Client session {} initialized", session.id);
        } else {
            debug!("Ignoring notification {}", notification.method);
        }
    }

    fn initialize(&self, session: &ProviderSession, params: Option<Value>) -> Result<Value> {
        let params: InitializeParams = parse_params(params)?;
        if session.initialized.swap(true, Ordering::AcqRel) {
            return Err(BridgeError::protocol(
                error_codes::INVALID_REQUEST,
                "Session already initialized",
            ));
        }

        if params.protocol_version != PROTOCOL_VERSION {
            debug!(
                "Client requested protocol {}, answering with {}",
                params.protocol_version, PROTOCOL_VERSION
            );
        }
        info!(
            "Client {} v{} connected (session {})",
            params.client_info.name, params.client_info.version, session.id
        );
        let _ = session.client_info.set(params.client_info);

        let result = InitializeResult {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: self.info.clone(),
            instructions: self.instructions.clone(),
        };
        Ok(serde_json::to_value(result)?)
    }

    fn list_tools(&self, params: Option<Value>) -> Result<Value> {
        let cursor = match params {
            Some(params) => parse_params::<PaginatedRequestParams>(Some(params))?.cursor,
            None => None,
        };
        let tools = self.registry.tools();

        let start = match cursor.as_deref() {
            None => 0,
            Some(cursor) => cursor
                .parse::<usize>()
                .ok()
                .filter(|&offset| offset <= tools.len())
                .ok_or_else(|| {
                    BridgeError::protocol(
                        error_codes::INVALID_PARAMS,
                        format!("Invalid cursor: {}", cursor),
                    )
                })?,
        };
        let end = match self.page_size {
            Some(size) => (start + size).min(tools.len()),
            None => tools.len(),
        };

        let result = ListToolsResult {
            meta: None,
            next_cursor: (end < tools.len()).then(|| end.to_string()),
            tools: tools[start..end].to_vec(),
        };
        Ok(serde_json::to_value(result)?)
    }

    async fn call_tool(&self, session: &ProviderSession, params: Option<Value>) -> Result<Value> {
        let params: CallToolRequestParams = parse_params(params)?;
        let name = params.name.to_string();

        let result = match self.registry.invoke(&name, params.arguments).await {
            Ok(result) => result,
            Err(e) => {
                warn!("Tool call {} failed: {}", name, e);
                session.push(
                    Notification::new(
                        methods::LOG_MESSAGE,
                        Some(json!({
                            "level": "warning",
                            "logger": self.info.name,
                            "data": format!("Tool {} failed: {}", name, e),
                        })),
                    )
                    .into(),
                );
                CallToolResult::error(vec![Content::text(e.to_string())])
            }
        };

        Ok(serde_json::to_value(result)?)
    }

    /// Serve one client over `transport` until it closes.
    ///
    /// Each request runs on its own task, so a slow tool never blocks pings or
    /// other calls. `initialize` is handled inline to keep the handshake ordered.
    pub async fn serve(&self, transport: Arc<dyn Transport>) -> Result<()> {
        transport.open().await?;
        info!("Serving {} tool(s) over {}", self.registry.len(), transport.kind());

        let (tx, mut rx) = mpsc::channel::<Message>(OUTBOUND_BUFFER);
        let session = Arc::new(ProviderSession::with_channel(
            transport.kind().to_string(),
            tx.clone(),
        ));

        // Single writer keeps frames from interleaving
        let writer = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move {
                while let Some(message) = rx.recv().await {
                    if let Err(e) = transport.send(message).await {
                        warn!("Failed to write to client: {}", e);
                        break;
                    }
                }
            })
        };

        let mut tasks = JoinSet::new();
        loop {
            let message = match transport.receive().await {
                Ok(Some(message)) => message,
                Ok(None) => {
                    info!("Client closed the connection");
                    break;
                }
                Err(e) => {
                    warn!("Client transport failed: {}", e);
                    break;
                }
            };

            if message.is_request(methods::INITIALIZE) {
                if let Some(response) = self.handle(&session, message).await {
                    let _ = tx.send(response.into()).await;
                }
                continue;
            }

            let server = self.clone();
            let session = Arc::clone(&session);
            let tx = tx.clone();
            tasks.spawn(async move {
                if let Some(response) = server.handle(&session, message).await {
                    let _ = tx.send(response.into()).await;
                }
            });

            while let Some(finished) = tasks.try_join_next() {
                if let Err(e) = finished {
                    error!("Request task failed: {}", e);
                }
            }
        }

        tasks.shutdown().await;
        drop(session);
        drop(tx);
        let _ = writer.await;

        transport.close().await
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(params: Option<Value>) -> Result<T> {
    let params = params.unwrap_or_else(|| json!({}));
    serde_json::from_value(params).map_err(|e| {
        BridgeError::protocol(error_codes::INVALID_PARAMS, format!("Invalid params: {}", e))
    })
}
