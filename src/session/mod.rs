//! Consumer-side MCP session.
//!
//! A `Session` owns one transport and walks the lifecycle
//! `Uninitialized → Handshaking → Ready → Closed`. A background reader task
//! routes responses to the caller awaiting them; the pending map is the only
//! record of in-flight requests, and every entry is resolved exactly once:
//! by its response, or by being dropped when the session closes (which the
//! waiting caller observes as `ConnectionLost`).

use crate::config::SessionConfig;
use crate::error::{BridgeError, Result};
use crate::protocol::{
    InitializeParams, InitializeResult, Message, Notification, PROTOCOL_VERSION, PeerInfo,
    Request, RequestId, Response, RpcError, error_codes, methods,
};
use crate::transport::{Transport, TransportKind};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rmcp::model::{ClientCapabilities, ServerCapabilities};
use serde_json::{Value, json};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{RwLock, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default timeout for the initialize handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Handshaking,
    Ready,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::Handshaking => "handshaking",
            SessionState::Ready => "ready",
            SessionState::Closed => "closed",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub client_info: PeerInfo,
    pub capabilities: ClientCapabilities,
    pub handshake_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            client_info: PeerInfo::new(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
            capabilities: ClientCapabilities::default(),
            handshake_timeout: HANDSHAKE_TIMEOUT,
        }
    }
}

impl From<&SessionConfig> for SessionOptions {
    fn from(config: &SessionConfig) -> Self {
        Self {
            handshake_timeout: Duration::from_secs(config.handshake_timeout_secs),
            ..Self::default()
        }
    }
}

struct SessionInner {
    transport: Arc<dyn Transport>,
    options: SessionOptions,
    state: RwLock<SessionState>,
    pending: DashMap<RequestId, oneshot::Sender<Response>>,
    next_id: AtomicU64,
    server: RwLock<Option<InitializeResult>>,
    shutdown: CancellationToken,
}

/// One logical connection to a tool provider.
/// Not `Clone`: share it behind an `Arc`. Dropping it tears the connection down.
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub fn new(transport: Arc<dyn Transport>, options: SessionOptions) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                transport,
                options,
                state: RwLock::new(SessionState::Uninitialized),
                pending: DashMap::new(),
                next_id: AtomicU64::new(1),
                server: RwLock::new(None),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub async fn state(&self) -> SessionState {
        *self.inner.state.read().await
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.inner.transport.kind()
    }

    pub async fn server_info(&self) -> Option<PeerInfo> {
        self.inner
            .server
            .read()
            .await
            .as_ref()
            .map(|s| s.server_info.clone())
    }

    pub async fn server_capabilities(&self) -> Option<ServerCapabilities> {
        self.inner
            .server
            .read()
            .await
            .as_ref()
            .map(|s| s.capabilities.clone())
    }

    pub async fn instructions(&self) -> Option<String> {
        self.inner
            .server
            .read()
            .await
            .as_ref()
            .and_then(|s| s.instructions.clone())
    }

    /// Open the transport and run the initialize handshake.
    /// Any failure closes the session for good.
    pub async fn connect(&self) -> Result<()> {
        {
            let mut state = self.inner.state.write().await;
            if *state != SessionState::Uninitialized {
                return Err(BridgeError::HandshakeFailure(format!(
                    "cannot connect a session that is {}",
                    *state
                )));
            }
            *state = SessionState::Handshaking;
        }

        info!(
            "Connecting MCP session over {} transport",
            self.transport_kind()
        );

        if let Err(e) = self.inner.transport.open().await {
            return Err(self.fail_handshake(format!("transport open failed: {}", e)).await);
        }

        tokio::spawn(read_loop(Arc::clone(&self.inner)));

        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: self.inner.options.capabilities.clone(),
            client_info: self.inner.options.client_info.clone(),
        };
        let params = match serde_json::to_value(params) {
            Ok(params) => params,
            Err(e) => return Err(self.fail_handshake(e.to_string()).await),
        };

        let id = self.inner.next_request_id();
        let timeout = self.inner.options.handshake_timeout;
        let outcome = tokio::time::timeout(
            timeout,
            self.inner.send_request(id, methods::INITIALIZE, Some(params)),
        )
        .await;

        let value = match outcome {
            Err(_) => {
                return Err(self
                    .fail_handshake(format!("no initialize response within {:?}", timeout))
                    .await);
            }
            Ok(Err(e)) => return Err(self.fail_handshake(e.to_string()).await),
            Ok(Ok(value)) => value,
        };

        let result: InitializeResult = match serde_json::from_value(value) {
            Ok(result) => result,
            Err(e) => {
                return Err(self
                    .fail_handshake(format!("malformed initialize result: {}", e))
                    .await);
            }
        };

        if result.protocol_version != PROTOCOL_VERSION {
            warn!(
                "Provider negotiated protocol version {} (requested {})",
                result.protocol_version, PROTOCOL_VERSION
            );
        }
        info!(
            "Connected to provider {} v{}",
            result.server_info.name, result.server_info.version
        );
        *self.inner.server.write().await = Some(result);

        let initialized = Notification::new(methods::INITIALIZED, None);
        if let Err(e) = self.inner.transport.send(initialized.into()).await {
            return Err(self.fail_handshake(e.to_string()).await);
        }

        let mut state = self.inner.state.write().await;
        if *state != SessionState::Handshaking {
            return Err(BridgeError::connection_lost(
                "session closed during handshake",
            ));
        }
        *state = SessionState::Ready;
        debug!("MCP session ready");
        Ok(())
    }

    async fn fail_handshake(&self, reason: String) -> BridgeError {
        error!("MCP handshake failed: {}", reason);
        self.inner.shutdown().await;
        BridgeError::HandshakeFailure(reason)
    }

    /// Close the session and release the transport. Idempotent.
    pub async fn disconnect(&self) -> Result<()> {
        let previous = {
            let mut state = self.inner.state.write().await;
            std::mem::replace(&mut *state, SessionState::Closed)
        };
        if previous == SessionState::Closed {
            return Ok(());
        }

        info!("Disconnecting MCP session (was {})", previous);
        self.inner.shutdown().await;
        Ok(())
    }

    /// Send a request with a session-generated id and await its result
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        self.ensure_ready().await?;
        let id = self.inner.next_request_id();
        self.inner.send_request(id, method, params).await
    }

    /// Send a request under a caller-supplied id (e.g. a model's tool call id)
    pub async fn request_with_id(
        &self,
        id: RequestId,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value> {
        self.ensure_ready().await?;
        self.inner.send_request(id, method, params).await
    }

    /// Number of requests awaiting a response
    pub fn in_flight(&self) -> usize {
        self.inner.pending.len()
    }

    async fn ensure_ready(&self) -> Result<()> {
        match self.state().await {
            SessionState::Ready => Ok(()),
            other => Err(BridgeError::SessionNotReady(other)),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Reader task notices and closes the transport
        self.inner.shutdown.cancel();
    }
}

impl SessionInner {
    fn next_request_id(&self) -> RequestId {
        RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    async fn send_request(
        &self,
        id: RequestId,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value> {
        let (tx, rx) = oneshot::channel();
        match self.pending.entry(id.clone()) {
            Entry::Occupied(_) => {
                return Err(BridgeError::protocol(
                    error_codes::INVALID_REQUEST,
                    format!("request id {} is already in flight", id),
                ));
            }
            Entry::Vacant(slot) => {
                slot.insert(tx);
            }
        }

        // Checked after insertion so a concurrent shutdown cannot miss this entry
        if self.shutdown.is_cancelled() {
            self.pending.remove(&id);
            return Err(BridgeError::connection_lost("session closed"));
        }

        debug!("Sending {} request {}", method, id);
        let request = Request::new(id.clone(), method, params);
        // Some transports only return from `send` once the reply is in
        let sent = tokio::select! {
            _ = self.shutdown.cancelled() => Err(BridgeError::connection_lost(format!(
                "session closed while sending {} request {}",
                method, id
            ))),
            sent = self.transport.send(request.into()) => sent,
        };
        if let Err(e) = sent {
            self.pending.remove(&id);
            return Err(e);
        }

        let response = rx.await.map_err(|_| {
            BridgeError::connection_lost(format!(
                "{} request {} was not answered before the connection closed",
                method, id
            ))
        })?;

        response.into_result().map_err(|e| match e.code {
            error_codes::CONNECTION_CLOSED => BridgeError::ConnectionLost(e.message),
            code => BridgeError::protocol(code, e.message),
        })
    }

    fn resolve(&self, response: Response) {
        let Some(id) = response.id.clone() else {
            warn!("Provider reported an uncorrelated error: {:?}", response.error);
            return;
        };

        match self.pending.remove(&id) {
            Some((_, tx)) => {
                if tx.send(response).is_err() {
                    debug!("Caller for request {} stopped waiting", id);
                }
            }
            None => warn!("Dropping response for unknown or resolved request {}", id),
        }
    }

    async fn answer_server_request(&self, request: Request) {
        let response = if request.method == methods::PING {
            Response::success(request.id, json!({}))
        } else {
            Response::failure(
                Some(request.id),
                RpcError::new(
                    error_codes::METHOD_NOT_FOUND,
                    format!("Client does not handle {}", request.method),
                ),
            )
        };

        if let Err(e) = self.transport.send(response.into()).await {
            warn!("Failed to answer provider request: {}", e);
        }
    }

    fn on_notification(&self, notification: Notification) {
        if notification.method == methods::LOG_MESSAGE {
            info!(
                "Provider log: {}",
                notification.params.unwrap_or(serde_json::Value::Null)
            );
        } else {
            debug!("Provider notification: {}", notification.method);
        }
    }

    async fn shutdown(&self) {
        self.shutdown.cancel();
        *self.state.write().await = SessionState::Closed;

        // Dropping the senders wakes every waiter with ConnectionLost
        let lost = self.pending.len();
        self.pending.clear();
        if lost > 0 {
            warn!("{} in-flight request(s) lost on session close", lost);
        }

        if let Err(e) = self.transport.close().await {
            warn!("Error closing transport: {}", e);
        }
    }
}

async fn read_loop(inner: Arc<SessionInner>) {
    loop {
        let next = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            next = inner.transport.receive() => next,
        };

        match next {
            Ok(Some(Message::Response(response))) => inner.resolve(response),
            Ok(Some(Message::Request(request))) => inner.answer_server_request(request).await,
            Ok(Some(Message::Notification(notification))) => inner.on_notification(notification),
            Ok(None) => {
                info!("Provider transport closed");
                break;
            }
            Err(e) => {
                warn!("Provider transport failed: {}", e);
                break;
            }
        }
    }

    inner.shutdown().await;
    debug!("Session reader exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;

    async fn expect_request(peer: &MemoryTransport, method: &str) -> Request {
        match peer.receive().await.unwrap() {
            Some(Message::Request(request)) if request.method == method => request,
            other => panic!("expected {} request, got {:?}", method, other),
        }
    }

    async fn answer_handshake(peer: &MemoryTransport) {
        let init = expect_request(peer, methods::INITIALIZE).await;
        let result = InitializeResult {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: PeerInfo::new("fake-provider", "0.0.1"),
            instructions: Some("be nice".to_string()),
        };
        peer.send(Response::success(init.id, serde_json::to_value(result).unwrap()).into())
            .await
            .unwrap();

        match peer.receive().await.unwrap() {
            Some(Message::Notification(n)) => assert_eq!(n.method, methods::INITIALIZED),
            other => panic!("expected initialized notification, got {:?}", other),
        }
    }

    async fn ready_session() -> (Arc<Session>, Arc<MemoryTransport>) {
        let (ours, theirs) = MemoryTransport::pair();
        let theirs = Arc::new(theirs);
        let session = Arc::new(Session::new(Arc::new(ours), SessionOptions::default()));

        let peer = Arc::clone(&theirs);
        let provider = tokio::spawn(async move { answer_handshake(&peer).await });
        session.connect().await.unwrap();
        provider.await.unwrap();

        (session, theirs)
    }

    #[tokio::test]
    async fn test_handshake_reaches_ready() {
        let (session, _peer) = ready_session().await;

        assert_eq!(session.state().await, SessionState::Ready);
        assert_eq!(session.transport_kind(), TransportKind::Memory);
        assert_eq!(session.server_info().await.unwrap().name, "fake-provider");
        assert!(session.server_capabilities().await.unwrap().tools.is_some());
        assert_eq!(session.instructions().await.as_deref(), Some("be nice"));
    }

    #[tokio::test]
    async fn test_request_before_ready_has_no_side_effect() {
        let (ours, theirs) = MemoryTransport::pair();
        let session = Session::new(Arc::new(ours), SessionOptions::default());

        let err = session.request(methods::TOOLS_LIST, None).await.unwrap_err();
        assert!(matches!(
            err,
            BridgeError::SessionNotReady(SessionState::Uninitialized)
        ));

        let nothing =
            tokio::time::timeout(Duration::from_millis(50), theirs.receive()).await;
        assert!(nothing.is_err(), "provider must not see any traffic");
        assert_eq!(session.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_malformed_initialize_result_closes_session() {
        let (ours, theirs) = MemoryTransport::pair();
        let session = Session::new(Arc::new(ours), SessionOptions::default());

        let provider = tokio::spawn(async move {
            let init = expect_request(&theirs, methods::INITIALIZE).await;
            theirs
                .send(Response::success(init.id, json!({"unexpected": true})).into())
                .await
                .unwrap();
            theirs
        });

        let err = session.connect().await.unwrap_err();
        assert!(matches!(err, BridgeError::HandshakeFailure(_)));
        assert_eq!(session.state().await, SessionState::Closed);
        let _ = provider.await;

        // No silent retry
        assert!(session.connect().await.is_err());
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let (ours, _theirs) = MemoryTransport::pair();
        let options = SessionOptions {
            handshake_timeout: Duration::from_millis(50),
            ..SessionOptions::default()
        };
        let session = Session::new(Arc::new(ours), options);

        let err = session.connect().await.unwrap_err();
        assert!(matches!(err, BridgeError::HandshakeFailure(_)));
        assert_eq!(session.state().await, SessionState::Closed);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let (session, _peer) = ready_session().await;

        session.disconnect().await.unwrap();
        session.disconnect().await.unwrap();
        assert_eq!(session.state().await, SessionState::Closed);

        let err = session.request(methods::TOOLS_LIST, None).await.unwrap_err();
        assert!(matches!(err, BridgeError::SessionNotReady(SessionState::Closed)));
    }

    #[tokio::test]
    async fn test_disconnect_resolves_in_flight_request_once() {
        let (session, peer) = ready_session().await;

        let caller = {
            let session = Arc::clone(&session);
            tokio::spawn(async move {
                session
                    .request_with_id(RequestId::from("call_1"), methods::TOOLS_CALL, None)
                    .await
            })
        };

        // Provider receives the call but never answers
        let call = expect_request(&peer, methods::TOOLS_CALL).await;
        assert_eq!(call.id, RequestId::from("call_1"));
        assert_eq!(session.in_flight(), 1);

        session.disconnect().await.unwrap();

        let result = caller.await.unwrap();
        assert!(matches!(result, Err(BridgeError::ConnectionLost(_))));
        assert_eq!(session.in_flight(), 0);

        // A late reply finds nothing to resolve
        let _ = peer
            .send(Response::success(call.id, json!({})).into())
            .await;
    }

    #[tokio::test]
    async fn test_provider_hangup_fails_in_flight_request() {
        let (session, peer) = ready_session().await;

        let caller = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.request(methods::TOOLS_LIST, None).await })
        };
        expect_request(&peer, methods::TOOLS_LIST).await;
        peer.close().await.unwrap();

        let result = caller.await.unwrap();
        assert!(matches!(result, Err(BridgeError::ConnectionLost(_))));

        // Reader marks the session closed once the transport ends
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(session.state().await, SessionState::Closed);
    }

    #[tokio::test]
    async fn test_orphan_response_is_ignored() {
        let (session, peer) = ready_session().await;

        peer.send(Response::success(RequestId::from("ghost"), json!({})).into())
            .await
            .unwrap();

        let caller = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.request(methods::PING, None).await })
        };
        let ping = expect_request(&peer, methods::PING).await;
        peer.send(Response::success(ping.id, json!({"pong": true})).into())
            .await
            .unwrap();

        assert_eq!(caller.await.unwrap().unwrap(), json!({"pong": true}));
    }

    #[tokio::test]
    async fn test_duplicate_in_flight_id_is_rejected() {
        let (session, peer) = ready_session().await;

        let first = {
            let session = Arc::clone(&session);
            tokio::spawn(async move {
                session
                    .request_with_id(RequestId::from("dup"), methods::TOOLS_CALL, None)
                    .await
            })
        };
        let call = expect_request(&peer, methods::TOOLS_CALL).await;

        let err = session
            .request_with_id(RequestId::from("dup"), methods::TOOLS_CALL, None)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Protocol { .. }));

        peer.send(Response::success(call.id, json!({"done": 1})).into())
            .await
            .unwrap();
        assert_eq!(first.await.unwrap().unwrap(), json!({"done": 1}));
    }

    #[tokio::test]
    async fn test_rpc_error_surfaces_as_protocol_error() {
        let (session, peer) = ready_session().await;

        let caller = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.request("resources/list", None).await })
        };
        let request = expect_request(&peer, "resources/list").await;
        peer.send(
            Response::failure(
                Some(request.id),
                RpcError::new(error_codes::METHOD_NOT_FOUND, "Method not found"),
            )
            .into(),
        )
        .await
        .unwrap();

        match caller.await.unwrap() {
            Err(BridgeError::Protocol { code, .. }) => assert_eq!(code, -32601),
            other => panic!("expected protocol error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_provider_ping_is_answered() {
        let (_session, peer) = ready_session().await;

        peer.send(Request::new(99u64, methods::PING, None).into())
            .await
            .unwrap();
        match peer.receive().await.unwrap() {
            Some(Message::Response(response)) => {
                assert_eq!(response.id, Some(RequestId::from(99u64)));
                assert_eq!(response.result, Some(json!({})));
            }
            other => panic!("expected ping response, got {:?}", other),
        }
    }
}
