use super::{Transport, TransportKind};
use crate::config::SessionConfig;
use crate::error::{BridgeError, Result};
use crate::protocol::{
    Message, RequestId, Response as RpcResponse, RpcError, SESSION_ID_HEADER, error_codes,
};
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const INBOUND_BUFFER: usize = 64;

#[derive(Debug, Clone)]
pub struct HttpTransportOptions {
    /// Delay before re-opening the server push stream
    pub reconnect_delay: Duration,
    /// Consecutive failed attempts after which the push stream is abandoned
    pub max_reconnect_attempts: u32,
}

impl Default for HttpTransportOptions {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(3),
            max_reconnect_attempts: 5,
        }
    }
}

impl From<&SessionConfig> for HttpTransportOptions {
    fn from(config: &SessionConfig) -> Self {
        Self {
            reconnect_delay: Duration::from_millis(config.stream_reconnect_delay_ms),
            max_reconnect_attempts: config.max_stream_reconnects,
        }
    }
}

/// Consumer side of the streamable HTTP transport.
///
/// Every outbound message is POSTed to the endpoint. Replies arrive either as
/// a JSON body or as an SSE stream on that POST; both are queued for
/// `receive`. Once the server has issued a session id, a GET stream is held
/// open for server-initiated messages and re-opened when it drops.
pub struct StreamableHttpTransport {
    url: String,
    client: reqwest::Client,
    options: HttpTransportOptions,
    session_id: Arc<RwLock<Option<String>>>,
    inbound_tx: mpsc::Sender<Message>,
    inbound_rx: Mutex<mpsc::Receiver<Message>>,
    closed: CancellationToken,
}

impl StreamableHttpTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_options(url, HttpTransportOptions::default())
    }

    pub fn with_options(url: impl Into<String>, options: HttpTransportOptions) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
            options,
            session_id: Arc::new(RwLock::new(None)),
            inbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
            closed: CancellationToken::new(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Session id issued by the server during the handshake
    pub async fn session_id(&self) -> Option<String> {
        self.session_id.read().await.clone()
    }

    async fn store_session_id(&self, issued: &str) {
        let previous = self.session_id.write().await.replace(issued.to_string());
        match previous {
            None => {
                info!("Streamable HTTP session established: {}", issued);
                self.spawn_push_stream(issued.to_string());
            }
            Some(previous) if previous != issued => {
                warn!(
                    "Server replaced session id {} with {} at {}",
                    previous, issued, self.url
                );
            }
            Some(_) => {}
        }
    }

    fn spawn_push_stream(&self, session_id: String) {
        let client = self.client.clone();
        let url = self.url.clone();
        let tx = self.inbound_tx.clone();
        let closed = self.closed.clone();
        let options = self.options.clone();

        tokio::spawn(async move {
            let mut failures = 0u32;
            loop {
                if closed.is_cancelled() {
                    break;
                }

                let request = client
                    .get(&url)
                    .header(ACCEPT, "text/event-stream")
                    .header(SESSION_ID_HEADER, &session_id);

                let result = tokio::select! {
                    _ = closed.cancelled() => break,
                    result = request.send() => result,
                };

                match result {
                    Ok(response) if response.status() == StatusCode::METHOD_NOT_ALLOWED => {
                        debug!("Server at {} offers no push stream", url);
                        break;
                    }
                    Ok(response) if response.status() == StatusCode::NOT_FOUND => {
                        warn!("Push stream rejected, session {} is gone", session_id);
                        break;
                    }
                    Ok(response) if response.status().is_success() => {
                        failures = 0;
                        pump_events(response, &tx, &closed, None).await;
                        debug!("Push stream from {} ended", url);
                    }
                    Ok(response) => {
                        warn!("Push stream request failed: HTTP {}", response.status());
                        failures += 1;
                    }
                    Err(e) => {
                        warn!("Push stream request failed: {}", e);
                        failures += 1;
                    }
                }

                if failures > options.max_reconnect_attempts {
                    warn!(
                        "Giving up on push stream from {} after {} attempts",
                        url, failures
                    );
                    break;
                }

                tokio::select! {
                    _ = closed.cancelled() => break,
                    _ = tokio::time::sleep(options.reconnect_delay) => {}
                }
            }
        });
    }

    fn closed_error(&self) -> BridgeError {
        BridgeError::connection_lost(format!("HTTP transport to {} closed", self.url))
    }

    async fn enqueue(&self, messages: Vec<Message>) -> Result<()> {
        for message in messages {
            self.inbound_tx
                .send(message)
                .await
                .map_err(|_| BridgeError::connection_lost("inbound queue closed"))?;
        }
        Ok(())
    }
}

/// Forward SSE `data` payloads from a response body into the inbound queue.
///
/// When the stream answers a POSTed request (`awaited`), ending it without
/// that response queues a `CONNECTION_CLOSED` failure for the request so its
/// caller is released.
async fn pump_events(
    response: reqwest::Response,
    tx: &mpsc::Sender<Message>,
    closed: &CancellationToken,
    awaited: Option<RequestId>,
) {
    let mut answered = awaited.is_none();
    let mut events = Box::pin(response.bytes_stream().eventsource());
    loop {
        let next = tokio::select! {
            _ = closed.cancelled() => return,
            next = events.next() => next,
        };

        match next {
            Some(Ok(event)) => {
                if event.data.trim().is_empty() {
                    continue;
                }
                match parse_payload(&event.data) {
                    Ok(messages) => {
                        for message in messages {
                            if !answered
                                && matches!(&message, Message::Response(r) if r.id == awaited)
                            {
                                answered = true;
                            }
                            if tx.send(message).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => debug!("Ignoring non-protocol SSE event: {}", e),
                }
            }
            Some(Err(e)) => {
                warn!("SSE stream error: {}", e);
                break;
            }
            None => break,
        }
    }

    if answered || closed.is_cancelled() {
        return;
    }
    if let Some(id) = awaited {
        warn!("Reply stream ended before the response to request {}", id);
        let lost = RpcResponse::failure(
            Some(id),
            RpcError::new(
                error_codes::CONNECTION_CLOSED,
                "reply stream ended before the response arrived",
            ),
        );
        let _ = tx.send(lost.into()).await;
    }
}

/// A body holds either a single message or a batch
fn parse_payload(payload: &str) -> Result<Vec<Message>> {
    let value: serde_json::Value = serde_json::from_str(payload)?;
    match value {
        serde_json::Value::Array(items) => items
            .into_iter()
            .map(|item| serde_json::from_value(item).map_err(BridgeError::from))
            .collect(),
        other => Ok(vec![serde_json::from_value(other)?]),
    }
}

#[async_trait]
impl Transport for StreamableHttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::StreamableHttp
    }

    async fn open(&self) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(BridgeError::connection_lost(format!(
                "HTTP transport to {} already closed",
                self.url
            )));
        }
        Ok(())
    }

    async fn send(&self, message: Message) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(self.closed_error());
        }

        let awaited = match &message {
            Message::Request(request) => Some(request.id.clone()),
            _ => None,
        };
        let session_id = self.session_id().await;
        let mut request = self
            .client
            .post(&self.url)
            .header(ACCEPT, "application/json, text/event-stream")
            .json(&message);
        if let Some(id) = &session_id {
            request = request.header(SESSION_ID_HEADER, id);
        }

        let response = tokio::select! {
            _ = self.closed.cancelled() => return Err(self.closed_error()),
            response = request.send() => response?,
        };
        let status = response.status();

        if let Some(issued) = response
            .headers()
            .get(SESSION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            self.store_session_id(issued).await;
        }

        if matches!(status, StatusCode::NOT_FOUND | StatusCode::BAD_REQUEST)
            && session_id.is_some()
        {
            let body = response.text().await.unwrap_or_default();
            return Err(BridgeError::SessionInvalid(format!(
                "HTTP {} from {}: {}",
                status, self.url, body
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BridgeError::transport(format!(
                "HTTP {} from {}: {}",
                status, self.url, body
            )));
        }
        if status == StatusCode::ACCEPTED {
            return Ok(());
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        if content_type.starts_with("text/event-stream") {
            let tx = self.inbound_tx.clone();
            let closed = self.closed.clone();
            tokio::spawn(async move {
                pump_events(response, &tx, &closed, awaited).await;
            });
            return Ok(());
        }

        let body = tokio::select! {
            _ = self.closed.cancelled() => return Err(self.closed_error()),
            body = response.text() => body?,
        };
        if body.trim().is_empty() {
            return match awaited {
                Some(id) => Err(BridgeError::connection_lost(format!(
                    "{} answered request {} with an empty body",
                    self.url, id
                ))),
                None => Ok(()),
            };
        }
        let messages = parse_payload(&body)?;
        self.enqueue(messages).await
    }

    async fn receive(&self) -> Result<Option<Message>> {
        let mut rx = self.inbound_rx.lock().await;
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Ok(None),
            message = rx.recv() => Ok(message),
        }
    }

    async fn close(&self) -> Result<()> {
        if self.closed.is_cancelled() {
            return Ok(());
        }
        self.closed.cancel();

        if let Some(id) = self.session_id().await {
            debug!("Ending HTTP session {} at {}", id, self.url);
            let result = self
                .client
                .delete(&self.url)
                .header(SESSION_ID_HEADER, &id)
                .send()
                .await;
            if let Err(e) = result {
                debug!("Session teardown request failed: {}", e);
            }
        }

        Ok(())
    }
}
