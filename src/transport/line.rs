use super::{Transport, TransportKind};
use crate::error::{BridgeError, Result};
use crate::protocol::{self, Message};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Provider-side transport over the process's own stdin/stdout
pub type StdioTransport = LineTransport<tokio::io::Stdin, tokio::io::Stdout>;

/// Newline-delimited JSON-RPC over an arbitrary reader/writer pair.
pub struct LineTransport<R, W> {
    label: String,
    kind: TransportKind,
    reader: Mutex<Lines<BufReader<R>>>,
    writer: Mutex<Option<W>>,
    closed: CancellationToken,
}

impl<R, W> LineTransport<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(label: impl Into<String>, kind: TransportKind, reader: R, writer: W) -> Self {
        Self {
            label: label.into(),
            kind,
            reader: Mutex::new(BufReader::new(reader).lines()),
            writer: Mutex::new(Some(writer)),
            closed: CancellationToken::new(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl StdioTransport {
    pub fn stdio() -> Self {
        LineTransport::new(
            "stdio",
            TransportKind::Stdio,
            tokio::io::stdin(),
            tokio::io::stdout(),
        )
    }
}

#[async_trait]
impl<R, W> Transport for LineTransport<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(BridgeError::connection_lost(format!(
                "{} transport already closed",
                self.label
            )));
        }
        Ok(())
    }

    async fn send(&self, message: Message) -> Result<()> {
        if self.is_closed() {
            return Err(BridgeError::connection_lost(format!(
                "{} transport closed",
                self.label
            )));
        }

        let line = protocol::encode_line(&message)?;
        let mut writer_lock = self.writer.lock().await;
        let writer = writer_lock.as_mut().ok_or_else(|| {
            BridgeError::connection_lost(format!("{} writer released", self.label))
        })?;

        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| BridgeError::connection_lost(format!("{}: {}", self.label, e)))?;
        writer
            .flush()
            .await
            .map_err(|e| BridgeError::connection_lost(format!("{}: {}", self.label, e)))?;

        Ok(())
    }

    async fn receive(&self) -> Result<Option<Message>> {
        let mut reader = self.reader.lock().await;
        loop {
            let line = tokio::select! {
                biased;
                _ = self.closed.cancelled() => return Ok(None),
                line = reader.next_line() => line?,
            };

            let Some(line) = line else {
                debug!("{} reached end of stream", self.label);
                return Ok(None);
            };

            match protocol::decode_line(&line) {
                Ok(Some(message)) => return Ok(Some(message)),
                Ok(None) => continue,
                Err(e) => {
                    warn!("Skipping undecodable line on {}: {}", self.label, e);
                }
            }
        }
    }

    async fn close(&self) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        self.closed.cancel();

        if let Some(mut writer) = self.writer.lock().await.take()
            && let Err(e) = writer.shutdown().await
        {
            debug!("Error shutting down {} writer: {}", self.label, e);
        }

        Ok(())
    }
}
