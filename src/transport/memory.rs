use super::{Transport, TransportKind};
use crate::error::{BridgeError, Result};
use crate::protocol::Message;
use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

const MEMORY_BUFFER: usize = 32;

/// In-process transport; `pair()` returns two connected ends.
pub struct MemoryTransport {
    tx: Mutex<Option<mpsc::Sender<Message>>>,
    rx: Mutex<mpsc::Receiver<Message>>,
    closed: CancellationToken,
}

impl MemoryTransport {
    pub fn pair() -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::channel(MEMORY_BUFFER);
        let (b_tx, a_rx) = mpsc::channel(MEMORY_BUFFER);
        (Self::new(a_tx, a_rx), Self::new(b_tx, b_rx))
    }

    fn new(tx: mpsc::Sender<Message>, rx: mpsc::Receiver<Message>) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(rx),
            closed: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Memory
    }

    async fn open(&self) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(BridgeError::connection_lost("memory transport closed"));
        }
        Ok(())
    }

    async fn send(&self, message: Message) -> Result<()> {
        let tx = self
            .tx
            .lock()
            .await
            .clone()
            .ok_or_else(|| BridgeError::connection_lost("memory transport closed"))?;
        tx.send(message)
            .await
            .map_err(|_| BridgeError::connection_lost("memory peer closed"))
    }

    async fn receive(&self) -> Result<Option<Message>> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Ok(None),
            message = rx.recv() => Ok(message),
        }
    }

    async fn close(&self) -> Result<()> {
        self.closed.cancel();
        self.tx.lock().await.take();
        Ok(())
    }
}
