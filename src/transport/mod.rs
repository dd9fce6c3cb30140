pub mod http;
pub mod line;
pub mod memory;
pub mod process;

pub use http::{HttpTransportOptions, StreamableHttpTransport};
pub use line::{LineTransport, StdioTransport};
pub use memory::MemoryTransport;
pub use process::{ChildProcessTransport, ProcessSpec};

use crate::config::{ProviderConfig, SessionConfig};
use crate::error::Result;
use crate::protocol::Message;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Stdio,
    ChildProcess,
    StreamableHttp,
    Memory,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransportKind::Stdio => "stdio",
            TransportKind::ChildProcess => "child-process",
            TransportKind::StreamableHttp => "streamable-http",
            TransportKind::Memory => "memory",
        };
        write!(f, "{}", s)
    }
}

/// Moves protocol messages between two endpoints.
/// Every method takes `&self`: a session's reader task calls `receive` while
/// callers `send` through the same instance.
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Establish the underlying channel (spawns the child for process pipes)
    async fn open(&self) -> Result<()>;

    async fn send(&self, message: Message) -> Result<()>;

    /// Next inbound message; `Ok(None)` once the channel is closed
    async fn receive(&self) -> Result<Option<Message>>;

    /// Release the channel; calling it again is a no-op
    async fn close(&self) -> Result<()>;
}

/// Build the consumer-side transport described by the provider configuration
pub fn from_config(provider: &ProviderConfig, session: &SessionConfig) -> Arc<dyn Transport> {
    match provider {
        ProviderConfig::Stdio {
            name,
            command,
            args,
            env,
        } => Arc::new(ChildProcessTransport::new(
            name.clone(),
            ProcessSpec {
                command: command.clone(),
                args: args.clone(),
                env: env.clone(),
            },
        )),
        ProviderConfig::Http { url } => Arc::new(StreamableHttpTransport::with_options(
            url.clone(),
            HttpTransportOptions::from(session),
        )),
    }
}
