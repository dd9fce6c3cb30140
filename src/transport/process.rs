use super::line::LineTransport;
use super::{Transport, TransportKind};
use crate::error::{BridgeError, Result};
use crate::protocol::Message;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, error, info, warn};

/// How to launch a provider process
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessSpec {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Consumer-side transport that owns a spawned provider process.
/// Protocol frames travel over the child's stdin/stdout; stderr is only logged.
pub struct ChildProcessTransport {
    name: String,
    spec: ProcessSpec,
    child: Mutex<Option<Child>>,
    pipe: OnceCell<LineTransport<ChildStdout, ChildStdin>>,
}

impl ChildProcessTransport {
    pub fn new(name: impl Into<String>, spec: ProcessSpec) -> Self {
        Self {
            name: name.into(),
            spec,
            child: Mutex::new(None),
            pipe: OnceCell::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn pipe(&self) -> Result<&LineTransport<ChildStdout, ChildStdin>> {
        self.pipe.get().ok_or_else(|| {
            BridgeError::transport(format!("process transport '{}' is not open", self.name))
        })
    }

    /// OS process id of the child, if it is still owned by this transport
    pub async fn pid(&self) -> Option<u32> {
        self.child.lock().await.as_ref().and_then(|c| c.id())
    }
}

#[async_trait]
impl Transport for ChildProcessTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::ChildProcess
    }

    async fn open(&self) -> Result<()> {
        let mut child_lock = self.child.lock().await;
        if child_lock.is_some() || self.pipe.initialized() {
            return Err(BridgeError::transport(format!(
                "process transport '{}' is already open",
                self.name
            )));
        }

        info!("Spawning MCP provider process: {}", self.name);
        debug!("Command: {} {}", self.spec.command, self.spec.args.join(" "));

        let mut cmd = Command::new(&self.spec.command);
        cmd.args(&self.spec.args)
            .envs(&self.spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            error!("Failed to spawn provider process {}: {}", self.name, e);
            BridgeError::transport(format!("{}: failed to spawn: {}", self.name, e))
        })?;

        let stdin = child.stdin.take().ok_or_else(|| {
            BridgeError::transport(format!("{}: failed to capture stdin", self.name))
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            BridgeError::transport(format!("{}: failed to capture stdout", self.name))
        })?;

        if let Some(stderr) = child.stderr.take() {
            let name = self.name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => warn!("[{} stderr] {}", name, line),
                        Ok(None) => break,
                        Err(e) => {
                            debug!("Error reading stderr of {}: {}", name, e);
                            break;
                        }
                    }
                }
                debug!("Stderr of {} closed", name);
            });
        }

        let pipe = LineTransport::new(
            self.name.clone(),
            TransportKind::ChildProcess,
            stdout,
            stdin,
        );
        self.pipe
            .set(pipe)
            .map_err(|_| BridgeError::Internal(format!("{}: pipe set twice", self.name)))?;
        *child_lock = Some(child);

        Ok(())
    }

    async fn send(&self, message: Message) -> Result<()> {
        self.pipe()?.send(message).await
    }

    async fn receive(&self) -> Result<Option<Message>> {
        self.pipe()?.receive().await
    }

    async fn close(&self) -> Result<()> {
        if let Some(pipe) = self.pipe.get() {
            pipe.close().await?;
        }

        let Some(mut child) = self.child.lock().await.take() else {
            return Ok(());
        };

        match child.try_wait() {
            Ok(Some(status)) => {
                debug!("Provider process {} already exited: {}", self.name, status);
            }
            Ok(None) => {
                info!("Terminating provider process: {}", self.name);
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill provider process {}: {}", self.name, e);
                }
            }
            Err(e) => {
                warn!("Failed to query provider process {}: {}", self.name, e);
            }
        }

        Ok(())
    }
}
