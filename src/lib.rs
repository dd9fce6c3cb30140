pub mod config;
pub mod conversation;
pub mod directory;
pub mod dispatch;
pub mod error;
pub mod llm;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod transport;

pub use conversation::{ConversationController, ToolCallRecord, TurnOutcome};
pub use directory::{FunctionDefinition, FunctionTool, ToolDirectory};
pub use dispatch::Dispatcher;
pub use error::{BridgeError, Result};
pub use llm::{ChatMessage, ChatModel, OpenAiChatClient};
pub use registry::{ToolHandler, ToolRegistry, handler_fn};
pub use server::ToolServer;
pub use session::{Session, SessionOptions, SessionState};
pub use transport::{Transport, TransportKind};
