//! One user turn: discover tools, ask the model, run the tool calls it asks
//! for, ask once more. There is exactly one tool round per turn; tool calls
//! requested by the second reply are not executed.

use crate::directory::ToolDirectory;
use crate::dispatch::Dispatcher;
use crate::error::{BridgeError, Result};
use crate::llm::{ChatMessage, ChatModel, ToolCall};
use crate::session::Session;
use rmcp::model::JsonObject;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What happened to one requested tool call
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRecord {
    pub id: String,
    pub name: String,
    pub arguments: String,
    /// Content handed back to the model
    pub output: String,
    pub is_error: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    pub answer: String,
    pub tool_calls: Vec<ToolCallRecord>,
    pub model_queries: usize,
}

pub struct ConversationController {
    model: Arc<dyn ChatModel>,
    directory: ToolDirectory,
    dispatcher: Dispatcher,
    history: Vec<ChatMessage>,
}

impl ConversationController {
    pub fn new(
        model: Arc<dyn ChatModel>,
        session: Arc<Session>,
        system_prompt: Option<String>,
    ) -> Self {
        let history = system_prompt
            .filter(|prompt| !prompt.is_empty())
            .map(ChatMessage::system)
            .into_iter()
            .collect();

        Self {
            model,
            directory: ToolDirectory::new(Arc::clone(&session)),
            dispatcher: Dispatcher::new(session),
            history,
        }
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    /// Run one user turn. A failed turn leaves `history` as it was, so no
    /// assistant tool call is ever left without its tool messages.
    pub async fn run_turn(&mut self, user_message: &str) -> Result<TurnOutcome> {
        let mark = self.history.len();
        let outcome = self.play_turn(user_message).await;
        if outcome.is_err() {
            self.history.truncate(mark);
        }
        outcome
    }

    async fn play_turn(&mut self, user_message: &str) -> Result<TurnOutcome> {
        // Re-discovered every turn: the provider's tool set may change
        let tools = self.directory.function_tools().await?;
        debug!("Offering {} tool(s) to the model", tools.len());

        self.history.push(ChatMessage::user(user_message));

        let first = self.model.complete(&self.history, &tools).await?;
        let requested = first.tool_calls().to_vec();
        self.history.push(first.clone().into());

        if requested.is_empty() {
            return Ok(TurnOutcome {
                answer: first.content.unwrap_or_default(),
                tool_calls: Vec::new(),
                model_queries: 1,
            });
        }

        info!("Model requested {} tool call(s)", requested.len());
        let mut records = Vec::with_capacity(requested.len());
        for call in &requested {
            let record = self.run_tool_call(call).await?;
            self.history
                .push(ChatMessage::tool(record.id.clone(), record.output.clone()));
            records.push(record);
        }

        // No tools on the follow-up query
        let second = self.model.complete(&self.history, &[]).await?;
        if !second.tool_calls().is_empty() {
            warn!(
                "Model requested {} more tool call(s) after the tool round; using its text as the answer",
                second.tool_calls().len()
            );
        }
        let answer = second.content.unwrap_or_default();
        self.history.push(ChatMessage::Assistant {
            content: Some(answer.clone()),
            tool_calls: Vec::new(),
        });

        Ok(TurnOutcome {
            answer,
            tool_calls: records,
            model_queries: 2,
        })
    }

    /// Execute one call. Bad arguments and tool-level failures become error
    /// content for the model; session and transport failures end the turn.
    async fn run_tool_call(&self, call: &ToolCall) -> Result<ToolCallRecord> {
        let mut record = ToolCallRecord {
            id: call.id.clone(),
            name: call.function.name.clone(),
            arguments: call.function.arguments.clone(),
            output: String::new(),
            is_error: true,
        };

        if call.kind != "function" {
            record.output = format!("Unsupported tool call type: {}", call.kind);
            return Ok(record);
        }

        let arguments = match parse_arguments(&call.function.arguments) {
            Ok(arguments) => arguments,
            Err(message) => {
                warn!("Tool call {} has invalid arguments: {}", call.id, message);
                record.output = message;
                return Ok(record);
            }
        };

        match self
            .dispatcher
            .call(&call.id, &call.function.name, Some(arguments))
            .await
        {
            Ok(result) => {
                record.output = serde_json::to_string(&result.content)?;
                record.is_error = result.is_error.unwrap_or(false);
            }
            Err(BridgeError::Protocol { code, message }) => {
                warn!("Provider rejected tool call {}: {}", call.id, message);
                record.output = format!("Tool call failed ({}): {}", code, message);
            }
            Err(e) => return Err(e),
        }

        Ok(record)
    }
}

fn parse_arguments(raw: &str) -> std::result::Result<JsonObject, String> {
    if raw.trim().is_empty() {
        return Ok(JsonObject::new());
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(arguments)) => Ok(arguments),
        Ok(other) => Err(format!("Tool arguments must be a JSON object, got: {}", other)),
        Err(e) => Err(format!("Tool arguments are not valid JSON: {}", e)),
    }
}
