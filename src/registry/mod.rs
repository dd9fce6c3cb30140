pub mod builtin;
pub mod schema;

pub use schema::{SchemaViolation, validate};

use crate::error::{BridgeError, Result};
use async_trait::async_trait;
use futures::FutureExt;
use rmcp::model::{CallToolResult, JsonObject, Tool};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, warn};

/// Executes one tool call. Returning `Err` (or panicking) is contained by the
/// registry and reported to the caller as an `isError` result.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, arguments: JsonObject) -> anyhow::Result<CallToolResult>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> ToolHandler for FnHandler<F>
where
    F: Fn(JsonObject) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<CallToolResult>> + Send + 'static,
{
    async fn call(&self, arguments: JsonObject) -> anyhow::Result<CallToolResult> {
        (self.0)(arguments).await
    }
}

/// Adapt an async closure into a [`ToolHandler`]
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn ToolHandler>
where
    F: Fn(JsonObject) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<CallToolResult>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

#[derive(Clone)]
struct RegisteredTool {
    descriptor: Tool,
    handler: Arc<dyn ToolHandler>,
}

/// Provider-side tool table. Populated at startup, then shared read-only.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Vec<RegisteredTool>,
    index: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool under a unique name
    pub fn register(
        &mut self,
        name: impl Into<String>,
        schema: JsonObject,
        description: impl Into<String>,
        handler: Arc<dyn ToolHandler>,
    ) -> Result<()> {
        let name = name.into();
        if self.index.contains_key(&name) {
            return Err(BridgeError::DuplicateToolName(name));
        }

        debug!("Registering tool: {}", name);
        let description: String = description.into();
        let descriptor = Tool {
            name: name.clone().into(),
            title: None,
            description: (!description.is_empty()).then(|| description.into()),
            input_schema: Arc::new(schema),
            output_schema: None,
            annotations: None,
            icons: None,
            meta: None,
        };
        self.index.insert(name, self.tools.len());
        self.tools.push(RegisteredTool {
            descriptor,
            handler,
        });
        Ok(())
    }

    /// Descriptors in registration order
    pub fn tools(&self) -> Vec<Tool> {
        self.tools.iter().map(|t| t.descriptor.clone()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&Tool> {
        self.index.get(name).map(|&i| &self.tools[i].descriptor)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Validate `arguments` and run the handler.
    ///
    /// Errors are `UnknownTool`, `SchemaValidation` or `HandlerFailure`; the
    /// server turns each of them into an `isError` result.
    pub async fn invoke(&self, name: &str, arguments: Option<JsonObject>) -> Result<CallToolResult> {
        let tool = self
            .index
            .get(name)
            .map(|&i| &self.tools[i])
            .ok_or_else(|| BridgeError::UnknownTool(name.to_string()))?;

        let arguments = arguments.unwrap_or_default();
        let schema = Value::Object(tool.descriptor.input_schema.as_ref().clone());
        validate(&schema, &Value::Object(arguments.clone()))
            .map_err(|v| BridgeError::SchemaValidation(v.to_string()))?;

        let outcome = AssertUnwindSafe(tool.handler.call(arguments))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => {
                warn!("Tool {} failed: {:#}", name, e);
                Err(BridgeError::HandlerFailure(format!("{:#}", e)))
            }
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                warn!("Tool {} panicked: {}", name, reason);
                Err(BridgeError::HandlerFailure(format!("handler panicked: {}", reason)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rmcp::model::{Content, RawContent};
    use serde_json::json;

    fn object(value: Value) -> JsonObject {
        match value {
            Value::Object(map) => map,
            other => panic!("not an object: {}", other),
        }
    }

    fn text_of(result: &CallToolResult) -> String {
        result
            .content
            .iter()
            .filter_map(|c| match &c.raw {
                RawContent::Text(t) => Some(t.text.clone()),
                _ => None,
            })
            .collect()
    }

    fn echo_registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry
            .register(
                "echo",
                object(json!({
                    "type": "object",
                    "properties": {"text": {"type": "string"}},
                    "required": ["text"]
                })),
                "Echo the text back",
                handler_fn(|args: JsonObject| async move {
                    let text = args
                        .get("text")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    Ok(CallToolResult::success(vec![Content::text(text)]))
                }),
            )
            .unwrap();
        registry
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut registry = echo_registry();
        let err = registry
            .register(
                "echo",
                JsonObject::new(),
                "again",
                handler_fn(|_| async { Ok(CallToolResult::success(vec![])) }),
            )
            .unwrap_err();
        assert!(matches!(err, BridgeError::DuplicateToolName(name) if name == "echo"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_tools_in_registration_order() {
        let mut registry = ToolRegistry::new();
        for name in ["zeta", "alpha", "mid"] {
            registry
                .register(
                    name,
                    JsonObject::new(),
                    "",
                    handler_fn(|_| async { Ok(CallToolResult::success(vec![])) }),
                )
                .unwrap();
        }

        let names: Vec<_> = registry.tools().into_iter().map(|t| t.name.to_string()).collect();
        assert_eq!(names, vec!["zeta", "alpha", "mid"]);
        assert!(registry.get("alpha").is_some());
        assert!(registry.get("omega").is_none());
    }

    #[tokio::test]
    async fn test_invoke_success() {
        let registry = echo_registry();
        let result = registry
            .invoke("echo", Some(object(json!({"text": "hi"}))))
            .await
            .unwrap();
        assert_ne!(result.is_error, Some(true));
        assert_eq!(text_of(&result), "hi");
    }

    #[tokio::test]
    async fn test_invoke_unknown_tool() {
        let registry = echo_registry();
        let err = registry.invoke("shout", None).await.unwrap_err();
        assert!(matches!(err, BridgeError::UnknownTool(_)));
    }

    #[tokio::test]
    async fn test_invoke_missing_required_argument() {
        let registry = echo_registry();
        let err = registry.invoke("echo", None).await.unwrap_err();
        match err {
            BridgeError::SchemaValidation(message) => assert!(message.contains("text")),
            other => panic!("expected schema validation error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_handler_error_and_panic_are_contained() {
        let mut registry = ToolRegistry::new();
        registry
            .register(
                "fails",
                JsonObject::new(),
                "",
                handler_fn(|_| async { Err::<CallToolResult, _>(anyhow::anyhow!("disk on fire")) }),
            )
            .unwrap();
        registry
            .register(
                "panics",
                JsonObject::new(),
                "",
                handler_fn(|args: JsonObject| async move {
                    if args.is_empty() {
                        panic!("boom");
                    }
                    Ok(CallToolResult::success(vec![]))
                }),
            )
            .unwrap();

        match registry.invoke("fails", None).await {
            Err(BridgeError::HandlerFailure(message)) => assert!(message.contains("disk on fire")),
            other => panic!("expected handler failure, got {:?}", other),
        }
        match registry.invoke("panics", None).await {
            Err(BridgeError::HandlerFailure(message)) => assert!(message.contains("boom")),
            other => panic!("expected handler failure, got {:?}", other),
        }

        // Registry still serves afterwards
        assert!(registry.invoke("fails", None).await.is_err());
    }
}
