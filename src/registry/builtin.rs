//! Tools the bundled provider serves out of the box.

use super::{ToolRegistry, handler_fn};
use crate::error::Result;
use anyhow::Context;
use rmcp::model::{CallToolResult, Content, JsonObject};
use serde::Deserialize;
use serde_json::{Value, json};

pub const ADD_TOOL: &str = "add";

#[derive(Debug, Deserialize)]
struct AddArgs {
    num1: f64,
    num2: f64,
}

pub fn add_schema() -> JsonObject {
    match json!({
        "type": "object",
        "properties": {
            "num1": {"type": "number", "description": "First number"},
            "num2": {"type": "number", "description": "Second number"}
        },
        "required": ["num1", "num2"],
        "additionalProperties": false
    }) {
        Value::Object(schema) => schema,
        _ => JsonObject::new(),
    }
}

/// Render a number the way a JSON peer would: integral values carry no
/// fractional part (`80235`, not `80235.0`).
pub fn format_number(value: f64) -> String {
    const MAX_EXACT: f64 = 9_007_199_254_740_992.0;
    if value.is_finite() && value.fract() == 0.0 && value.abs() <= MAX_EXACT {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}

/// Register every built-in tool
pub fn register_builtin_tools(registry: &mut ToolRegistry) -> Result<()> {
    registry.register(
        ADD_TOOL,
        add_schema(),
        "Add two numbers and return the sum",
        handler_fn(|arguments: JsonObject| async move {
            let args: AddArgs = serde_json::from_value(Value::Object(arguments))
                .context("invalid arguments for add")?;
            let sum = format_number(args.num1 + args.num2);
            Ok(CallToolResult::success(vec![Content::text(sum)]))
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rmcp::model::RawContent;

    fn args(value: Value) -> Option<JsonObject> {
        value.as_object().cloned()
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(80235.0), "80235");
        assert_eq!(format_number(-3.0), "-3");
        assert_eq!(format_number(0.1 + 0.2), "0.30000000000000004");
        assert_eq!(format_number(2.5), "2.5");
    }

    #[tokio::test]
    async fn test_add_tool() {
        let mut registry = ToolRegistry::new();
        register_builtin_tools(&mut registry).unwrap();

        let result = registry
            .invoke(ADD_TOOL, args(json!({"num1": 12345, "num2": 67890})))
            .await
            .unwrap();
        assert_ne!(result.is_error, Some(true));
        match &result.content[0].raw {
            RawContent::Text(t) => assert_eq!(t.text, "80235"),
            other => panic!("expected text content, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_add_rejects_extra_and_missing_fields() {
        let mut registry = ToolRegistry::new();
        register_builtin_tools(&mut registry).unwrap();

        assert!(
            registry
                .invoke(ADD_TOOL, args(json!({"num1": 1})))
                .await
                .is_err()
        );
        assert!(
            registry
                .invoke(ADD_TOOL, args(json!({"num1": 1, "num2": 2, "num3": 3})))
                .await
                .is_err()
        );
    }
}
