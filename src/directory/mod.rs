//! Consumer-side view of a provider's tools, and their translation into the
//! function-calling shape chat models accept.

use crate::error::Result;
use crate::protocol::methods;
use crate::session::Session;
use rmcp::model::{ListToolsResult, PaginatedRequestParams, Tool};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// Upper bound on `tools/list` pages followed in one discovery
const MAX_PAGES: usize = 100;

/// `{ "type": "function", "function": { name, description, parameters } }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionTool {
    #[serde(rename = "type")]
    pub kind: String,
    pub function: FunctionDefinition,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Map one descriptor 1:1; the schema passes through untouched and a
/// missing description becomes `""`.
pub fn translate(tool: &Tool) -> FunctionTool {
    FunctionTool {
        kind: "function".to_string(),
        function: FunctionDefinition {
            name: tool.name.to_string(),
            description: tool
                .description
                .as_deref()
                .unwrap_or_default()
                .to_string(),
            parameters: Value::Object(tool.input_schema.as_ref().clone()),
        },
    }
}

pub fn translate_all(tools: &[Tool]) -> Vec<FunctionTool> {
    tools.iter().map(translate).collect()
}

/// Lists tools over a ready session
pub struct ToolDirectory {
    session: Arc<Session>,
}

impl ToolDirectory {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    /// Every descriptor the provider offers, following `nextCursor` to the end
    pub async fn discover(&self) -> Result<Vec<Tool>> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        for page in 0..MAX_PAGES {
            let params = cursor.take().map(|cursor| PaginatedRequestParams {
                meta: None,
                cursor: Some(cursor),
            });
            let params = params.map(serde_json::to_value).transpose()?;

            let value = self.session.request(methods::TOOLS_LIST, params).await?;
            let result: ListToolsResult = serde_json::from_value(value)?;
            debug!("tools/list page {} returned {} tool(s)", page, result.tools.len());
            tools.extend(result.tools);

            match result.next_cursor {
                Some(next) => cursor = Some(next),
                None => return Ok(tools),
            }
        }

        tracing::warn!("Stopped following tools/list after {} pages", MAX_PAGES);
        Ok(tools)
    }

    /// `discover` followed by `translate`
    pub async fn function_tools(&self) -> Result<Vec<FunctionTool>> {
        Ok(translate_all(&self.discover().await?))
    }
}
