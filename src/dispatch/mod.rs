use crate::error::{BridgeError, Result};
use crate::protocol::{RequestId, error_codes, methods};
use crate::session::Session;
use rmcp::model::{CallToolRequestParams, CallToolResult, JsonObject, RawContent};
use std::sync::Arc;
use tracing::{debug, info};

/// Sends `tools/call` requests and waits for their results.
///
/// No timeout is imposed here: a call resolves when its response arrives or
/// fails with `ConnectionLost` when the session closes under it.
pub struct Dispatcher {
    session: Arc<Session>,
}

impl Dispatcher {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    /// Invoke `name` under the caller's call id, which becomes the request id
    pub async fn call(
        &self,
        call_id: &str,
        name: &str,
        arguments: Option<JsonObject>,
    ) -> Result<CallToolResult> {
        info!("Calling tool {} ({})", name, call_id);

        let params = CallToolRequestParams {
            meta: None,
            name: name.to_string().into(),
            arguments,
            task: None,
        };
        let value = self
            .session
            .request_with_id(
                RequestId::from(call_id),
                methods::TOOLS_CALL,
                Some(serde_json::to_value(params)?),
            )
            .await?;

        let result: CallToolResult = serde_json::from_value(value).map_err(|e| {
            BridgeError::protocol(
                error_codes::INTERNAL_ERROR,
                format!("Malformed tools/call result: {}", e),
            )
        })?;

        debug!(
            "Tool {} ({}) returned {} content block(s), isError={:?}",
            name,
            call_id,
            result.content.len(),
            result.is_error
        );
        Ok(result)
    }
}

/// Concatenated text blocks of a result; other media kinds are skipped
pub fn result_text(result: &CallToolResult) -> String {
    result
        .content
        .iter()
        .filter_map(|c| match &c.raw {
            RawContent::Text(t) => Some(t.text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{SessionOptions, SessionState};
    use crate::transport::{MemoryTransport, Transport};
    use rmcp::model::Content;

    #[tokio::test]
    async fn test_call_before_ready_sends_nothing() {
        let (ours, theirs) = MemoryTransport::pair();
        let session = Arc::new(Session::new(Arc::new(ours), SessionOptions::default()));
        let dispatcher = Dispatcher::new(session);

        let err = dispatcher.call("call_1", "add", None).await.unwrap_err();
        assert!(matches!(
            err,
            BridgeError::SessionNotReady(SessionState::Uninitialized)
        ));

        let idle =
            tokio::time::timeout(std::time::Duration::from_millis(50), theirs.receive()).await;
        assert!(idle.is_err());
    }

    #[test]
    fn test_result_text_joins_text_blocks() {
        let result = CallToolResult::success(vec![Content::text("80"), Content::text("235")]);
        assert_eq!(result_text(&result), "80\n235");
    }
}
