//! Tool trait definition
//!
//! Defines the trait a parent session's tool-call dispatcher uses to run a
//! delegation capability.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;

use crate::session::{SessionHandle, SessionId};
use crate::Result;

/// Tool execution result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolResult {
    /// Output string from tool execution
    pub output: String,
    /// Whether the execution resulted in an error
    pub is_error: bool,
}

impl ToolResult {
    /// Create a successful tool result
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            is_error: false,
        }
    }

    /// Create an error tool result
    pub fn error(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            is_error: true,
        }
    }
}

/// Everything a tool call knows about the session that made it
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// Session whose model issued the tool call
    pub session_id: SessionId,
    /// Recursion depth of that session in its delegation chain
    pub depth: u32,
    /// Person driving the invoking session, if known
    pub person: Option<String>,
    /// Existing child session to reuse instead of creating one
    pub context_session: Option<SessionHandle>,
    /// Fires when the caller abandons the call
    pub cancel: CancellationToken,
}

impl ToolContext {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            depth: 0,
            person: None,
            context_session: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_depth(mut self, depth: u32) -> Self {
        self.depth = depth;
        self
    }

    pub fn with_person(mut self, person: impl Into<String>) -> Self {
        self.person = Some(person.into());
        self
    }

    pub fn with_context_session(mut self, session: SessionHandle) -> Self {
        self.context_session = Some(session);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Tool exposed to a parent session's model
#[async_trait]
pub trait Tool: Send + Sync {
    /// Get the tool name (the function name the model calls)
    fn name(&self) -> &str;

    /// Get the tool description (shown to the model when selecting tools)
    fn description(&self) -> &str;

    /// Get the JSON schema for the tool's input parameters
    fn input_schema(&self) -> JsonValue;

    /// Execute the tool with the given input
    ///
    /// # Arguments
    /// * `input` - JSON value containing the tool input parameters
    /// * `ctx` - The invoking session and its cancellation signal
    ///
    /// # Returns
    /// A `ToolResult` containing the output or a recoverable error message
    async fn execute(&self, input: JsonValue, ctx: &ToolContext) -> Result<ToolResult>;
}
