//! Session types

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use tokio::sync::mpsc;

/// Unique identifier for a conversational session
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self(uuid::Uuid::now_v7().to_string())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A child session created by the gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHandle {
    pub id: SessionId,
    /// Session that spawned this one
    pub parent: Option<SessionId>,
    /// Person executing the session
    pub person: String,
    /// Position in the delegation chain (the parent's depth + 1)
    pub depth: u32,
}

/// What the engine asks the gateway for when it needs a new child session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildSessionRequest {
    pub parent: SessionId,
    pub person: String,
    pub depth: u32,
}

/// Which of the dynamically registered tools fired
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolRole {
    Return,
    ErrorReport,
}

/// A call a child session made to one of the registered tools
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub role: ToolRole,
    pub tool_name: String,
    pub arguments: JsonValue,
}

/// Handed to the gateway with each registered tool; the gateway fires it when
/// the child session calls that tool.
///
/// All sinks of one delegation feed the same slot, and the runner takes the
/// first invocation of each wait. Dropping every sink (session teardown) is
/// observed by the runner as a closed session.
#[derive(Debug, Clone)]
pub struct ToolSink {
    role: ToolRole,
    tool_name: String,
    tx: mpsc::UnboundedSender<ToolInvocation>,
}

impl ToolSink {
    pub(crate) fn new(
        role: ToolRole,
        tool_name: impl Into<String>,
        tx: mpsc::UnboundedSender<ToolInvocation>,
    ) -> Self {
        Self {
            role,
            tool_name: tool_name.into(),
            tx,
        }
    }

    pub fn role(&self) -> ToolRole {
        self.role
    }

    pub fn tool_name(&self) -> &str {
        &self.tool_name
    }

    /// Deliver the child's call. Returns false when nobody is waiting anymore.
    pub fn fire(&self, arguments: JsonValue) -> bool {
        self.tx
            .send(ToolInvocation {
                role: self.role,
                tool_name: self.tool_name.clone(),
                arguments,
            })
            .is_ok()
    }
}
