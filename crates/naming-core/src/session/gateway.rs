//! Child session gateway
//!
//! The host application owns conversational sessions. The engine only needs
//! to create subordinate sessions, register tools on them, send them text,
//! and tear them down.

use async_trait::async_trait;

use crate::session::{ChildSessionRequest, SessionHandle, ToolSink};
use crate::tool::ToolSpec;
use crate::Result;

#[async_trait]
pub trait ChildSessionGateway: Send + Sync {
    /// Names of the people (assistant identities) that can run a session
    async fn available_people(&self) -> Result<Vec<String>>;

    /// Start a session parented to `request.parent`, executed by `request.person`
    async fn create_child_session(&self, request: ChildSessionRequest) -> Result<SessionHandle>;

    /// Make `spec` callable by the session's model; calls are delivered to `sink`
    async fn register_tool(
        &self,
        session: &SessionHandle,
        spec: ToolSpec,
        sink: ToolSink,
    ) -> Result<()>;

    /// Send a message and wait for the session's turn to end.
    ///
    /// Returns the plain-text answer of the turn. Tool calls made during the
    /// turn are delivered through the registered sinks before this returns.
    async fn send_message(&self, session: &SessionHandle, text: &str) -> Result<String>;

    /// Remove tools from a session the engine did not create
    async fn unregister_tools(&self, _session: &SessionHandle, _names: &[String]) -> Result<()> {
        Ok(())
    }

    /// Abort whatever the session is doing and drop its registered tools
    async fn cancel(&self, session: &SessionHandle) -> Result<()>;

    /// Close the session and drop its registered tools
    async fn dispose(&self, session: &SessionHandle) -> Result<()>;
}
