//! Child session registry
//!
//! Bookkeeping a `ChildSessionGateway` implementation needs: which child
//! sessions are open and which dynamically registered tools each of them
//! exposes. Each session entry sits behind its own lock, so creation and tool
//! registration are serialized per session id and never across sessions.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::session::{ChildSessionRequest, SessionHandle, SessionId, ToolRole, ToolSink};
use crate::tool::ToolSpec;
use crate::{Error, Result};

struct RegisteredTool {
    spec: ToolSpec,
    sink: ToolSink,
}

struct SessionEntry {
    handle: SessionHandle,
    tools: HashMap<String, RegisteredTool>,
    created_at: DateTime<Utc>,
}

/// Registry of open child sessions and their registered tools
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<Mutex<SessionEntry>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, id: &SessionId) -> Result<Arc<Mutex<SessionEntry>>> {
        self.sessions
            .get(id)
            .map(|e| e.value().clone())
            .ok_or_else(|| Error::SessionNotFound(id.to_string()))
    }

    /// Open a new child session for `request`
    pub fn open(&self, request: &ChildSessionRequest) -> SessionHandle {
        let handle = SessionHandle {
            id: SessionId::default(),
            parent: Some(request.parent.clone()),
            person: request.person.clone(),
            depth: request.depth,
        };

        info!(
            session = %handle.id,
            parent = %request.parent,
            person = %request.person,
            depth = request.depth,
            "Opening child session"
        );

        let entry = SessionEntry {
            handle: handle.clone(),
            tools: HashMap::new(),
            created_at: Utc::now(),
        };
        self.sessions
            .insert(handle.id.clone(), Arc::new(Mutex::new(entry)));

        handle
    }

    /// Register a tool on a session, replacing any tool of the same name
    pub async fn register_tool(
        &self,
        session: &SessionId,
        spec: ToolSpec,
        sink: ToolSink,
    ) -> Result<()> {
        let entry = self.entry(session)?;
        let mut entry = entry.lock().await;

        debug!(session = %session, tool = %spec.name, role = ?sink.role(), "Registering tool");
        let name = spec.name.clone();
        if entry
            .tools
            .insert(name, RegisteredTool { spec, sink })
            .is_some()
        {
            debug!(session = %session, "Replaced previously registered tool");
        }
        Ok(())
    }

    /// Route a tool call made by the session's model to its sink.
    ///
    /// Returns whether a delegation was still waiting for it.
    pub async fn invoke_tool(
        &self,
        session: &SessionId,
        tool_name: &str,
        arguments: JsonValue,
    ) -> Result<bool> {
        let entry = self.entry(session)?;
        let entry = entry.lock().await;

        let tool = entry.tools.get(tool_name).ok_or_else(|| {
            Error::Gateway(format!("Unknown tool '{}' on session {}", tool_name, session))
        })?;
        Ok(tool.sink.fire(arguments))
    }

    /// Like `invoke_tool`, addressing the tool by its role
    pub async fn invoke_role(
        &self,
        session: &SessionId,
        role: ToolRole,
        arguments: JsonValue,
    ) -> Result<bool> {
        let entry = self.entry(session)?;
        let entry = entry.lock().await;

        let tool = entry
            .tools
            .values()
            .find(|t| t.sink.role() == role)
            .ok_or_else(|| {
                Error::Gateway(format!("No {:?} tool registered on session {}", role, session))
            })?;
        Ok(tool.sink.fire(arguments))
    }

    /// Drop the named tools from a session
    pub async fn remove_tools(&self, session: &SessionId, names: &[String]) -> Result<()> {
        let entry = self.entry(session)?;
        let mut entry = entry.lock().await;
        for name in names {
            entry.tools.remove(name);
        }
        Ok(())
    }

    /// Specs of the tools registered on a session, sorted by name
    pub async fn registered_tools(&self, session: &SessionId) -> Result<Vec<ToolSpec>> {
        let entry = self.entry(session)?;
        let entry = entry.lock().await;
        let mut specs: Vec<ToolSpec> = entry.tools.values().map(|t| t.spec.clone()).collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(specs)
    }

    pub async fn handle(&self, session: &SessionId) -> Result<SessionHandle> {
        let entry = self.entry(session)?;
        let entry = entry.lock().await;
        Ok(entry.handle.clone())
    }

    /// When the session was opened
    pub async fn opened_at(&self, session: &SessionId) -> Result<DateTime<Utc>> {
        let entry = self.entry(session)?;
        let entry = entry.lock().await;
        Ok(entry.created_at)
    }

    /// Close a session and drop its tools. Returns false if it was not open.
    pub async fn close(&self, session: &SessionId) -> bool {
        match self.sessions.remove(session) {
            Some((_, entry)) => {
                let mut entry = entry.lock().await;
                let dropped = entry.tools.len();
                entry.tools.clear();
                info!(session = %session, tools = dropped, "Closed child session");
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, session: &SessionId) -> bool {
        self.sessions.contains_key(session)
    }

    /// Get the number of open sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Check if no sessions are open
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn request() -> ChildSessionRequest {
        ChildSessionRequest {
            parent: SessionId::new("parent"),
            person: "worker".to_string(),
            depth: 1,
        }
    }

    #[tokio::test]
    async fn test_open_and_close() {
        let registry = SessionRegistry::new();
        let handle = registry.open(&request());

        assert_eq!(registry.len(), 1);
        assert_eq!(handle.parent, Some(SessionId::new("parent")));
        assert_eq!(registry.handle(&handle.id).await.unwrap().depth, 1);

        assert!(registry.close(&handle.id).await);
        assert!(!registry.close(&handle.id).await);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_invoke_registered_tool() {
        let registry = SessionRegistry::new();
        let handle = registry.open(&request());
        let (tx, mut rx) = mpsc::unbounded_channel();

        registry
            .register_tool(
                &handle.id,
                ToolSpec::new("return_result", "Return", vec![]),
                ToolSink::new(ToolRole::Return, "return_result", tx),
            )
            .await
            .unwrap();

        let delivered = registry
            .invoke_tool(&handle.id, "return_result", json!({"ok": true}))
            .await
            .unwrap();
        assert!(delivered);
        assert_eq!(rx.recv().await.unwrap().arguments, json!({"ok": true}));

        let err = registry
            .invoke_tool(&handle.id, "nope", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Gateway(_)));
    }

    #[tokio::test]
    async fn test_close_tears_down_sinks() {
        let registry = SessionRegistry::new();
        let handle = registry.open(&request());
        let (tx, mut rx) = mpsc::unbounded_channel();

        registry
            .register_tool(
                &handle.id,
                ToolSpec::new("report_error", "Report", vec![]),
                ToolSink::new(ToolRole::ErrorReport, "report_error", tx),
            )
            .await
            .unwrap();

        registry.close(&handle.id).await;
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let registry = SessionRegistry::new();
        let err = registry
            .registered_tools(&SessionId::new("missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn test_remove_tools_and_listing() {
        let registry = SessionRegistry::new();
        let handle = registry.open(&request());
        let (tx, _rx) = mpsc::unbounded_channel();

        for name in ["b_tool", "a_tool"] {
            registry
                .register_tool(
                    &handle.id,
                    ToolSpec::new(name, "", vec![]),
                    ToolSink::new(ToolRole::Return, name, tx.clone()),
                )
                .await
                .unwrap();
        }

        let names: Vec<String> = registry
            .registered_tools(&handle.id)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["a_tool", "b_tool"]);

        registry
            .remove_tools(&handle.id, &["a_tool".to_string()])
            .await
            .unwrap();
        assert_eq!(registry.registered_tools(&handle.id).await.unwrap().len(), 1);
    }
}
