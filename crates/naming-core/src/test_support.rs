//! Scripted child-session gateway for tests
//!
//! Child sessions follow a `ChildScript` picked from the first message they
//! receive: the first rule whose text occurs in that message, or the default
//! script. Everything the engine does is recorded for assertions.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value as JsonValue;

use crate::session::{
    ChildSessionGateway, ChildSessionRequest, SessionHandle, SessionId, SessionRegistry, ToolRole,
    ToolSink,
};
use crate::tool::ToolSpec;
use crate::{Error, Result};

#[derive(Debug, Clone)]
enum ChildAction {
    Return(JsonValue),
    ReportError(JsonValue),
    Reply(String),
    /// Answer plainly until the n-th message, then call the return tool
    ReturnOnMessage(usize, JsonValue),
    SendFails(String),
}

/// How a scripted child session behaves on every message
#[derive(Debug, Clone)]
pub(crate) struct ChildScript {
    delay: Option<Duration>,
    action: ChildAction,
}

impl ChildScript {
    fn new(action: ChildAction) -> Self {
        Self { delay: None, action }
    }

    pub(crate) fn returns(arguments: JsonValue) -> Self {
        Self::new(ChildAction::Return(arguments))
    }

    pub(crate) fn reports_error(arguments: JsonValue) -> Self {
        Self::new(ChildAction::ReportError(arguments))
    }

    pub(crate) fn replies(text: impl Into<String>) -> Self {
        Self::new(ChildAction::Reply(text.into()))
    }

    pub(crate) fn returns_on_message(message: usize, arguments: JsonValue) -> Self {
        Self::new(ChildAction::ReturnOnMessage(message, arguments))
    }

    pub(crate) fn send_fails(message: impl Into<String>) -> Self {
        Self::new(ChildAction::SendFails(message.into()))
    }

    /// Take `delay` before answering each message
    pub(crate) fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[derive(Default)]
struct Log {
    created: Vec<SessionHandle>,
    messages: Vec<(SessionId, String)>,
    disposed: Vec<SessionId>,
    cancelled: Vec<SessionId>,
    tool_names: BTreeSet<String>,
}

pub(crate) struct ScriptedGateway {
    registry: SessionRegistry,
    people: Vec<String>,
    default_script: ChildScript,
    rules: Vec<(String, ChildScript)>,
    /// Script and message count per session
    assigned: DashMap<SessionId, (ChildScript, usize)>,
    log: Mutex<Log>,
    active: AtomicUsize,
    peak: AtomicUsize,
    fail_create: bool,
}

impl ScriptedGateway {
    pub(crate) fn new(default_script: ChildScript) -> Self {
        Self {
            registry: SessionRegistry::new(),
            people: vec!["worker".to_string()],
            default_script,
            rules: vec![],
            assigned: DashMap::new(),
            log: Mutex::new(Log::default()),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            fail_create: false,
        }
    }

    /// Sessions whose first message contains `needle` follow `script`
    pub(crate) fn with_rule(mut self, needle: impl Into<String>, script: ChildScript) -> Self {
        self.rules.push((needle.into(), script));
        self
    }

    pub(crate) fn with_people(mut self, people: Vec<String>) -> Self {
        self.people = people;
        self
    }

    pub(crate) fn failing_creation(mut self) -> Self {
        self.fail_create = true;
        self
    }

    pub(crate) fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub(crate) fn created(&self) -> Vec<SessionHandle> {
        self.log.lock().unwrap().created.clone()
    }

    /// Every message sent to any session, in send order
    pub(crate) fn messages(&self) -> Vec<String> {
        self.log
            .lock()
            .unwrap()
            .messages
            .iter()
            .map(|(_, text)| text.clone())
            .collect()
    }

    pub(crate) fn messages_containing(&self, needle: &str) -> usize {
        self.messages().iter().filter(|m| m.contains(needle)).count()
    }

    pub(crate) fn disposed(&self) -> Vec<SessionId> {
        self.log.lock().unwrap().disposed.clone()
    }

    pub(crate) fn cancelled(&self) -> Vec<SessionId> {
        self.log.lock().unwrap().cancelled.clone()
    }

    /// Every tool name ever registered, sorted
    pub(crate) fn registered_tool_names(&self) -> Vec<String> {
        self.log.lock().unwrap().tool_names.iter().cloned().collect()
    }

    pub(crate) fn open_sessions(&self) -> usize {
        self.registry.len()
    }

    /// Most child sessions open at the same time
    pub(crate) fn peak_active(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn next_step(&self, session: &SessionId, text: &str) -> (ChildScript, usize) {
        let mut entry = self.assigned.entry(session.clone()).or_insert_with(|| {
            let script = self
                .rules
                .iter()
                .find(|(needle, _)| text.contains(needle.as_str()))
                .map(|(_, script)| script.clone())
                .unwrap_or_else(|| self.default_script.clone());
            (script, 0)
        });
        entry.1 += 1;
        (entry.0.clone(), entry.1)
    }
}

#[async_trait]
impl ChildSessionGateway for ScriptedGateway {
    async fn available_people(&self) -> Result<Vec<String>> {
        Ok(self.people.clone())
    }

    async fn create_child_session(&self, request: ChildSessionRequest) -> Result<SessionHandle> {
        if self.fail_create {
            return Err(Error::Gateway("session limit reached".to_string()));
        }
        let handle = self.registry.open(&request);
        self.log.lock().unwrap().created.push(handle.clone());

        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);
        Ok(handle)
    }

    async fn register_tool(
        &self,
        session: &SessionHandle,
        spec: ToolSpec,
        sink: ToolSink,
    ) -> Result<()> {
        self.log.lock().unwrap().tool_names.insert(spec.name.clone());
        self.registry.register_tool(&session.id, spec, sink).await
    }

    async fn send_message(&self, session: &SessionHandle, text: &str) -> Result<String> {
        self.log
            .lock()
            .unwrap()
            .messages
            .push((session.id.clone(), text.to_string()));

        let (script, count) = self.next_step(&session.id, text);
        if let Some(delay) = script.delay {
            tokio::time::sleep(delay).await;
        }

        match script.action {
            ChildAction::Return(arguments) => {
                self.registry
                    .invoke_role(&session.id, ToolRole::Return, arguments)
                    .await?;
                Ok("Done.".to_string())
            }
            ChildAction::ReportError(arguments) => {
                self.registry
                    .invoke_role(&session.id, ToolRole::ErrorReport, arguments)
                    .await?;
                Ok("I could not finish.".to_string())
            }
            ChildAction::Reply(text) => Ok(text),
            ChildAction::ReturnOnMessage(message, arguments) if count >= message => {
                self.registry
                    .invoke_role(&session.id, ToolRole::Return, arguments)
                    .await?;
                Ok("Done.".to_string())
            }
            ChildAction::ReturnOnMessage(..) => Ok("Still thinking about it.".to_string()),
            ChildAction::SendFails(message) => Err(Error::Gateway(message)),
        }
    }

    async fn unregister_tools(&self, session: &SessionHandle, names: &[String]) -> Result<()> {
        self.registry.remove_tools(&session.id, names).await
    }

    async fn cancel(&self, session: &SessionHandle) -> Result<()> {
        self.log.lock().unwrap().cancelled.push(session.id.clone());
        let names: Vec<String> = self
            .registry
            .registered_tools(&session.id)
            .await
            .map(|specs| specs.into_iter().map(|s| s.name).collect())
            .unwrap_or_default();
        if names.is_empty() {
            return Ok(());
        }
        self.registry.remove_tools(&session.id, &names).await
    }

    async fn dispose(&self, session: &SessionHandle) -> Result<()> {
        self.log.lock().unwrap().disposed.push(session.id.clone());
        if self.registry.close(&session.id).await {
            self.active.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}
