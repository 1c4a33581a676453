//! Single-delegation runner
//!
//! Drives one child session through
//! `Rendering -> AwaitingReturn -> (Urge | ReportError | Pause) -> Terminal`.
//!
//! The return tool and the error-report tool are registered with sinks that
//! feed one channel. Each wait resolves on the first tool call delivered
//! through it, or on the end of the child's turn when nothing was delivered
//! (a dangling session).

use std::fmt;
use std::sync::Arc;

use serde_json::{json, Map, Value as JsonValue};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{DanglingBehavior, DelegationConfig, ErrorBehavior};
use crate::session::{
    ChildSessionGateway, ChildSessionRequest, SessionHandle, SessionId, ToolInvocation, ToolRole,
    ToolSink,
};
use crate::template::TemplateRenderer;
use crate::{Error, Result};

use super::types::{DelegationResult, DelegationStatus, SubTaskUnit};

/// Context keys that always come from the engine, never from arguments
const RESERVED_KEYS: [&str; 5] = ["parameters", "current_parameter", "config", "depth", "urge_count"];

/// One delegation request
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Caller-supplied arguments, shared by every unit of a batch
    pub arguments: Map<String, JsonValue>,
    /// The unit being run when part of a batch
    pub unit: Option<SubTaskUnit>,
    /// Session that asked for the delegation
    pub parent: SessionId,
    /// Person that runs the child session
    pub person: String,
    /// Recursion depth the delegation starts at
    pub depth: u32,
    /// Existing session to reuse instead of creating a child
    pub context_session: Option<SessionHandle>,
}

impl RunRequest {
    pub fn new(
        parent: SessionId,
        person: impl Into<String>,
        arguments: Map<String, JsonValue>,
    ) -> Self {
        Self {
            arguments,
            unit: None,
            parent,
            person: person.into(),
            depth: 0,
            context_session: None,
        }
    }

    pub fn with_unit(mut self, unit: SubTaskUnit) -> Self {
        self.unit = Some(unit);
        self
    }

    pub fn with_depth(mut self, depth: u32) -> Self {
        self.depth = depth;
        self
    }

    pub fn with_context_session(mut self, session: SessionHandle) -> Self {
        self.context_session = Some(session);
        self
    }
}

/// What a run hands back
#[derive(Debug)]
pub enum RunOutcome {
    Completed(DelegationResult),
    /// Waiting for external intervention; the child session stays open
    Paused(PausedDelegation),
}

impl RunOutcome {
    pub fn is_paused(&self) -> bool {
        matches!(self, Self::Paused(_))
    }

    pub fn into_completed(self) -> Option<DelegationResult> {
        match self {
            Self::Completed(result) => Some(result),
            Self::Paused(_) => None,
        }
    }
}

/// How one wait on the child session ended
enum Turn {
    Invoked(ToolInvocation),
    /// The turn ended without a tool call; holds the child's plain answer
    Dangling(String),
    /// Every sink was dropped, the session was torn down
    Closed,
    SendFailed(String),
    Cancelled,
}

/// Live state of a delegation waiting on its child session
struct Pending {
    session: SessionHandle,
    /// Whether the session was created by this delegation
    owned: bool,
    rx: mpsc::UnboundedReceiver<ToolInvocation>,
    tool_names: Vec<String>,
    context: Map<String, JsonValue>,
    depth: u32,
    urge_count: u32,
}

/// Drives child sessions for one delegation config
#[derive(Clone)]
pub struct DelegationRunner {
    config: Arc<DelegationConfig>,
    gateway: Arc<dyn ChildSessionGateway>,
    renderer: Arc<dyn TemplateRenderer>,
}

impl DelegationRunner {
    pub fn new(
        config: Arc<DelegationConfig>,
        gateway: Arc<dyn ChildSessionGateway>,
        renderer: Arc<dyn TemplateRenderer>,
    ) -> Self {
        Self {
            config,
            gateway,
            renderer,
        }
    }

    pub fn config(&self) -> &DelegationConfig {
        &self.config
    }

    pub fn template_context(&self, request: &RunRequest) -> Map<String, JsonValue> {
        template_context(&self.config, request)
    }

    /// Run one delegation to a terminal outcome or a pause.
    ///
    /// Template failures and cancellation are errors. Every other way a child
    /// session can fail is a failed `DelegationResult`.
    pub async fn run(&self, request: RunRequest, cancel: &CancellationToken) -> Result<RunOutcome> {
        let context = self.template_context(&request);
        let prompt = self
            .renderer
            .render(&self.config.prompt_template, &JsonValue::Object(context.clone()))?;

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let (session, owned) = match request.context_session.clone() {
            Some(session) => {
                debug!(session = %session.id, "Reusing context session");
                (session, false)
            }
            None => {
                let create = self.gateway.create_child_session(ChildSessionRequest {
                    parent: request.parent.clone(),
                    person: request.person.clone(),
                    depth: request.depth + 1,
                });
                let created = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    created = create => created,
                };
                match created {
                    Ok(session) => (session, true),
                    Err(e) => {
                        error!(parent = %request.parent, person = %request.person, "Failed to create child session: {}", e);
                        return Ok(RunOutcome::Completed(DelegationResult::failed(
                            DelegationStatus::SessionUnavailable,
                            format!("Failed to create child session: {}", e),
                        )));
                    }
                }
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let mut pending = Pending {
            session,
            owned,
            rx,
            tool_names: vec![],
            context,
            depth: request.depth,
            urge_count: 0,
        };

        if let Err(e) = self.register_tools(&mut pending, tx).await {
            error!(session = %pending.session.id, "Failed to register delegation tools: {}", e);
            let message = format!("Failed to register tools on child session: {}", e);
            return Ok(self
                .finish(
                    pending,
                    DelegationResult::failed(DelegationStatus::SessionUnavailable, message),
                )
                .await);
        }

        info!(
            session = %pending.session.id,
            function = %self.config.function_name,
            unit = ?request.unit.as_ref().map(|u| u.index),
            depth = pending.depth,
            "Delegating to child session"
        );

        self.drive(pending, Some(prompt), cancel).await
    }

    async fn register_tools(
        &self,
        pending: &mut Pending,
        tx: mpsc::UnboundedSender<ToolInvocation>,
    ) -> Result<()> {
        let return_spec = self.config.return_tool_spec();
        let sink = ToolSink::new(ToolRole::Return, &return_spec.name, tx.clone());
        pending.tool_names.push(return_spec.name.clone());
        self.gateway
            .register_tool(&pending.session, return_spec, sink)
            .await?;

        if let Some(error_spec) = self.config.error_tool_spec() {
            let sink = ToolSink::new(ToolRole::ErrorReport, &error_spec.name, tx);
            pending.tool_names.push(error_spec.name.clone());
            self.gateway
                .register_tool(&pending.session, error_spec, sink)
                .await?;
        }
        Ok(())
    }

    /// The AwaitingReturn loop. `message` is sent before the first wait;
    /// without one the loop only listens.
    async fn drive(
        &self,
        mut pending: Pending,
        mut message: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome> {
        loop {
            let turn = self
                .exchange(&pending.session, message.take(), &mut pending.rx, cancel)
                .await;

            match turn {
                Turn::Invoked(invocation) => match invocation.role {
                    ToolRole::Return => {
                        let payload = serde_json::to_string(&invocation.arguments)?;
                        return Ok(self.finish(pending, DelegationResult::succeeded(payload)).await);
                    }
                    ToolRole::ErrorReport => {
                        let reported = reported_error(&invocation.arguments);
                        warn!(session = %pending.session.id, error = %reported, "Child session reported an error");
                        return match self.config.error_behavior() {
                            ErrorBehavior::Fail => Ok(self
                                .finish(
                                    pending,
                                    DelegationResult::failed(DelegationStatus::ErrorReported, reported),
                                )
                                .await),
                            ErrorBehavior::Pause => Ok(self.pause(pending, reported)),
                        };
                    }
                },
                Turn::Dangling(answer) => {
                    warn!(
                        session = %pending.session.id,
                        depth = pending.depth,
                        behavior = %self.config.dangling_behavior,
                        answer_len = answer.len(),
                        "Child session ended its turn without calling a tool"
                    );
                    match self.config.dangling_behavior {
                        DanglingBehavior::ReportError => {
                            let failure = DelegationResult::failed(
                                DelegationStatus::Dangling,
                                self.config.dangling_error_message(),
                            );
                            return Ok(self.finish(pending, failure).await);
                        }
                        DanglingBehavior::Pause => {
                            if pending.depth >= self.config.max_recursion_level {
                                let failure = self.recursion_exceeded(&pending);
                                return Ok(self.finish(pending, failure).await);
                            }
                            let reason = format!(
                                "Child session answered without calling '{}'",
                                self.config.return_tool.name
                            );
                            return Ok(self.pause(pending, reason));
                        }
                        DanglingBehavior::Urge => {
                            if pending.depth >= self.config.max_recursion_level {
                                let failure = self.recursion_exceeded(&pending);
                                return Ok(self.finish(pending, failure).await);
                            }

                            pending.depth += 1;
                            pending.urge_count += 1;
                            pending.context.insert("depth".into(), json!(pending.depth));
                            pending
                                .context
                                .insert("urge_count".into(), json!(pending.urge_count));

                            let context = JsonValue::Object(pending.context.clone());
                            let urging = match self.renderer.render(&self.config.urging_template, &context) {
                                Ok(urging) => urging,
                                Err(e) => {
                                    self.teardown(&pending).await;
                                    return Err(e.into());
                                }
                            };
                            debug!(session = %pending.session.id, urge = pending.urge_count, "Urging child session");
                            message = Some(urging);
                        }
                    }
                }
                Turn::Closed => {
                    let failure = DelegationResult::failed(
                        DelegationStatus::SessionUnavailable,
                        "Child session closed before calling the return tool",
                    );
                    return Ok(self.finish(pending, failure).await);
                }
                Turn::SendFailed(e) => {
                    error!(session = %pending.session.id, "Failed to message child session: {}", e);
                    let failure = DelegationResult::failed(
                        DelegationStatus::SessionUnavailable,
                        format!("Failed to message child session: {}", e),
                    );
                    return Ok(self.finish(pending, failure).await);
                }
                Turn::Cancelled => {
                    self.abort(&pending).await;
                    return Err(Error::Cancelled);
                }
            }
        }
    }

    /// Send `message` (if any) and wait for a tool call or the end of the turn
    async fn exchange(
        &self,
        session: &SessionHandle,
        message: Option<String>,
        rx: &mut mpsc::UnboundedReceiver<ToolInvocation>,
        cancel: &CancellationToken,
    ) -> Turn {
        let Some(message) = message else {
            return tokio::select! {
                biased;
                _ = cancel.cancelled() => Turn::Cancelled,
                invocation = rx.recv() => match invocation {
                    Some(invocation) => Turn::Invoked(invocation),
                    None => Turn::Closed,
                },
            };
        };

        let send = self.gateway.send_message(session, &message);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Turn::Cancelled,
            Some(invocation) = rx.recv() => Turn::Invoked(invocation),
            reply = send => match reply {
                Err(e) => Turn::SendFailed(e.to_string()),
                Ok(answer) => match rx.try_recv() {
                    Ok(invocation) => Turn::Invoked(invocation),
                    Err(TryRecvError::Empty) => Turn::Dangling(answer),
                    Err(TryRecvError::Disconnected) => Turn::Closed,
                },
            },
        }
    }

    fn recursion_exceeded(&self, pending: &Pending) -> DelegationResult {
        DelegationResult::failed(
            DelegationStatus::RecursionExceeded,
            format!(
                "Recursion limit exceeded: child session did not call '{}' after {} urging message(s), retries exhausted",
                self.config.return_tool.name, pending.urge_count
            ),
        )
    }

    fn pause(&self, pending: Pending, reason: impl Into<String>) -> RunOutcome {
        let reason = reason.into();
        info!(session = %pending.session.id, reason = %reason, "Delegation paused");
        RunOutcome::Paused(PausedDelegation {
            runner: self.clone(),
            pending,
            reason,
        })
    }

    async fn finish(&self, pending: Pending, result: DelegationResult) -> RunOutcome {
        self.teardown(&pending).await;
        info!(
            session = %pending.session.id,
            status = %result.status,
            urges = pending.urge_count,
            "Delegation finished"
        );
        RunOutcome::Completed(
            result
                .with_session(pending.session.id.clone())
                .with_urge_count(pending.urge_count),
        )
    }

    /// Close a session this delegation created, or just take back its tools
    async fn teardown(&self, pending: &Pending) {
        let outcome = if pending.owned {
            self.gateway.dispose(&pending.session).await
        } else {
            self.gateway
                .unregister_tools(&pending.session, &pending.tool_names)
                .await
        };
        if let Err(e) = outcome {
            error!(session = %pending.session.id, "Failed to tear down child session: {}", e);
        }
    }

    async fn abort(&self, pending: &Pending) {
        warn!(session = %pending.session.id, "Delegation cancelled");
        if let Err(e) = self.gateway.cancel(&pending.session).await {
            error!(session = %pending.session.id, "Failed to cancel child session: {}", e);
        }
        self.teardown(pending).await;
    }
}

/// Variables visible to the prompt and urging templates: the arguments at
/// top level, plus `parameters`, `current_parameter`, `config`, `depth` and
/// `urge_count`
pub fn template_context(config: &DelegationConfig, request: &RunRequest) -> Map<String, JsonValue> {
    let mut context = request.arguments.clone();
    for key in RESERVED_KEYS {
        if context.contains_key(key) {
            debug!(key, "Argument shadowed by a reserved template variable");
        }
    }

    context.insert(
        "parameters".into(),
        JsonValue::Object(request.arguments.clone()),
    );
    context.insert(
        "current_parameter".into(),
        request
            .unit
            .as_ref()
            .map(SubTaskUnit::binding)
            .unwrap_or(JsonValue::Null),
    );
    context.insert(
        "config".into(),
        json!({
            "function_name": config.function_name,
            "function_description": config.function_description,
            "max_recursion_level": config.max_recursion_level,
            "return_tool": config.return_tool.name,
            "error_tool": config.error_tool.as_ref().map(|t| t.name.clone()),
        }),
    );
    context.insert("depth".into(), json!(request.depth));
    context.insert("urge_count".into(), json!(0));
    context
}

/// Message carried by an error-report call
fn reported_error(arguments: &JsonValue) -> String {
    match arguments {
        JsonValue::String(message) => message.clone(),
        JsonValue::Object(fields) => ["message", "error", "reason"]
            .iter()
            .find_map(|key| fields.get(*key).and_then(JsonValue::as_str))
            .map(str::to_string)
            .unwrap_or_else(|| arguments.to_string()),
        other => other.to_string(),
    }
}

/// A delegation stopped for external intervention.
///
/// The child session and its registered tools stay alive. Resuming waits
/// for the child to call one of the tools again; abandoning tears the
/// session down.
pub struct PausedDelegation {
    runner: DelegationRunner,
    pending: Pending,
    reason: String,
}

impl PausedDelegation {
    pub fn session(&self) -> &SessionHandle {
        &self.pending.session
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn depth(&self) -> u32 {
        self.pending.depth
    }

    /// Wait for the child to call a tool without sending anything
    pub async fn resume(self, cancel: &CancellationToken) -> Result<RunOutcome> {
        info!(session = %self.pending.session.id, "Resuming paused delegation");
        self.runner.drive(self.pending, None, cancel).await
    }

    /// Send `text` into the child session, then continue the delegation
    pub async fn resume_with_message(
        self,
        text: impl Into<String>,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome> {
        info!(session = %self.pending.session.id, "Resuming paused delegation with a message");
        self.runner.drive(self.pending, Some(text.into()), cancel).await
    }

    /// Give up on the delegation and release its session
    pub async fn abandon(self) {
        info!(session = %self.pending.session.id, "Abandoning paused delegation");
        self.runner.teardown(&self.pending).await;
    }
}

impl fmt::Debug for PausedDelegation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PausedDelegation")
            .field("session", &self.pending.session.id)
            .field("reason", &self.reason)
            .field("depth", &self.pending.depth)
            .finish()
    }
}
