//! Delegation entry point
//!
//! `Delegator` is the tool a parent session's model calls. It checks the
//! arguments against the configured parameters, picks the person that runs
//! the child sessions, and routes to the batch manager when a parallel policy
//! is configured or to the runner otherwise. Paused delegations are parked
//! per child session until they are resumed or their parent closes.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use serde_json::{json, Map, Value as JsonValue};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{AggregationStrategy, DelegationConfig, EngineSettings};
use crate::session::{ChildSessionGateway, SessionId};
use crate::template::TemplateRenderer;
use crate::tool::{ParameterSpec, Tool, ToolContext, ToolResult};
use crate::{Error, Result};

use super::parallel::{BatchManager, BatchRequest};
use super::runner::{DelegationRunner, PausedDelegation, RunOutcome, RunRequest};
use super::types::{BatchResult, DelegationResult, UnitResult};

/// Called with each unit result as a streamed batch produces it
pub type ProgressCallback = Arc<dyn Fn(&UnitResult) + Send + Sync>;

struct Parked {
    parent: SessionId,
    paused: PausedDelegation,
}

/// The delegation capability exposed to a parent session
pub struct Delegator {
    config: Arc<DelegationConfig>,
    gateway: Arc<dyn ChildSessionGateway>,
    runner: DelegationRunner,
    batch: Option<BatchManager>,
    settings: EngineSettings,
    parked: DashMap<SessionId, Parked>,
    progress: Option<ProgressCallback>,
    input_schema: JsonValue,
}

impl Delegator {
    /// Validate `config` and its templates, then build the delegator.
    ///
    /// Every problem is reported at once as `Error::Validation`. Starts from
    /// `EngineSettings::default()`; hosts that want the `NAMING_*` environment
    /// knobs pass `EngineSettings::from_env()` to [`Delegator::with_settings`].
    pub fn new(
        config: DelegationConfig,
        gateway: Arc<dyn ChildSessionGateway>,
        renderer: Arc<dyn TemplateRenderer>,
    ) -> Result<Self> {
        config.validate_with(renderer.as_ref())?;

        let settings = EngineSettings::default();
        let input_schema = config.tool_spec().input_schema();
        let config = Arc::new(config);
        let runner = DelegationRunner::new(config.clone(), gateway.clone(), renderer);
        let batch = config
            .parallel
            .clone()
            .map(|policy| BatchManager::new(runner.clone(), policy, settings.clone()));

        info!(
            function = %config.function_name,
            parallel = batch.is_some(),
            "Delegation capability ready"
        );

        Ok(Self {
            config,
            gateway,
            runner,
            batch,
            settings,
            parked: DashMap::new(),
            progress: None,
            input_schema,
        })
    }

    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.batch = self
            .config
            .parallel
            .clone()
            .map(|policy| BatchManager::new(self.runner.clone(), policy, settings.clone()));
        self.settings = settings;
        self
    }

    /// Observe streamed unit results as they complete
    pub fn on_progress(mut self, callback: impl Fn(&UnitResult) + Send + Sync + 'static) -> Self {
        self.progress = Some(Arc::new(callback));
        self
    }

    pub fn config(&self) -> &DelegationConfig {
        &self.config
    }

    pub fn runner(&self) -> &DelegationRunner {
        &self.runner
    }

    pub fn batch_manager(&self) -> Option<&BatchManager> {
        self.batch.as_ref()
    }

    /// Required parameters that are absent or null
    pub fn missing_parameters(&self, arguments: &Map<String, JsonValue>) -> Vec<&ParameterSpec> {
        self.config
            .parameters
            .iter()
            .filter(|p| p.required)
            .filter(|p| arguments.get(&p.name).is_none_or(JsonValue::is_null))
            .collect()
    }

    /// Person that runs the child sessions for a call from `ctx`
    pub async fn resolve_person(&self, ctx: &ToolContext) -> Result<String> {
        let people = self.gateway.available_people().await?;
        if people.is_empty() {
            return Err(Error::NoPeopleAvailable);
        }

        if let Some(executive) = &self.config.executive_person {
            if people.iter().any(|p| p == executive) {
                return Ok(executive.clone());
            }
            return Err(Error::AssistantNotAvailable(executive.clone()));
        }

        if let Some(person) = ctx.person.as_ref().filter(|p| people.contains(p)) {
            return Ok(person.clone());
        }
        people.into_iter().next().ok_or(Error::NoPeopleAvailable)
    }

    /// Handle one call from the parent model.
    ///
    /// Missing arguments and failed delegations come back as error results
    /// the model can react to. Configuration problems, unavailable people and
    /// cancellation are errors.
    pub async fn invoke(
        &self,
        arguments: Map<String, JsonValue>,
        ctx: &ToolContext,
    ) -> Result<ToolResult> {
        let missing = self.missing_parameters(&arguments);
        if !missing.is_empty() {
            debug!(
                function = %self.config.function_name,
                missing = missing.len(),
                "Rejecting call with missing parameters"
            );
            return Ok(ToolResult::error(missing_parameters_message(&missing)));
        }

        if ctx.depth > self.config.max_recursion_level {
            return Err(Error::RecursionExceeded(format!(
                "delegation depth {} exceeds the maximum recursion level {}",
                ctx.depth, self.config.max_recursion_level
            )));
        }

        let person = self.resolve_person(ctx).await?;

        match &self.batch {
            Some(batch) => self.invoke_batch(batch, arguments, person, ctx).await,
            None => {
                let mut request = RunRequest::new(ctx.session_id.clone(), person, arguments)
                    .with_depth(ctx.depth);
                request.context_session = ctx.context_session.clone();

                let outcome = self.runner.run(request, &ctx.cancel).await?;
                self.single_outcome(&ctx.session_id, outcome).await
            }
        }
    }

    async fn invoke_batch(
        &self,
        batch: &BatchManager,
        arguments: Map<String, JsonValue>,
        person: String,
        ctx: &ToolContext,
    ) -> Result<ToolResult> {
        let request =
            BatchRequest::new(ctx.session_id.clone(), person, arguments).with_depth(ctx.depth);

        let outcome = match batch.strategy() {
            AggregationStrategy::StreamIndividual => self.collect_stream(batch, request, ctx).await,
            _ => batch.run(request, &ctx.cancel).await,
        };
        let mut result = match outcome {
            Ok(result) => result,
            Err(Error::InvalidArguments(message)) => return Ok(ToolResult::error(message)),
            Err(e) => return Err(e),
        };

        for unit_result in result.results.iter_mut() {
            if let Some(paused) = unit_result.paused.take() {
                self.park(&ctx.session_id, paused).await;
            }
        }

        if result.strategy == AggregationStrategy::FirstResultWins {
            return Ok(match result.into_first_success() {
                Ok(winner) => ToolResult::success(winner.payload),
                Err(e) => ToolResult::error(e.to_string()),
            });
        }

        let output = serde_json::to_string_pretty(&result.to_json())?;
        Ok(if result.all_failed() {
            ToolResult::error(output)
        } else {
            ToolResult::success(output)
        })
    }

    async fn collect_stream(
        &self,
        batch: &BatchManager,
        request: BatchRequest,
        ctx: &ToolContext,
    ) -> Result<BatchResult> {
        let started = std::time::Instant::now();
        let mut stream = batch.stream(request, ctx.cancel.clone())?;
        let mut results = Vec::new();

        while let Some(item) = stream.next().await {
            let unit_result = match item {
                Ok(unit_result) => unit_result,
                Err(e) => {
                    abandon_all(results).await;
                    return Err(e);
                }
            };
            if let Some(progress) = &self.progress {
                progress(&unit_result);
            }
            results.push(unit_result);
        }

        if ctx.cancel.is_cancelled() {
            abandon_all(results).await;
            return Err(Error::Cancelled);
        }

        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        Ok(BatchResult::from_units(
            AggregationStrategy::StreamIndividual,
            results,
            None,
            elapsed_ms,
        ))
    }

    async fn single_outcome(&self, parent: &SessionId, outcome: RunOutcome) -> Result<ToolResult> {
        match outcome {
            RunOutcome::Completed(result) => Ok(completed_result(result)),
            RunOutcome::Paused(paused) => {
                let output = json!({
                    "status": "paused",
                    "session_id": paused.session().id,
                    "reason": paused.reason(),
                });
                let parked = self.settings.park_paused;
                self.park(parent, paused).await;
                Ok(if parked {
                    ToolResult::success(output.to_string())
                } else {
                    ToolResult::error(output.to_string())
                })
            }
        }
    }

    async fn park(&self, parent: &SessionId, paused: PausedDelegation) {
        if !self.settings.park_paused {
            paused.abandon().await;
            return;
        }
        let child = paused.session().id.clone();
        info!(parent = %parent, child = %child, "Parking paused delegation");
        self.parked.insert(
            child,
            Parked {
                parent: parent.clone(),
                paused,
            },
        );
    }

    fn take_parked(&self, child: &SessionId) -> Result<Parked> {
        self.parked
            .remove(child)
            .map(|(_, parked)| parked)
            .ok_or_else(|| Error::SessionNotFound(child.to_string()))
    }

    /// Child sessions with a parked delegation
    pub fn paused_sessions(&self) -> Vec<SessionId> {
        let mut sessions: Vec<SessionId> = self.parked.iter().map(|e| e.key().clone()).collect();
        sessions.sort();
        sessions
    }

    /// Keep waiting on a parked delegation for its tool call
    pub async fn resume(&self, child: &SessionId, cancel: &CancellationToken) -> Result<ToolResult> {
        let Parked { parent, paused } = self.take_parked(child)?;
        let outcome = paused.resume(cancel).await?;
        self.single_outcome(&parent, outcome).await
    }

    /// Send `text` into a parked delegation's session and continue it
    pub async fn resume_with_message(
        &self,
        child: &SessionId,
        text: impl Into<String>,
        cancel: &CancellationToken,
    ) -> Result<ToolResult> {
        let Parked { parent, paused } = self.take_parked(child)?;
        let outcome = paused.resume_with_message(text, cancel).await?;
        self.single_outcome(&parent, outcome).await
    }

    /// Abandon every parked delegation of `parent`. Returns how many there were.
    pub async fn close_parent(&self, parent: &SessionId) -> usize {
        let children: Vec<SessionId> = self
            .parked
            .iter()
            .filter(|e| &e.value().parent == parent)
            .map(|e| e.key().clone())
            .collect();

        let mut closed = 0;
        for child in children {
            if let Some((_, parked)) = self.parked.remove(&child) {
                parked.paused.abandon().await;
                closed += 1;
            }
        }
        if closed > 0 {
            info!(parent = %parent, closed, "Released paused delegations of closed session");
        }
        closed
    }
}

async fn abandon_all(results: Vec<UnitResult>) {
    for paused in results.into_iter().filter_map(|r| r.paused) {
        paused.abandon().await;
    }
}

fn completed_result(result: DelegationResult) -> ToolResult {
    if result.success {
        ToolResult::success(result.payload)
    } else {
        warn!(status = %result.status, "Delegation failed: {}", result.payload);
        ToolResult::error(result.payload)
    }
}

fn missing_parameters_message(missing: &[&ParameterSpec]) -> String {
    let mut message = String::from("Missing required parameters:");
    for param in missing {
        if param.description.is_empty() {
            message.push_str(&format!("\n- {}", param.name));
        } else {
            message.push_str(&format!("\n- {}: {}", param.name, param.description));
        }
    }
    message
}

#[async_trait]
impl Tool for Delegator {
    fn name(&self) -> &str {
        &self.config.function_name
    }

    fn description(&self) -> &str {
        &self.config.function_description
    }

    fn input_schema(&self) -> JsonValue {
        self.input_schema.clone()
    }

    async fn execute(&self, input: JsonValue, ctx: &ToolContext) -> Result<ToolResult> {
        match input {
            JsonValue::Object(arguments) => self.invoke(arguments, ctx).await,
            JsonValue::Null => self.invoke(Map::new(), ctx).await,
            other => Ok(ToolResult::error(format!(
                "Arguments must be a JSON object, got {}",
                other
            ))),
        }
    }
}
