//! Delegation configuration
//!
//! A `DelegationConfig` describes one delegation capability: the function the
//! parent model calls, the prompt sent to the child session, the return tool
//! the child must call, and what to do when it does not. It is loaded once per
//! plugin instance (see `loader`) and shared read-only by every invocation.

mod loader;
mod settings;
mod validation;

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::tool::{ParameterSpec, ToolSpec};

pub use settings::EngineSettings;
pub use validation::{ValidationErrors, ValidationIssue};

/// Failure message used when a dangling child session is reported and no
/// custom message is configured
pub const DEFAULT_DANGLING_ERROR: &str = "Child session failed to call the return tool";

fn default_return_tool_name() -> String {
    "return_result".to_string()
}

fn default_return_tool_description() -> String {
    "Call this tool to return the result of your task. Calling it ends the task.".to_string()
}

fn default_error_tool_name() -> String {
    "report_error".to_string()
}

fn default_error_tool_description() -> String {
    "Call this tool if you cannot complete the task, explaining why.".to_string()
}

fn default_max_recursion_level() -> u32 {
    3
}

/// Full description of one delegation capability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegationConfig {
    /// Function name exposed to the parent model
    pub function_name: String,

    #[serde(default)]
    pub function_description: String,

    /// Input parameters of the function, in declaration order
    #[serde(default)]
    pub parameters: Vec<ParameterSpec>,

    /// Prompt sent to the child session
    pub prompt_template: String,

    /// Reminder sent to a dangling child session; must not be empty
    #[serde(default)]
    pub urging_template: String,

    #[serde(default)]
    pub return_tool: ReturnToolConfig,

    /// Optional tool the child can call to give up with an explanation
    #[serde(default)]
    pub error_tool: Option<ErrorToolConfig>,

    #[serde(default)]
    pub dangling_behavior: DanglingBehavior,

    /// Failure message used by `DanglingBehavior::ReportError`
    #[serde(default)]
    pub error_message: Option<String>,

    #[serde(default = "default_max_recursion_level")]
    pub max_recursion_level: u32,

    /// Person that must run the child sessions, if any
    #[serde(default)]
    pub executive_person: Option<String>,

    #[serde(default)]
    pub parallel: Option<ParallelPolicy>,
}

impl DelegationConfig {
    /// Minimal config; everything else takes its default
    pub fn new(
        function_name: impl Into<String>,
        prompt_template: impl Into<String>,
        urging_template: impl Into<String>,
    ) -> Self {
        Self {
            function_name: function_name.into(),
            function_description: String::new(),
            parameters: vec![],
            prompt_template: prompt_template.into(),
            urging_template: urging_template.into(),
            return_tool: ReturnToolConfig::default(),
            error_tool: None,
            dangling_behavior: DanglingBehavior::default(),
            error_message: None,
            max_recursion_level: default_max_recursion_level(),
            executive_person: None,
            parallel: None,
        }
    }

    /// The function exposed to the parent model
    pub fn tool_spec(&self) -> ToolSpec {
        ToolSpec::new(
            &self.function_name,
            &self.function_description,
            self.parameters.clone(),
        )
    }

    pub fn return_tool_spec(&self) -> ToolSpec {
        ToolSpec::new(
            &self.return_tool.name,
            &self.return_tool.description,
            self.return_tool.parameters.clone(),
        )
    }

    pub fn error_tool_spec(&self) -> Option<ToolSpec> {
        self.error_tool
            .as_ref()
            .map(|t| ToolSpec::new(&t.name, &t.description, t.parameters.clone()))
    }

    pub fn error_behavior(&self) -> ErrorBehavior {
        self.error_tool
            .as_ref()
            .map(|t| t.behavior)
            .unwrap_or_default()
    }

    /// Message reported when a dangling session is failed
    pub fn dangling_error_message(&self) -> &str {
        match self.error_message.as_deref() {
            Some(message) if !message.trim().is_empty() => message,
            _ => DEFAULT_DANGLING_ERROR,
        }
    }
}

/// The tool a child session calls to hand back its result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReturnToolConfig {
    #[serde(default = "default_return_tool_name")]
    pub name: String,

    #[serde(default = "default_return_tool_description")]
    pub description: String,

    #[serde(default)]
    pub parameters: Vec<ParameterSpec>,
}

impl Default for ReturnToolConfig {
    fn default() -> Self {
        Self {
            name: default_return_tool_name(),
            description: default_return_tool_description(),
            parameters: vec![],
        }
    }
}

/// The tool a child session calls to report that it cannot finish
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorToolConfig {
    #[serde(default = "default_error_tool_name")]
    pub name: String,

    #[serde(default = "default_error_tool_description")]
    pub description: String,

    #[serde(default)]
    pub parameters: Vec<ParameterSpec>,

    #[serde(default)]
    pub behavior: ErrorBehavior,
}

impl Default for ErrorToolConfig {
    fn default() -> Self {
        Self {
            name: default_error_tool_name(),
            description: default_error_tool_description(),
            parameters: vec![],
            behavior: ErrorBehavior::default(),
        }
    }
}

/// What happens when the child calls the error-report tool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ErrorBehavior {
    /// Fail the delegation with the reported error
    #[default]
    #[serde(alias = "Fail")]
    Fail,
    /// Keep the session open for a human to step in
    #[serde(alias = "Pause")]
    Pause,
}

/// Lower-cases and strips separators so `ReportError`, `report_error` and
/// `report-error` compare equal.
fn normalize_variant(raw: &str) -> String {
    raw.chars()
        .filter(|c| !matches!(c, '_' | '-' | ' '))
        .flat_map(char::to_lowercase)
        .collect()
}

/// What happens when a child session ends its turn without calling a tool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", from = "String")]
pub enum DanglingBehavior {
    /// Send the urging message and wait again, up to the recursion limit
    #[default]
    Urge,
    /// Fail with the configured error message
    ReportError,
    /// Stop and wait for external intervention
    Pause,
}

impl From<String> for DanglingBehavior {
    /// Unrecognized values fall back to `Urge`.
    fn from(raw: String) -> Self {
        match normalize_variant(&raw).as_str() {
            "urge" => Self::Urge,
            "reporterror" => Self::ReportError,
            "pause" => Self::Pause,
            _ => {
                warn!(value = %raw, "Unrecognized dangling behavior, falling back to urge");
                Self::Urge
            }
        }
    }
}

impl fmt::Display for DanglingBehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Urge => "urge",
            Self::ReportError => "report_error",
            Self::Pause => "pause",
        })
    }
}

/// How one invocation is split into sub-task units
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// One unit per request parameter
    #[default]
    #[serde(alias = "PerParameter")]
    PerParameter,
    /// One unit per element of a list-valued request parameter
    #[serde(alias = "PerListItem")]
    PerListItem,
    /// One unit per element of a list fixed in the configuration
    #[serde(alias = "PerExternalListItem")]
    PerExternalListItem,
}

/// How unit results are combined into the batch result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", from = "String")]
pub enum AggregationStrategy {
    /// Every unit's result, in submission order
    #[default]
    WaitForAll,
    /// Results as they complete, in completion order
    StreamIndividual,
    /// The first successful unit; the rest are cancelled
    FirstResultWins,
}

impl From<String> for AggregationStrategy {
    /// Unrecognized values fall back to `WaitForAll`.
    fn from(raw: String) -> Self {
        match normalize_variant(&raw).as_str() {
            "waitforall" => Self::WaitForAll,
            "streamindividual" => Self::StreamIndividual,
            "firstresultwins" => Self::FirstResultWins,
            _ => {
                warn!(value = %raw, "Unrecognized aggregation strategy, falling back to wait_for_all");
                Self::WaitForAll
            }
        }
    }
}

/// Parallel execution policy attached to a delegation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ParallelPolicy {
    #[serde(default)]
    pub mode: ExecutionMode,

    /// Request parameter holding the list (`PerListItem`)
    #[serde(default)]
    pub list_parameter: Option<String>,

    /// Items to fan out over (`PerExternalListItem`)
    #[serde(default)]
    pub external_list: Option<Vec<String>>,

    /// Parameters that are shared context rather than units (`PerParameter`)
    #[serde(default)]
    pub excluded_parameters: BTreeSet<String>,

    /// Units in flight at once; zero or negative means the logical core count
    #[serde(default)]
    pub max_concurrency: i64,

    /// Per-unit timeout in milliseconds
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    #[serde(default)]
    pub strategy: AggregationStrategy,
}

impl ParallelPolicy {
    pub fn new(mode: ExecutionMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    pub fn with_list_parameter(mut self, name: impl Into<String>) -> Self {
        self.list_parameter = Some(name.into());
        self
    }

    pub fn with_external_list(mut self, items: Vec<String>) -> Self {
        self.external_list = Some(items);
        self
    }

    pub fn exclude(mut self, name: impl Into<String>) -> Self {
        self.excluded_parameters.insert(name.into());
        self
    }

    pub fn with_max_concurrency(mut self, max: i64) -> Self {
        self.max_concurrency = max;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_strategy(mut self, strategy: AggregationStrategy) -> Self {
        self.strategy = strategy;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let config = DelegationConfig::new("summarize", "Summarize {{text}}", "Please return");
        assert_eq!(config.return_tool.name, "return_result");
        assert_eq!(config.max_recursion_level, 3);
        assert_eq!(config.dangling_behavior, DanglingBehavior::Urge);
        assert_eq!(config.error_behavior(), ErrorBehavior::Fail);
        assert!(config.error_tool_spec().is_none());
    }

    #[test]
    fn test_dangling_error_message_fallback() {
        let mut config = DelegationConfig::new("f", "p", "u");
        assert_eq!(config.dangling_error_message(), DEFAULT_DANGLING_ERROR);

        config.error_message = Some("   ".to_string());
        assert_eq!(config.dangling_error_message(), DEFAULT_DANGLING_ERROR);

        config.error_message = Some("Child gave up".to_string());
        assert_eq!(config.dangling_error_message(), "Child gave up");
    }

    #[test]
    fn test_dangling_behavior_parsing() {
        let parse = |v: &str| -> DanglingBehavior { serde_json::from_value(json!(v)).unwrap() };
        assert_eq!(parse("urge"), DanglingBehavior::Urge);
        assert_eq!(parse("ReportError"), DanglingBehavior::ReportError);
        assert_eq!(parse("report_error"), DanglingBehavior::ReportError);
        assert_eq!(parse("Pause"), DanglingBehavior::Pause);
        assert_eq!(parse("explode"), DanglingBehavior::Urge);
    }

    #[test]
    fn test_aggregation_strategy_parsing() {
        let parse = |v: &str| -> AggregationStrategy { serde_json::from_value(json!(v)).unwrap() };
        assert_eq!(parse("FirstResultWins"), AggregationStrategy::FirstResultWins);
        assert_eq!(parse("stream_individual"), AggregationStrategy::StreamIndividual);
        assert_eq!(parse("fastest"), AggregationStrategy::WaitForAll);
    }

    #[test]
    fn test_serialization_uses_snake_case() {
        let value = serde_json::to_value(DanglingBehavior::ReportError).unwrap();
        assert_eq!(value, json!("report_error"));
        let value = serde_json::to_value(AggregationStrategy::FirstResultWins).unwrap();
        assert_eq!(value, json!("first_result_wins"));
    }

    #[test]
    fn test_tool_specs() {
        let mut config = DelegationConfig::new("review", "p", "u");
        config.error_tool = Some(ErrorToolConfig::default());

        assert_eq!(config.tool_spec().name, "review");
        assert_eq!(config.return_tool_spec().name, "return_result");
        assert_eq!(config.error_tool_spec().unwrap().name, "report_error");
    }
}
