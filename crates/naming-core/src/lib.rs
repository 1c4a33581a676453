//! naming-core: sub-task delegation engine
//!
//! One tool call made by a parent conversation can spawn child sessions that
//! perform the sub-work and report back through a dynamically registered
//! "return" tool. Child sessions that answer without calling it are urged,
//! failed, or paused according to the configured dangling behavior. When a
//! parallel policy is configured, one invocation is split into sub-task units
//! that run concurrently under a concurrency bound.
//!
//! ## Layout
//!
//! - **config**: `DelegationConfig` document model, loading and validation
//! - **template**: `TemplateRenderer` trait and the bundled `SimpleRenderer`
//! - **tool**: `Tool` trait, `ToolSpec` and JSON Schema rendering
//! - **session**: `ChildSessionGateway` trait and the `SessionRegistry` helper
//! - **delegation**: runner state machine, batch manager, entry point

pub mod config;
pub mod delegation;
pub mod error;
pub mod session;
pub mod template;
pub mod tool;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::{
    AggregationStrategy, DanglingBehavior, DelegationConfig, EngineSettings, ErrorBehavior,
    ErrorToolConfig, ExecutionMode, ParallelPolicy, ReturnToolConfig, ValidationErrors,
    ValidationIssue,
};
pub use delegation::{
    decompose, template_context, BatchManager, BatchRequest, BatchResult, DelegationResult,
    DelegationRunner, DelegationStatus, Delegator, PausedDelegation, ProgressCallback,
    RunOutcome, RunRequest, SubTaskUnit, UnitResult,
};
pub use error::{Error, Result};
pub use session::{
    ChildSessionGateway, ChildSessionRequest, SessionHandle, SessionId, SessionRegistry,
    ToolInvocation, ToolRole, ToolSink,
};
pub use template::{SimpleRenderer, TemplateError, TemplateRenderer};
pub use tool::{ParameterSpec, ParameterType, Tool, ToolContext, ToolResult, ToolSpec};
