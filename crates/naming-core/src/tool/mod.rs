//! Tool system
//!
//! The `Tool` trait a parent session dispatches to, and the tool/parameter
//! definitions registered on child sessions.

pub mod definition;
pub mod traits;

pub use definition::{ParameterSpec, ParameterType, ToolSpec};
pub use traits::{Tool, ToolContext, ToolResult};
