//! Child session management
//!
//! The gateway contract the engine drives, and a registry gateway
//! implementations can build on.

mod gateway;
mod registry;
mod types;

pub use gateway::ChildSessionGateway;
pub use registry::SessionRegistry;
pub use types::{ChildSessionRequest, SessionHandle, SessionId, ToolInvocation, ToolRole, ToolSink};
