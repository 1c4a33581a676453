//! Sub-task delegation
//!
//! - **runner**: drives one child session to a result
//! - **decompose** / **parallel**: split an invocation into units and run
//!   them under a concurrency bound
//! - **entry**: the `Delegator` tool exposed to the parent session

mod decompose;
mod entry;
mod parallel;
mod runner;
mod types;

pub use decompose::decompose;
pub use entry::{Delegator, ProgressCallback};
pub use parallel::{BatchManager, BatchRequest};
pub use runner::{template_context, DelegationRunner, PausedDelegation, RunOutcome, RunRequest};
pub use types::{BatchResult, DelegationResult, DelegationStatus, SubTaskUnit, UnitResult};
