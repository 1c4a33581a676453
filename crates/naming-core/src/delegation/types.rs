//! Delegation result types

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

use crate::config::AggregationStrategy;
use crate::session::SessionId;
use crate::{Error, Result};

use super::runner::PausedDelegation;

/// One decomposed piece of work within a parallel batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubTaskUnit {
    /// Submission position within the batch
    pub index: usize,
    pub name: String,
    pub value: JsonValue,
}

impl SubTaskUnit {
    pub fn new(index: usize, name: impl Into<String>, value: JsonValue) -> Self {
        Self {
            index,
            name: name.into(),
            value,
        }
    }

    /// The `current_parameter` binding exposed to templates
    pub fn binding(&self) -> JsonValue {
        json!({
            "name": self.name,
            "value": self.value,
            "index": self.index,
        })
    }
}

/// How a delegation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelegationStatus {
    /// The child called the return tool
    Succeeded,
    /// The child called the error-report tool
    ErrorReported,
    /// The child answered without calling a tool and was failed
    Dangling,
    /// The child kept dangling until the recursion limit
    RecursionExceeded,
    /// The child session could not be created, reached or kept open
    SessionUnavailable,
    /// The unit's timeout elapsed
    TimedOut,
    Cancelled,
    /// Waiting for external intervention
    Paused,
}

impl DelegationStatus {
    pub fn is_success(self) -> bool {
        matches!(self, Self::Succeeded)
    }

    /// Paused delegations can still complete
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Paused)
    }
}

impl fmt::Display for DelegationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Succeeded => "succeeded",
            Self::ErrorReported => "error_reported",
            Self::Dangling => "dangling",
            Self::RecursionExceeded => "recursion_exceeded",
            Self::SessionUnavailable => "session_unavailable",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
            Self::Paused => "paused",
        })
    }
}

/// Outcome of one delegation run. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegationResult {
    pub success: bool,
    /// The return tool's arguments as JSON on success, the failure message
    /// otherwise
    pub payload: String,
    pub error: Option<String>,
    pub status: DelegationStatus,
    /// Child session that ran the delegation, if one was reached
    pub session_id: Option<SessionId>,
    /// Urging messages sent before the outcome
    pub urge_count: u32,
    pub finished_at: DateTime<Utc>,
}

impl DelegationResult {
    pub fn succeeded(payload: impl Into<String>) -> Self {
        Self {
            success: true,
            payload: payload.into(),
            error: None,
            status: DelegationStatus::Succeeded,
            session_id: None,
            urge_count: 0,
            finished_at: Utc::now(),
        }
    }

    pub fn failed(status: DelegationStatus, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            success: false,
            payload: message.clone(),
            error: Some(message),
            status,
            session_id: None,
            urge_count: 0,
            finished_at: Utc::now(),
        }
    }

    pub(crate) fn paused(reason: &str) -> Self {
        let mut result = Self::failed(DelegationStatus::Paused, reason);
        result.error = None;
        result
    }

    pub fn with_session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn with_urge_count(mut self, urge_count: u32) -> Self {
        self.urge_count = urge_count;
        self
    }

    /// The payload as JSON when it parses, otherwise as a JSON string
    pub fn payload_json(&self) -> JsonValue {
        serde_json::from_str(&self.payload).unwrap_or_else(|_| JsonValue::String(self.payload.clone()))
    }

    /// Convert to the error taxonomy: the payload on success, the matching
    /// error otherwise
    pub fn into_result(self) -> Result<String> {
        match self.status {
            DelegationStatus::Succeeded => Ok(self.payload),
            DelegationStatus::RecursionExceeded => Err(Error::RecursionExceeded(self.payload)),
            DelegationStatus::SessionUnavailable => {
                Err(Error::ChildSessionUnavailable(self.payload))
            }
            DelegationStatus::Cancelled => Err(Error::Cancelled),
            DelegationStatus::ErrorReported
            | DelegationStatus::Dangling
            | DelegationStatus::TimedOut
            | DelegationStatus::Paused => Err(Error::DanglingFailure(self.payload)),
        }
    }
}

/// The outcome of one unit within a batch
#[derive(Debug)]
pub struct UnitResult {
    pub unit: SubTaskUnit,
    pub result: DelegationResult,
    /// Set when the unit's delegation paused; resuming it is up to the caller
    pub paused: Option<PausedDelegation>,
}

impl UnitResult {
    pub(crate) fn new(unit: SubTaskUnit, result: DelegationResult) -> Self {
        Self {
            unit,
            result,
            paused: None,
        }
    }

    pub fn index(&self) -> usize {
        self.unit.index
    }

    pub fn is_success(&self) -> bool {
        self.result.success
    }

    pub fn is_paused(&self) -> bool {
        self.paused.is_some()
    }

    fn to_json(&self) -> JsonValue {
        json!({
            "index": self.unit.index,
            "name": self.unit.name,
            "success": self.result.success,
            "status": self.result.status,
            "payload": self.result.payload_json(),
            "error": self.result.error,
            "session_id": self.result.session_id,
        })
    }
}

/// Results of one parallel invocation, shaped by the aggregation strategy
#[derive(Debug)]
pub struct BatchResult {
    pub strategy: AggregationStrategy,
    /// Submission order for `WaitForAll`, completion order for
    /// `StreamIndividual`, just the winner for a won `FirstResultWins`
    pub results: Vec<UnitResult>,
    /// Index of the winning unit (`FirstResultWins`)
    pub winner: Option<usize>,
    pub success: bool,
    pub succeeded: usize,
    pub failed: usize,
    pub paused: usize,
    pub elapsed_ms: u64,
}

impl BatchResult {
    /// A batch with no units is an empty success
    pub fn empty(strategy: AggregationStrategy) -> Self {
        Self {
            strategy,
            results: vec![],
            winner: None,
            success: true,
            succeeded: 0,
            failed: 0,
            paused: 0,
            elapsed_ms: 0,
        }
    }

    /// Summarize collected unit results. For `FirstResultWins` with a winner
    /// only the winner is kept.
    pub(crate) fn from_units(
        strategy: AggregationStrategy,
        mut results: Vec<UnitResult>,
        winner: Option<usize>,
        elapsed_ms: u64,
    ) -> Self {
        let succeeded = results.iter().filter(|r| r.is_success()).count();
        let paused = results.iter().filter(|r| r.is_paused()).count();
        let failed = results.len() - succeeded - paused;

        match (strategy, winner) {
            (AggregationStrategy::StreamIndividual, _) => {}
            (AggregationStrategy::FirstResultWins, Some(index)) => {
                results.retain(|r| r.index() == index);
            }
            _ => results.sort_by_key(UnitResult::index),
        }

        let success = match strategy {
            AggregationStrategy::FirstResultWins => winner.is_some(),
            _ => failed == 0 && paused == 0,
        };

        Self {
            strategy,
            results,
            winner,
            success,
            succeeded,
            failed,
            paused,
            elapsed_ms,
        }
    }

    /// Whether every unit failed. An empty batch did not fail.
    pub fn all_failed(&self) -> bool {
        self.succeeded == 0 && self.paused == 0 && self.failed > 0
    }

    /// Failure messages of the kept results, in result order
    pub fn errors(&self) -> impl Iterator<Item = &str> {
        self.results.iter().filter_map(|r| r.result.error.as_deref())
    }

    /// The winning payload, or every failure aggregated
    pub fn into_first_success(self) -> Result<DelegationResult> {
        if let Some(found) = self.results.iter().position(|r| r.is_success()) {
            let mut results = self.results;
            return Ok(results.swap_remove(found).result);
        }
        let failures = self
            .results
            .iter()
            .map(|r| format!("{}: {}", r.unit.name, r.result.payload))
            .collect();
        Err(Error::AggregateFailure(failures))
    }

    pub fn to_json(&self) -> JsonValue {
        json!({
            "strategy": self.strategy,
            "success": self.success,
            "succeeded": self.succeeded,
            "failed": self.failed,
            "paused": self.paused,
            "elapsed_ms": self.elapsed_ms,
            "results": self.results.iter().map(UnitResult::to_json).collect::<Vec<_>>(),
        })
    }
}
