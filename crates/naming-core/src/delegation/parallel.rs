//! Parallel batch execution
//!
//! Every unit is spawned at once and queues on a semaphore sized to the
//! policy's concurrency, so only that many child sessions are in flight. Each
//! unit runs under a child of the batch token; a unit timeout cancels only
//! that unit, while a `FirstResultWins` winner cancels the whole batch.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::channel::mpsc;
use futures::stream::BoxStream;
use futures::{SinkExt, StreamExt};
use serde_json::{Map, Value as JsonValue};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{AggregationStrategy, EngineSettings, ParallelPolicy};
use crate::session::SessionId;
use crate::{Error, Result};

use super::decompose::decompose;
use super::runner::{DelegationRunner, RunOutcome, RunRequest};
use super::types::{BatchResult, DelegationResult, DelegationStatus, SubTaskUnit, UnitResult};

/// One parallel invocation
#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub arguments: Map<String, JsonValue>,
    pub parent: SessionId,
    pub person: String,
    /// Depth every unit's recursion counter starts at
    pub depth: u32,
}

impl BatchRequest {
    pub fn new(
        parent: SessionId,
        person: impl Into<String>,
        arguments: Map<String, JsonValue>,
    ) -> Self {
        Self {
            arguments,
            parent,
            person: person.into(),
            depth: 0,
        }
    }

    pub fn with_depth(mut self, depth: u32) -> Self {
        self.depth = depth;
        self
    }

    fn unit_request(&self, unit: SubTaskUnit) -> RunRequest {
        RunRequest::new(self.parent.clone(), &self.person, self.arguments.clone())
            .with_depth(self.depth)
            .with_unit(unit)
    }
}

/// Runs the units of one parallel policy
#[derive(Clone)]
pub struct BatchManager {
    runner: DelegationRunner,
    policy: Arc<ParallelPolicy>,
    settings: EngineSettings,
}

impl BatchManager {
    pub fn new(runner: DelegationRunner, policy: ParallelPolicy, settings: EngineSettings) -> Self {
        Self {
            runner,
            policy: Arc::new(policy),
            settings,
        }
    }

    pub fn policy(&self) -> &ParallelPolicy {
        &self.policy
    }

    pub fn strategy(&self) -> AggregationStrategy {
        self.policy.strategy
    }

    /// Units allowed in flight at once
    pub fn max_concurrency(&self) -> usize {
        self.settings.effective_concurrency(self.policy.max_concurrency)
    }

    pub fn unit_timeout(&self) -> Option<Duration> {
        self.settings.unit_timeout(self.policy.timeout_ms)
    }

    /// The units `arguments` decompose into
    pub fn units(&self, arguments: &Map<String, JsonValue>) -> Result<Vec<SubTaskUnit>> {
        decompose(&self.policy, arguments)
    }

    /// Run every unit and aggregate under the policy's strategy.
    ///
    /// Unit failures are part of the result. Errors are reserved for bad
    /// input or configuration, and for `cancel` firing.
    pub async fn run(&self, request: BatchRequest, cancel: &CancellationToken) -> Result<BatchResult> {
        let started = Instant::now();
        let strategy = self.strategy();
        let units = self.units(&request.arguments)?;
        if units.is_empty() {
            debug!("Batch decomposed into no units");
            return Ok(BatchResult::empty(strategy));
        }

        info!(
            units = units.len(),
            max_concurrency = self.max_concurrency(),
            strategy = ?strategy,
            mode = ?self.policy.mode,
            "Starting delegation batch"
        );

        let batch_token = cancel.child_token();
        let mut join_set = self.spawn_units(units, &request, &batch_token);
        let mut results = Vec::with_capacity(join_set.len());
        let mut winner = None;

        while let Some(joined) = join_set.join_next().await {
            let unit_result = match joined.map_err(Error::from).and_then(|r| r) {
                Ok(unit_result) => unit_result,
                Err(e) => {
                    error!("Delegation batch aborted: {}", e);
                    batch_token.cancel();
                    drain(&mut join_set).await;
                    abandon_paused(results).await;
                    return Err(e);
                }
            };

            debug!(
                unit = unit_result.index(),
                status = %unit_result.result.status,
                "Unit finished"
            );

            if strategy == AggregationStrategy::FirstResultWins
                && winner.is_none()
                && unit_result.is_success()
            {
                info!(unit = unit_result.index(), "First successful unit wins, cancelling the rest");
                winner = Some(unit_result.index());
                batch_token.cancel();
            }
            results.push(unit_result);
        }

        if cancel.is_cancelled() {
            abandon_paused(results).await;
            return Err(Error::Cancelled);
        }

        if let Some(index) = winner {
            for loser in results.iter_mut().filter(|r| r.index() != index) {
                if let Some(paused) = loser.paused.take() {
                    paused.abandon().await;
                }
            }
        }

        let batch = BatchResult::from_units(strategy, results, winner, elapsed_ms(started));
        info!(
            succeeded = batch.succeeded,
            failed = batch.failed,
            paused = batch.paused,
            elapsed_ms = batch.elapsed_ms,
            "Delegation batch finished"
        );
        Ok(batch)
    }

    /// Run every unit, yielding results in completion order.
    ///
    /// The batch keeps running in the background; dropping the stream
    /// cancels the units that have not finished.
    pub fn stream(
        &self,
        request: BatchRequest,
        cancel: CancellationToken,
    ) -> Result<BoxStream<'static, Result<UnitResult>>> {
        let units = self.units(&request.arguments)?;
        let (mut tx, rx) = mpsc::channel(units.len().max(1));
        let manager = self.clone();

        tokio::spawn(async move {
            let batch_token = cancel.child_token();
            let mut join_set = manager.spawn_units(units, &request, &batch_token);

            while let Some(joined) = join_set.join_next().await {
                let item = joined.map_err(Error::from).and_then(|r| r);
                let failed = item.is_err();

                if tx.is_closed() {
                    batch_token.cancel();
                    if let Ok(unit_result) = item {
                        abandon_paused(vec![unit_result]).await;
                    }
                    continue;
                }
                if let Err(e) = tx.send(item).await {
                    debug!("Batch stream receiver dropped: {}", e);
                    batch_token.cancel();
                }
                if failed {
                    batch_token.cancel();
                }
            }
        });

        Ok(rx.boxed())
    }

    fn spawn_units(
        &self,
        units: Vec<SubTaskUnit>,
        request: &BatchRequest,
        batch_token: &CancellationToken,
    ) -> JoinSet<Result<UnitResult>> {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrency()));
        let timeout = self.unit_timeout();
        let mut join_set = JoinSet::new();

        for unit in units {
            let runner = self.runner.clone();
            let semaphore = semaphore.clone();
            let token = batch_token.child_token();
            let run_request = request.unit_request(unit.clone());

            join_set.spawn(async move {
                let _permit = tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        return Ok(UnitResult::new(unit, cancelled_result()));
                    }
                    permit = semaphore.acquire_owned() => permit.map_err(|_| Error::Cancelled)?,
                };
                run_unit(runner, run_request, unit, token, timeout).await
            });
        }

        join_set
    }
}

async fn run_unit(
    runner: DelegationRunner,
    request: RunRequest,
    unit: SubTaskUnit,
    token: CancellationToken,
    timeout: Option<Duration>,
) -> Result<UnitResult> {
    let run = runner.run(request, &token);
    tokio::pin!(run);

    let outcome = match timeout {
        None => run.await,
        Some(limit) => {
            tokio::select! {
                outcome = &mut run => outcome,
                _ = tokio::time::sleep(limit) => {
                    let timeout_ms = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX);
                    warn!(unit = unit.index, timeout_ms, "Unit timed out");
                    token.cancel();
                    match run.await {
                        Err(Error::Cancelled) => {
                            let message = format!("Sub-task timed out after {} ms", timeout_ms);
                            return Ok(UnitResult::new(
                                unit,
                                DelegationResult::failed(DelegationStatus::TimedOut, message),
                            ));
                        }
                        other => other,
                    }
                }
            }
        }
    };

    match outcome {
        Ok(RunOutcome::Completed(result)) => Ok(UnitResult::new(unit, result)),
        Ok(RunOutcome::Paused(paused)) => {
            let result = DelegationResult::paused(paused.reason())
                .with_session(paused.session().id.clone());
            Ok(UnitResult {
                unit,
                result,
                paused: Some(paused),
            })
        }
        Err(Error::Cancelled) => Ok(UnitResult::new(unit, cancelled_result())),
        Err(e) => Err(e),
    }
}

fn cancelled_result() -> DelegationResult {
    DelegationResult::failed(DelegationStatus::Cancelled, "Sub-task cancelled")
}

/// Wait out the remaining units after the batch token fired, releasing any
/// session they left paused
async fn drain(join_set: &mut JoinSet<Result<UnitResult>>) {
    while let Some(joined) = join_set.join_next().await {
        if let Ok(Ok(unit_result)) = joined {
            abandon_paused(vec![unit_result]).await;
        }
    }
}

async fn abandon_paused(results: Vec<UnitResult>) {
    for paused in results.into_iter().filter_map(|r| r.paused) {
        paused.abandon().await;
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
