//! The finalization and materialization sweeps.
//!
//! Each sweep selects due plans, takes a per-plan lease, and drives the
//! engine with bounded concurrency. Transient repository failures are
//! retried in-process with exponential backoff; when attempts run out the
//! lease is released with a `next_eligible_at` fence and an alert goes out.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::engine::Engine;
use crate::error::{EngineError, Result};
use crate::publish::{topics, DataChangeMessage, EventType};
use crate::repo::LeaseRelease;

/// Upper bound for one in-process retry delay.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(10);
/// Upper bound for the between-sweeps backoff fence.
const MAX_SWEEP_BACKOFF_SECS: u64 = 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepKind {
    Finalization,
    Materialization,
}

impl std::fmt::Display for SweepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Finalization => f.write_str("finalization"),
            Self::Materialization => f.write_str("materialization"),
        }
    }
}

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub due: usize,
    pub processed: usize,
    /// Plans another worker held, or whose race this worker lost.
    pub skipped: usize,
    /// Plans released with a backoff fence.
    pub failed: usize,
}

enum PlanResult {
    Processed,
    Skipped,
    Failed,
}

pub struct Worker {
    engine: Arc<Engine>,
    holder: Uuid,
}

impl Worker {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            holder: Uuid::new_v4(),
        }
    }

    /// The lease holder id this worker writes.
    pub fn holder(&self) -> Uuid {
        self.holder
    }

    /// Run both sweeps on their intervals until `cancel` fires. Only
    /// `Internal` errors end the loop early.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let config = self.engine.config();
        let mut finalization = tokio::time::interval(config.finalization_interval());
        let mut materialization = tokio::time::interval(config.materialization_interval());
        finalization.set_missed_tick_behavior(MissedTickBehavior::Skip);
        materialization.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            holder = %self.holder,
            finalization_secs = config.finalization.sweep_interval,
            materialization_secs = config.materialization.sweep_interval,
            concurrency = config.worker.concurrency,
            "worker started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = finalization.tick() => {
                    let report = self.sweep(SweepKind::Finalization, &cancel).await?;
                    log_report(SweepKind::Finalization, &report);
                }
                _ = materialization.tick() => {
                    let report = self.sweep(SweepKind::Materialization, &cancel).await?;
                    log_report(SweepKind::Materialization, &report);
                }
            }
        }

        tracing::info!(holder = %self.holder, "worker stopped");
        Ok(())
    }

    /// One finalization sweep followed by one materialization sweep.
    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<(SweepReport, SweepReport)> {
        let finalized = self.sweep(SweepKind::Finalization, cancel).await?;
        let materialized = self.sweep(SweepKind::Materialization, cancel).await?;
        Ok((finalized, materialized))
    }

    pub async fn sweep_finalization(&self, cancel: &CancellationToken) -> Result<SweepReport> {
        self.sweep(SweepKind::Finalization, cancel).await
    }

    pub async fn sweep_materialization(&self, cancel: &CancellationToken) -> Result<SweepReport> {
        self.sweep(SweepKind::Materialization, cancel).await
    }

    async fn sweep(&self, kind: SweepKind, cancel: &CancellationToken) -> Result<SweepReport> {
        let now = self.engine.now();
        let limit = self.engine.config().worker.batch_size;
        let repo = self.engine.repo();
        let due = match kind {
            SweepKind::Finalization => repo.plans_due_for_finalization(now, limit).await,
            SweepKind::Materialization => repo.plans_due_for_materialization(now, limit).await,
        };
        let due = match due {
            Ok(due) => due,
            Err(e) if e.is_transient() => {
                tracing::warn!(sweep = %kind, error = %e, "could not select due plans");
                return Ok(SweepReport::default());
            }
            Err(e) => return Err(e),
        };

        let mut report = SweepReport {
            due: due.len(),
            ..SweepReport::default()
        };
        if due.is_empty() {
            return Ok(report);
        }

        let semaphore = Arc::new(Semaphore::new(self.engine.config().worker.concurrency));
        let mut set = JoinSet::new();
        for plan_id in due {
            if cancel.is_cancelled() {
                tracing::info!(sweep = %kind, "sweep cancelled, not starting more plans");
                break;
            }
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| EngineError::Internal(format!("sweep semaphore closed: {e}")))?;
            let engine = Arc::clone(&self.engine);
            let holder = self.holder;
            let cancel = cancel.clone();
            set.spawn(async move {
                let result = process_plan(&engine, holder, plan_id, kind, &cancel).await;
                drop(permit);
                result
            });
        }

        let mut fatal = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(PlanResult::Processed)) => report.processed += 1,
                Ok(Ok(PlanResult::Skipped)) => report.skipped += 1,
                Ok(Ok(PlanResult::Failed)) => report.failed += 1,
                Ok(Err(e)) => {
                    tracing::error!(sweep = %kind, error = %e, "sweep hit an internal error");
                    fatal.get_or_insert(e);
                }
                Err(e) => {
                    fatal.get_or_insert(EngineError::Internal(format!("sweep task panicked: {e}")));
                }
            }
        }
        match fatal {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }
}

fn log_report(kind: SweepKind, report: &SweepReport) {
    if report.due > 0 {
        tracing::info!(
            sweep = %kind,
            due = report.due,
            processed = report.processed,
            skipped = report.skipped,
            failed = report.failed,
            "sweep finished"
        );
    }
}

/// Delay before in-process retry `attempt` (0-based): base doubled per
/// attempt, capped, plus up to half again of jitter.
pub fn retry_delay(base: Duration, attempt: u32) -> Duration {
    let exp = base.saturating_mul(1u32 << attempt.min(16)).min(MAX_RETRY_DELAY);
    let jitter_ms = u64::try_from(exp.as_millis() / 2).unwrap_or(0);
    let jitter = if jitter_ms > 0 {
        Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
    } else {
        Duration::ZERO
    };
    exp + jitter
}

/// Fence applied on the lease after a plan exhausts its retries for the
/// `attempts`-th time in a row.
pub fn sweep_backoff(interval_secs: u64, attempts: i32) -> chrono::Duration {
    let shift = u32::try_from(attempts.clamp(0, 10)).unwrap_or(0);
    let secs = interval_secs
        .saturating_mul(1u64 << shift)
        .min(MAX_SWEEP_BACKOFF_SECS);
    chrono::Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX))
}

async fn run_step(engine: &Engine, plan_id: Uuid, kind: SweepKind) -> Result<()> {
    match kind {
        SweepKind::Finalization => engine.finalize_plan(plan_id).await.map(|_| ()),
        SweepKind::Materialization => engine.materialize_tasks(plan_id).await.map(|_| ()),
    }
}

async fn release(engine: &Engine, plan_id: Uuid, holder: Uuid, how: LeaseRelease) {
    if let Err(e) = engine.repo().release_lease(plan_id, holder, how).await {
        tracing::warn!(plan_id = %plan_id, error = %e, "failed to release lease");
    }
}

/// Lease one plan, drive it with retries, and release the lease. Returns
/// `Err` only for errors that should stop the worker.
async fn process_plan(
    engine: &Engine,
    holder: Uuid,
    plan_id: Uuid,
    kind: SweepKind,
    cancel: &CancellationToken,
) -> Result<PlanResult> {
    let config = engine.config();
    let ttl = chrono::Duration::seconds(i64::try_from(config.lease_ttl_secs()).unwrap_or(i64::MAX));
    let lease = match engine.repo().acquire_lease(plan_id, holder, engine.now(), ttl).await {
        Ok(Some(lease)) => lease,
        Ok(None) => {
            tracing::debug!(plan_id = %plan_id, sweep = %kind, "plan leased elsewhere");
            return Ok(PlanResult::Skipped);
        }
        Err(e) if e.is_transient() => {
            tracing::warn!(plan_id = %plan_id, sweep = %kind, error = %e, "could not acquire lease");
            return Ok(PlanResult::Skipped);
        }
        Err(e) => return Err(e),
    };

    let max_attempts = config.worker.max_attempts.max(1);
    let mut attempt = 0;
    let outcome = loop {
        match run_step(engine, plan_id, kind).await {
            Err(e) if e.is_transient() && attempt + 1 < max_attempts && !cancel.is_cancelled() => {
                let delay = retry_delay(config.retry_base_delay(), attempt);
                tracing::warn!(
                    plan_id = %plan_id,
                    sweep = %kind,
                    attempt = attempt + 1,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %e,
                    "transient failure, retrying"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => break Err(e),
                }
                attempt += 1;
            }
            other => break other,
        }
    };

    match outcome {
        Ok(()) => {
            release(engine, plan_id, holder, LeaseRelease::Done).await;
            Ok(PlanResult::Processed)
        }
        Err(EngineError::LeaseLost { .. }) | Err(EngineError::IllegalTransition { .. }) => {
            tracing::info!(plan_id = %plan_id, sweep = %kind, "plan moved on under us, skipping");
            release(engine, plan_id, holder, LeaseRelease::Done).await;
            Ok(PlanResult::Skipped)
        }
        Err(e @ EngineError::Internal(_)) => {
            release(engine, plan_id, holder, LeaseRelease::Done).await;
            Err(e)
        }
        Err(e) => {
            let interval = match kind {
                SweepKind::Finalization => config.finalization.sweep_interval,
                SweepKind::Materialization => config.materialization.sweep_interval,
            };
            let next_eligible_at = engine.now() + sweep_backoff(interval, lease.attempts);
            release(engine, plan_id, holder, LeaseRelease::Backoff { next_eligible_at }).await;

            if e.is_transient() {
                tracing::error!(
                    plan_id = %plan_id,
                    sweep = %kind,
                    attempts = attempt + 1,
                    next_eligible_at = %next_eligible_at,
                    error = %e,
                    "retries exhausted"
                );
                let household_id = engine
                    .repo()
                    .load_plan(plan_id)
                    .await
                    .map(|p| p.plan.household_id)
                    .unwrap_or_default();
                engine.emit(
                    topics::ALERTS,
                    DataChangeMessage::new(
                        EventType::WorkerRetriesExhausted,
                        "meal_plan",
                        plan_id,
                        household_id,
                        engine.now(),
                    )
                    .with_metadata(serde_json::json!({
                        "sweep": kind,
                        "attempts": attempt + 1,
                        "error": format!("{e:#}"),
                        "next_eligible_at": next_eligible_at,
                    })),
                );
            } else {
                tracing::warn!(
                    plan_id = %plan_id,
                    sweep = %kind,
                    next_eligible_at = %next_eligible_at,
                    error = %e,
                    "plan failed, backing off"
                );
            }
            Ok(PlanResult::Failed)
        }
    }
}
