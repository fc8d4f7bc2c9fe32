//! Database query functions for the `plan_leases` table.
//!
//! A lease row carries both the exclusive holder of a plan and the plan's
//! retry backoff (`attempts`, `next_eligible_at`). Releasing a lease never
//! deletes the row so backoff survives between sweeps.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgExecutor;
use uuid::Uuid;

use crate::models::PlanLease;

/// Try to take the lease on a plan.
///
/// Succeeds when the row is absent, unheld, expired as of `now`, or already
/// held by `holder` (renewal). Returns `None` when another holder has a live
/// lease.
pub async fn acquire_lease<'e, E: PgExecutor<'e>>(
    executor: E,
    plan_id: Uuid,
    holder: Uuid,
    now: DateTime<Utc>,
    expires_at: DateTime<Utc>,
) -> Result<Option<PlanLease>> {
    let lease = sqlx::query_as::<_, PlanLease>(
        "INSERT INTO plan_leases (plan_id, holder, expires_at) VALUES ($1, $2, $3) \
         ON CONFLICT (plan_id) DO UPDATE \
         SET holder = EXCLUDED.holder, expires_at = EXCLUDED.expires_at \
         WHERE plan_leases.holder IS NULL \
            OR plan_leases.expires_at IS NULL \
            OR plan_leases.expires_at <= $4 \
            OR plan_leases.holder = EXCLUDED.holder \
         RETURNING *",
    )
    .bind(plan_id)
    .bind(holder)
    .bind(expires_at)
    .bind(now)
    .fetch_optional(executor)
    .await
    .context("failed to acquire plan lease")?;

    Ok(lease)
}

/// Release a lease after success, resetting the backoff state.
pub async fn release_lease<'e, E: PgExecutor<'e>>(
    executor: E,
    plan_id: Uuid,
    holder: Uuid,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE plan_leases \
         SET holder = NULL, expires_at = NULL, attempts = 0, next_eligible_at = NULL \
         WHERE plan_id = $1 AND holder = $2",
    )
    .bind(plan_id)
    .bind(holder)
    .execute(executor)
    .await
    .context("failed to release plan lease")?;

    Ok(result.rows_affected())
}

/// Release a lease after failure, bumping the attempt counter and fencing
/// the plan out of sweeps until `next_eligible_at`.
pub async fn release_lease_with_backoff<'e, E: PgExecutor<'e>>(
    executor: E,
    plan_id: Uuid,
    holder: Uuid,
    next_eligible_at: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE plan_leases \
         SET holder = NULL, expires_at = NULL, attempts = attempts + 1, next_eligible_at = $3 \
         WHERE plan_id = $1 AND holder = $2",
    )
    .bind(plan_id)
    .bind(holder)
    .bind(next_eligible_at)
    .execute(executor)
    .await
    .context("failed to release plan lease with backoff")?;

    Ok(result.rows_affected())
}

/// Drop any lease and backoff state for a plan (operator replay).
pub async fn clear_lease<'e, E: PgExecutor<'e>>(executor: E, plan_id: Uuid) -> Result<u64> {
    let result = sqlx::query("DELETE FROM plan_leases WHERE plan_id = $1")
        .bind(plan_id)
        .execute(executor)
        .await
        .context("failed to clear plan lease")?;

    Ok(result.rows_affected())
}

pub async fn get_lease<'e, E: PgExecutor<'e>>(
    executor: E,
    plan_id: Uuid,
) -> Result<Option<PlanLease>> {
    let lease = sqlx::query_as::<_, PlanLease>("SELECT * FROM plan_leases WHERE plan_id = $1")
        .bind(plan_id)
        .fetch_optional(executor)
        .await
        .context("failed to fetch plan lease")?;

    Ok(lease)
}
