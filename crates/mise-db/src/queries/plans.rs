//! Database query functions for the `meal_plans`, `meal_plan_events`, and
//! `meal_plan_options` tables.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgExecutor;
use uuid::Uuid;

use crate::models::{MealPlan, MealPlanEvent, MealPlanOption, PlanStatus};

/// Insert a plan row as-is. Ids and timestamps are assigned by the caller.
pub async fn insert_plan<'e, E: PgExecutor<'e>>(executor: E, plan: &MealPlan) -> Result<()> {
    sqlx::query(
        "INSERT INTO meal_plans \
         (id, household_id, status, notes, election_method, voting_deadline, \
          tie_recorded, version, created_at, finalized_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
    )
    .bind(plan.id)
    .bind(plan.household_id)
    .bind(plan.status)
    .bind(&plan.notes)
    .bind(plan.election_method)
    .bind(plan.voting_deadline)
    .bind(plan.tie_recorded)
    .bind(plan.version)
    .bind(plan.created_at)
    .bind(plan.finalized_at)
    .execute(executor)
    .await
    .context("failed to insert meal plan")?;

    Ok(())
}

pub async fn insert_event<'e, E: PgExecutor<'e>>(executor: E, event: &MealPlanEvent) -> Result<()> {
    sqlx::query(
        "INSERT INTO meal_plan_events (id, plan_id, meal_name, notes, starts_at, ends_at, created_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7)",
    )
    .bind(event.id)
    .bind(event.plan_id)
    .bind(event.meal_name)
    .bind(&event.notes)
    .bind(event.starts_at)
    .bind(event.ends_at)
    .bind(event.created_at)
    .execute(executor)
    .await
    .context("failed to insert meal plan event")?;

    Ok(())
}

pub async fn insert_option<'e, E: PgExecutor<'e>>(
    executor: E,
    option: &MealPlanOption,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO meal_plan_options \
         (id, event_id, meal_id, notes, assigned_cook, chosen, tiebroken, tasks_created, created_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
    )
    .bind(option.id)
    .bind(option.event_id)
    .bind(option.meal_id)
    .bind(&option.notes)
    .bind(option.assigned_cook)
    .bind(option.chosen)
    .bind(option.tiebroken)
    .bind(option.tasks_created)
    .bind(option.created_at)
    .execute(executor)
    .await
    .context("failed to insert meal plan option")?;

    Ok(())
}

/// Fetch a plan by its ID.
pub async fn get_plan<'e, E: PgExecutor<'e>>(executor: E, id: Uuid) -> Result<Option<MealPlan>> {
    let plan = sqlx::query_as::<_, MealPlan>("SELECT * FROM meal_plans WHERE id = $1")
        .bind(id)
        .fetch_optional(executor)
        .await
        .context("failed to fetch meal plan")?;

    Ok(plan)
}

/// Fetch a plan and hold a share lock on its row until the transaction ends.
///
/// Ballot writes take this lock so their deadline read cannot interleave
/// with a concurrent status or deadline change.
pub async fn get_plan_for_share<'e, E: PgExecutor<'e>>(
    executor: E,
    id: Uuid,
) -> Result<Option<MealPlan>> {
    let plan = sqlx::query_as::<_, MealPlan>("SELECT * FROM meal_plans WHERE id = $1 FOR SHARE")
        .bind(id)
        .fetch_optional(executor)
        .await
        .context("failed to lock meal plan")?;

    Ok(plan)
}

/// List a plan's events ordered by start time.
pub async fn list_events<'e, E: PgExecutor<'e>>(
    executor: E,
    plan_id: Uuid,
) -> Result<Vec<MealPlanEvent>> {
    let events = sqlx::query_as::<_, MealPlanEvent>(
        "SELECT * FROM meal_plan_events WHERE plan_id = $1 ORDER BY starts_at ASC, id ASC",
    )
    .bind(plan_id)
    .fetch_all(executor)
    .await
    .context("failed to list meal plan events")?;

    Ok(events)
}

/// List every option across all of a plan's events.
pub async fn list_options<'e, E: PgExecutor<'e>>(
    executor: E,
    plan_id: Uuid,
) -> Result<Vec<MealPlanOption>> {
    let options = sqlx::query_as::<_, MealPlanOption>(
        "SELECT o.* FROM meal_plan_options o \
         JOIN meal_plan_events e ON e.id = o.event_id \
         WHERE e.plan_id = $1 \
         ORDER BY o.event_id ASC, o.id ASC",
    )
    .bind(plan_id)
    .fetch_all(executor)
    .await
    .context("failed to list meal plan options")?;

    Ok(options)
}

/// Compare-and-set the finalization result onto a plan.
///
/// Only updates when the row is still `awaiting_votes` at `expected_version`.
/// Returns the number of rows affected (0 means the CAS lost).
pub async fn finalize_plan<'e, E: PgExecutor<'e>>(
    executor: E,
    plan_id: Uuid,
    expected_version: i64,
    status: PlanStatus,
    tie_recorded: bool,
    finalized_at: Option<DateTime<Utc>>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE meal_plans \
         SET status = $1, tie_recorded = $2, finalized_at = $3, version = version + 1 \
         WHERE id = $4 AND version = $5 AND status = 'awaiting_votes'",
    )
    .bind(status)
    .bind(tie_recorded)
    .bind(finalized_at)
    .bind(plan_id)
    .bind(expected_version)
    .execute(executor)
    .await
    .context("failed to finalize meal plan")?;

    Ok(result.rows_affected())
}

/// Atomically move a plan between statuses, guarded by status and version.
///
/// When `voting_deadline` is given it replaces the stored deadline in the
/// same statement. Returns the number of rows affected.
pub async fn transition_plan_status<'e, E: PgExecutor<'e>>(
    executor: E,
    plan_id: Uuid,
    from: PlanStatus,
    to: PlanStatus,
    expected_version: i64,
    voting_deadline: Option<DateTime<Utc>>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE meal_plans \
         SET status = $1, \
             voting_deadline = COALESCE($2, voting_deadline), \
             version = version + 1 \
         WHERE id = $3 AND status = $4 AND version = $5",
    )
    .bind(to)
    .bind(voting_deadline)
    .bind(plan_id)
    .bind(from)
    .bind(expected_version)
    .execute(executor)
    .await
    .context("failed to transition meal plan status")?;

    Ok(result.rows_affected())
}

/// Mark an option as the chosen winner of its event.
pub async fn mark_option_chosen<'e, E: PgExecutor<'e>>(
    executor: E,
    option_id: Uuid,
    tiebroken: bool,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE meal_plan_options SET chosen = TRUE, tiebroken = $1 \
         WHERE id = $2 AND NOT chosen",
    )
    .bind(tiebroken)
    .bind(option_id)
    .execute(executor)
    .await
    .context("failed to mark meal plan option chosen")?;

    Ok(result.rows_affected())
}

/// Flip `tasks_created` on a chosen option. Returns 0 if it was already set.
pub async fn flip_tasks_created<'e, E: PgExecutor<'e>>(executor: E, option_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE meal_plan_options SET tasks_created = TRUE \
         WHERE id = $1 AND chosen AND NOT tasks_created",
    )
    .bind(option_id)
    .execute(executor)
    .await
    .context("failed to flip tasks_created")?;

    Ok(result.rows_affected())
}

/// Plans still awaiting votes whose deadline has elapsed and whose lease
/// backoff (if any) has expired.
pub async fn plans_due_for_finalization<'e, E: PgExecutor<'e>>(
    executor: E,
    now: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<Uuid>> {
    let rows: Vec<(Uuid,)> = sqlx::query_as(
        "SELECT p.id FROM meal_plans p \
         LEFT JOIN plan_leases l ON l.plan_id = p.id \
         WHERE p.status = 'awaiting_votes' \
           AND p.voting_deadline <= $1 \
           AND (l.next_eligible_at IS NULL OR l.next_eligible_at <= $1) \
         ORDER BY p.voting_deadline ASC, p.id ASC \
         LIMIT $2",
    )
    .bind(now)
    .bind(limit)
    .fetch_all(executor)
    .await
    .context("failed to select plans due for finalization")?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Finalized plans with at least one chosen option lacking tasks.
pub async fn plans_due_for_materialization<'e, E: PgExecutor<'e>>(
    executor: E,
    now: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<Uuid>> {
    let rows: Vec<(Uuid,)> = sqlx::query_as(
        "SELECT p.id FROM meal_plans p \
         LEFT JOIN plan_leases l ON l.plan_id = p.id \
         WHERE p.status = 'finalized' \
           AND EXISTS ( \
               SELECT 1 FROM meal_plan_options o \
               JOIN meal_plan_events e ON e.id = o.event_id \
               WHERE e.plan_id = p.id AND o.chosen AND NOT o.tasks_created \
           ) \
           AND (l.next_eligible_at IS NULL OR l.next_eligible_at <= $1) \
         ORDER BY p.voting_deadline ASC, p.id ASC \
         LIMIT $2",
    )
    .bind(now)
    .bind(limit)
    .fetch_all(executor)
    .await
    .context("failed to select plans due for materialization")?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}
