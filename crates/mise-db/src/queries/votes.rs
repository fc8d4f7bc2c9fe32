//! Database query functions for the `meal_plan_option_votes` table.

use anyhow::{Context, Result};
use sqlx::PgExecutor;
use uuid::Uuid;

use crate::models::MealPlanOptionVote;

/// Serialize ballot writes for one (plan, user) pair until the transaction
/// ends. Ballots from different users do not contend.
pub async fn lock_ballot<'e, E: PgExecutor<'e>>(
    executor: E,
    plan_id: Uuid,
    user_id: Uuid,
) -> Result<()> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1 || ':' || $2, 0))")
        .bind(plan_id.to_string())
        .bind(user_id.to_string())
        .execute(executor)
        .await
        .context("failed to take ballot lock")?;

    Ok(())
}

pub async fn insert_vote<'e, E: PgExecutor<'e>>(
    executor: E,
    vote: &MealPlanOptionVote,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO meal_plan_option_votes \
         (id, option_id, by_user, rank, abstain, notes, created_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7)",
    )
    .bind(vote.id)
    .bind(vote.option_id)
    .bind(vote.by_user)
    .bind(vote.rank)
    .bind(vote.abstain)
    .bind(&vote.notes)
    .bind(vote.created_at)
    .execute(executor)
    .await
    .context("failed to insert vote")?;

    Ok(())
}

/// All votes cast on any option of a plan.
pub async fn list_votes_for_plan<'e, E: PgExecutor<'e>>(
    executor: E,
    plan_id: Uuid,
) -> Result<Vec<MealPlanOptionVote>> {
    let votes = sqlx::query_as::<_, MealPlanOptionVote>(
        "SELECT v.* FROM meal_plan_option_votes v \
         JOIN meal_plan_options o ON o.id = v.option_id \
         JOIN meal_plan_events e ON e.id = o.event_id \
         WHERE e.plan_id = $1 \
         ORDER BY v.created_at ASC, v.id ASC",
    )
    .bind(plan_id)
    .fetch_all(executor)
    .await
    .context("failed to list votes for plan")?;

    Ok(votes)
}

/// Existing votes by `user_id` on any of `option_ids`.
pub async fn list_user_votes<'e, E: PgExecutor<'e>>(
    executor: E,
    user_id: Uuid,
    option_ids: &[Uuid],
) -> Result<Vec<MealPlanOptionVote>> {
    let votes = sqlx::query_as::<_, MealPlanOptionVote>(
        "SELECT * FROM meal_plan_option_votes \
         WHERE by_user = $1 AND option_id = ANY($2) \
         ORDER BY option_id ASC",
    )
    .bind(user_id)
    .bind(option_ids)
    .fetch_all(executor)
    .await
    .context("failed to list existing votes for user")?;

    Ok(votes)
}
