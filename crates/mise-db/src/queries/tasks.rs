//! Database query functions for the `meal_plan_tasks` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgExecutor;
use uuid::Uuid;

use crate::models::{MealPlanTask, MealPlanTaskRow, TaskStatus};

/// Filter and pagination for listing a plan's tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub option_id: Option<Uuid>,
    /// Exclude `finished` and `ignored` tasks.
    pub incomplete_only: bool,
    pub limit: i64,
    pub offset: i64,
}

impl Default for TaskFilter {
    fn default() -> Self {
        Self {
            status: None,
            option_id: None,
            incomplete_only: false,
            limit: 100,
            offset: 0,
        }
    }
}

impl TaskFilter {
    /// Whether a task passes the non-pagination parts of the filter.
    pub fn matches(&self, task: &MealPlanTask) -> bool {
        self.status.is_none_or(|s| task.status == s)
            && self.option_id.is_none_or(|o| task.option_id == o)
            && !(self.incomplete_only && task.status.is_terminal())
    }
}

pub async fn insert_task<'e, E: PgExecutor<'e>>(executor: E, task: &MealPlanTask) -> Result<()> {
    sqlx::query(
        "INSERT INTO meal_plan_tasks \
         (id, option_id, origin_kind, recipe_step_id, recipe_prep_task_id, assigned_cook, \
          cannot_start_before, must_finish_by, status, status_explanation, creation_explanation, \
          storage_type, storage_instructions, min_storage_temp_c, max_storage_temp_c, \
          created_at, completed_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)",
    )
    .bind(task.id)
    .bind(task.option_id)
    .bind(task.origin.kind())
    .bind(task.origin.recipe_step_id())
    .bind(task.origin.prep_task_id())
    .bind(task.assigned_cook)
    .bind(task.cannot_start_before)
    .bind(task.must_finish_by)
    .bind(task.status)
    .bind(&task.status_explanation)
    .bind(&task.creation_explanation)
    .bind(task.storage_type)
    .bind(task.storage_instructions.as_deref())
    .bind(task.min_storage_temp_c)
    .bind(task.max_storage_temp_c)
    .bind(task.created_at)
    .bind(task.completed_at)
    .execute(executor)
    .await
    .context("failed to insert meal plan task")?;

    Ok(())
}

/// Fetch a single task by ID.
pub async fn get_task<'e, E: PgExecutor<'e>>(executor: E, id: Uuid) -> Result<Option<MealPlanTask>> {
    let row = sqlx::query_as::<_, MealPlanTaskRow>("SELECT * FROM meal_plan_tasks WHERE id = $1")
        .bind(id)
        .fetch_optional(executor)
        .await
        .context("failed to fetch meal plan task")?;

    row.map(MealPlanTask::try_from)
        .transpose()
        .context("corrupt meal plan task row")
}

/// List a plan's tasks ordered by deadline.
pub async fn list_tasks<'e, E: PgExecutor<'e>>(
    executor: E,
    plan_id: Uuid,
    filter: &TaskFilter,
) -> Result<Vec<MealPlanTask>> {
    let rows = sqlx::query_as::<_, MealPlanTaskRow>(
        "SELECT t.* FROM meal_plan_tasks t \
         JOIN meal_plan_options o ON o.id = t.option_id \
         JOIN meal_plan_events e ON e.id = o.event_id \
         WHERE e.plan_id = $1 \
           AND ($2::text IS NULL OR t.status = $2) \
           AND ($3::uuid IS NULL OR t.option_id = $3) \
           AND (NOT $4 OR t.status NOT IN ('finished', 'ignored')) \
         ORDER BY t.must_finish_by ASC, t.cannot_start_before ASC, t.id ASC \
         LIMIT $5 OFFSET $6",
    )
    .bind(plan_id)
    .bind(filter.status)
    .bind(filter.option_id)
    .bind(filter.incomplete_only)
    .bind(filter.limit)
    .bind(filter.offset)
    .fetch_all(executor)
    .await
    .context("failed to list meal plan tasks")?;

    rows.into_iter()
        .map(|row| MealPlanTask::try_from(row).context("corrupt meal plan task row"))
        .collect()
}

/// Atomically transition a task from one status to another.
///
/// The WHERE clause includes `status = $from`, so the row only changes if
/// nobody moved it first. Returns the number of rows affected.
pub async fn transition_task_status<'e, E: PgExecutor<'e>>(
    executor: E,
    task_id: Uuid,
    from: TaskStatus,
    to: TaskStatus,
    explanation: &str,
    completed_at: Option<DateTime<Utc>>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE meal_plan_tasks \
         SET status = $1, status_explanation = $2, completed_at = $3 \
         WHERE id = $4 AND status = $5",
    )
    .bind(to)
    .bind(explanation)
    .bind(completed_at)
    .bind(task_id)
    .bind(from)
    .execute(executor)
    .await
    .context("failed to transition meal plan task status")?;

    Ok(result.rows_affected())
}

/// The household owning the plan a task belongs to.
pub async fn household_for_task<'e, E: PgExecutor<'e>>(
    executor: E,
    task_id: Uuid,
) -> Result<Option<Uuid>> {
    let row: Option<(Uuid,)> = sqlx::query_as(
        "SELECT p.household_id FROM meal_plan_tasks t \
         JOIN meal_plan_options o ON o.id = t.option_id \
         JOIN meal_plan_events e ON e.id = o.event_id \
         JOIN meal_plans p ON p.id = e.plan_id \
         WHERE t.id = $1",
    )
    .bind(task_id)
    .fetch_optional(executor)
    .await
    .context("failed to look up task household")?;

    Ok(row.map(|(id,)| id))
}

pub async fn count_tasks_for_option<'e, E: PgExecutor<'e>>(
    executor: E,
    option_id: Uuid,
) -> Result<i64> {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM meal_plan_tasks WHERE option_id = $1")
        .bind(option_id)
        .fetch_one(executor)
        .await
        .context("failed to count meal plan tasks")?;

    Ok(row.0)
}
