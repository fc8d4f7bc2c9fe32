use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use mise_db::models::{Meal, MealPlanTask, PlanLease, PlanStatus, TaskStatus};
use mise_db::queries::tasks::TaskFilter;
use mise_db::queries::{leases, plans as plan_db, recipes as recipe_db, tasks as task_db, votes};

use super::{FinalizationCommit, LeaseRelease, MealPlanRepository};
use crate::ballot::{self, BallotOutcome, BallotWrite};
use crate::clock::Clock;
use crate::error::{EngineError, Result};
use crate::model::PlanAggregate;
use crate::recipe::RecipeGraph;

/// PostgreSQL-backed repository.
#[derive(Debug, Clone)]
pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl MealPlanRepository for PgRepository {
    async fn insert_recipe(&self, graph: &RecipeGraph) -> Result<()> {
        let mut tx = self.pool.begin().await.context("failed to begin transaction")?;

        recipe_db::insert_recipe(&mut *tx, &graph.recipe).await?;
        for step in &graph.steps {
            recipe_db::insert_step(&mut *tx, step).await?;
        }
        for product in &graph.products {
            recipe_db::insert_product(&mut *tx, product).await?;
        }
        for ingredient in &graph.ingredients {
            recipe_db::insert_ingredient(&mut *tx, ingredient).await?;
        }
        for instrument in &graph.instruments {
            recipe_db::insert_instrument(&mut *tx, instrument).await?;
        }
        for prep in &graph.prep_tasks {
            recipe_db::insert_prep_task(&mut *tx, &prep.task).await?;
            for link in &prep.steps {
                recipe_db::insert_prep_task_step(&mut *tx, link).await?;
            }
        }

        tx.commit().await.context("failed to commit recipe")?;
        Ok(())
    }

    async fn load_recipe(&self, recipe_id: Uuid) -> Result<RecipeGraph> {
        let recipe = recipe_db::get_recipe(&self.pool, recipe_id)
            .await?
            .ok_or(EngineError::NotFound {
                entity: "recipe",
                id: recipe_id,
            })?;
        let steps = recipe_db::list_steps(&self.pool, recipe_id).await?;
        let products = recipe_db::list_products(&self.pool, recipe_id).await?;
        let ingredients = recipe_db::list_ingredients(&self.pool, recipe_id).await?;
        let instruments = recipe_db::list_instruments(&self.pool, recipe_id).await?;
        let prep_tasks = recipe_db::list_prep_tasks(&self.pool, recipe_id).await?;
        let prep_task_steps = recipe_db::list_prep_task_steps(&self.pool, recipe_id).await?;

        Ok(RecipeGraph::from_rows(
            recipe,
            steps,
            products,
            ingredients,
            instruments,
            prep_tasks,
            prep_task_steps,
        ))
    }

    async fn create_meal(&self, meal: &Meal, recipe_ids: &[Uuid]) -> Result<()> {
        let mut tx = self.pool.begin().await.context("failed to begin transaction")?;

        recipe_db::insert_meal(&mut *tx, meal).await?;
        for (position, recipe_id) in recipe_ids.iter().enumerate() {
            if recipe_db::get_recipe(&mut *tx, *recipe_id).await?.is_none() {
                return Err(EngineError::NotFound {
                    entity: "recipe",
                    id: *recipe_id,
                });
            }
            let position = i32::try_from(position).unwrap_or(i32::MAX);
            recipe_db::insert_meal_recipe(&mut *tx, meal.id, *recipe_id, position).await?;
        }

        tx.commit().await.context("failed to commit meal")?;
        Ok(())
    }

    async fn meal_recipe_ids(&self, meal_id: Uuid) -> Result<Vec<Uuid>> {
        if recipe_db::get_meal(&self.pool, meal_id).await?.is_none() {
            return Err(EngineError::NotFound {
                entity: "meal",
                id: meal_id,
            });
        }
        Ok(recipe_db::list_meal_recipe_ids(&self.pool, meal_id).await?)
    }

    async fn insert_plan(&self, plan: &PlanAggregate) -> Result<()> {
        let mut tx = self.pool.begin().await.context("failed to begin transaction")?;

        plan_db::insert_plan(&mut *tx, &plan.plan).await?;
        for event in &plan.events {
            plan_db::insert_event(&mut *tx, &event.event).await?;
            for option in &event.options {
                if recipe_db::get_meal(&mut *tx, option.meal_id).await?.is_none() {
                    return Err(EngineError::NotFound {
                        entity: "meal",
                        id: option.meal_id,
                    });
                }
                plan_db::insert_option(&mut *tx, option).await?;
            }
        }

        tx.commit().await.context("failed to commit meal plan")?;
        Ok(())
    }

    async fn load_plan(&self, plan_id: Uuid) -> Result<PlanAggregate> {
        let mut tx = self.pool.begin().await.context("failed to begin transaction")?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *tx)
            .await
            .context("failed to set snapshot isolation")?;

        let plan = plan_db::get_plan(&mut *tx, plan_id)
            .await?
            .ok_or(EngineError::NotFound {
                entity: "meal plan",
                id: plan_id,
            })?;
        let events = plan_db::list_events(&mut *tx, plan_id).await?;
        let options = plan_db::list_options(&mut *tx, plan_id).await?;
        let votes = votes::list_votes_for_plan(&mut *tx, plan_id).await?;

        tx.commit().await.context("failed to close snapshot")?;
        Ok(PlanAggregate::from_rows(plan, events, options, votes))
    }

    async fn record_ballot(&self, write: &BallotWrite, clock: &dyn Clock) -> Result<BallotOutcome> {
        let mut tx = self.pool.begin().await.context("failed to begin transaction")?;

        votes::lock_ballot(&mut *tx, write.plan_id, write.user_id).await?;
        let plan = plan_db::get_plan_for_share(&mut *tx, write.plan_id)
            .await?
            .ok_or(EngineError::NotFound {
                entity: "meal plan",
                id: write.plan_id,
            })?;

        let existing = votes::list_user_votes(&mut *tx, write.user_id, &write.option_ids()).await?;
        if let Some(outcome) = write.reconcile(&existing)? {
            ballot::check_open(&plan, clock.now())?;
            return Ok(outcome);
        }

        for vote in &write.votes {
            votes::insert_vote(&mut *tx, vote).await?;
        }

        // Deadline fence: read the clock as late as possible before commit.
        ballot::check_open(&plan, clock.now())?;
        tx.commit().await.context("failed to commit ballot")?;

        Ok(BallotOutcome::Recorded {
            votes: write.votes.len(),
        })
    }

    async fn commit_finalization(&self, commit: &FinalizationCommit) -> Result<()> {
        let mut tx = self.pool.begin().await.context("failed to begin transaction")?;

        let rows = plan_db::finalize_plan(
            &mut *tx,
            commit.plan_id,
            commit.expected_version,
            commit.outcome,
            commit.tie_recorded,
            commit.finalized_at,
        )
        .await?;
        if rows == 0 {
            return Err(EngineError::LeaseLost {
                plan_id: commit.plan_id,
            });
        }

        for chosen in &commit.chosen {
            let rows = plan_db::mark_option_chosen(&mut *tx, chosen.option_id, chosen.tiebroken).await?;
            if rows == 0 {
                return Err(EngineError::Internal(format!(
                    "option {} was already chosen",
                    chosen.option_id
                )));
            }
        }

        tx.commit().await.context("failed to commit finalization")?;
        Ok(())
    }

    async fn transition_plan_status(
        &self,
        plan_id: Uuid,
        from: PlanStatus,
        to: PlanStatus,
        expected_version: i64,
        voting_deadline: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let rows = plan_db::transition_plan_status(
            &self.pool,
            plan_id,
            from,
            to,
            expected_version,
            voting_deadline,
        )
        .await?;
        if rows == 0 {
            return Err(EngineError::LeaseLost { plan_id });
        }
        Ok(())
    }

    async fn insert_tasks(&self, option_id: Uuid, tasks: &[MealPlanTask]) -> Result<bool> {
        let mut tx = self.pool.begin().await.context("failed to begin transaction")?;

        if plan_db::flip_tasks_created(&mut *tx, option_id).await? == 0 {
            return Ok(false);
        }
        for task in tasks {
            task_db::insert_task(&mut *tx, task).await?;
        }

        tx.commit().await.context("failed to commit tasks")?;
        Ok(true)
    }

    async fn acquire_lease(
        &self,
        plan_id: Uuid,
        holder: Uuid,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<Option<PlanLease>> {
        Ok(leases::acquire_lease(&self.pool, plan_id, holder, now, now + ttl).await?)
    }

    async fn release_lease(&self, plan_id: Uuid, holder: Uuid, release: LeaseRelease) -> Result<()> {
        let rows = match release {
            LeaseRelease::Done => leases::release_lease(&self.pool, plan_id, holder).await?,
            LeaseRelease::Backoff { next_eligible_at } => {
                leases::release_lease_with_backoff(&self.pool, plan_id, holder, next_eligible_at)
                    .await?
            }
        };
        if rows == 0 {
            tracing::warn!(plan_id = %plan_id, holder = %holder, "lease was taken over before release");
        }
        Ok(())
    }

    async fn clear_lease(&self, plan_id: Uuid) -> Result<()> {
        leases::clear_lease(&self.pool, plan_id).await?;
        Ok(())
    }

    async fn plans_due_for_finalization(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Uuid>> {
        Ok(plan_db::plans_due_for_finalization(&self.pool, now, limit).await?)
    }

    async fn plans_due_for_materialization(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Uuid>> {
        Ok(plan_db::plans_due_for_materialization(&self.pool, now, limit).await?)
    }

    async fn list_tasks(&self, plan_id: Uuid, filter: &TaskFilter) -> Result<Vec<MealPlanTask>> {
        Ok(task_db::list_tasks(&self.pool, plan_id, filter).await?)
    }

    async fn get_task(&self, task_id: Uuid) -> Result<Option<MealPlanTask>> {
        Ok(task_db::get_task(&self.pool, task_id).await?)
    }

    async fn task_household(&self, task_id: Uuid) -> Result<Option<Uuid>> {
        Ok(task_db::household_for_task(&self.pool, task_id).await?)
    }

    async fn update_task_status(
        &self,
        task_id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
        explanation: &str,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let rows =
            task_db::transition_task_status(&self.pool, task_id, from, to, explanation, completed_at)
                .await?;
        Ok(rows > 0)
    }
}
