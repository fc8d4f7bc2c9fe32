//! The storage boundary the engine drives.
//!
//! [`MealPlanRepository`] is deliberately narrow: every method is one
//! atomic unit of work. [`PgRepository`] backs it with PostgreSQL and
//! [`MemoryRepository`] with a mutex-guarded map for tests and dry runs.

mod memory;
mod postgres;

pub use memory::MemoryRepository;
pub use postgres::PgRepository;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use mise_db::models::{Meal, MealPlanTask, PlanLease, PlanStatus, TaskStatus};
use mise_db::queries::tasks::TaskFilter;
use uuid::Uuid;

use crate::ballot::{BallotOutcome, BallotWrite};
use crate::clock::Clock;
use crate::error::Result;
use crate::model::PlanAggregate;
use crate::recipe::RecipeGraph;

/// Everything one finalization writes, applied in a single transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct FinalizationCommit {
    pub plan_id: Uuid,
    /// Plan version the result was computed from.
    pub expected_version: i64,
    pub outcome: PlanStatus,
    pub tie_recorded: bool,
    pub finalized_at: Option<DateTime<Utc>>,
    pub chosen: Vec<ChosenOption>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChosenOption {
    pub option_id: Uuid,
    pub tiebroken: bool,
}

/// How a worker gives a lease back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseRelease {
    /// Work finished; reset attempts and backoff.
    Done,
    /// Work failed; count an attempt and keep the plan out of sweeps until
    /// `next_eligible_at`.
    Backoff { next_eligible_at: DateTime<Utc> },
}

#[async_trait]
pub trait MealPlanRepository: Send + Sync {
    /// Store a recipe graph and all its rows.
    async fn insert_recipe(&self, graph: &RecipeGraph) -> Result<()>;

    /// Load a recipe graph. `NotFound` if the recipe does not exist.
    async fn load_recipe(&self, recipe_id: Uuid) -> Result<RecipeGraph>;

    /// Store a meal and its ordered recipes.
    async fn create_meal(&self, meal: &Meal, recipe_ids: &[Uuid]) -> Result<()>;

    async fn meal_recipe_ids(&self, meal_id: Uuid) -> Result<Vec<Uuid>>;

    /// Store a new plan with its events and options.
    async fn insert_plan(&self, plan: &PlanAggregate) -> Result<()>;

    /// Load a plan, its events, options and votes from one consistent read.
    async fn load_plan(&self, plan_id: Uuid) -> Result<PlanAggregate>;

    /// Atomically record a ballot.
    ///
    /// Ballots for one (plan, user) are serialized. The voting deadline is
    /// checked against `clock` inside the write so a ballot committing after
    /// the deadline is rejected.
    async fn record_ballot(&self, ballot: &BallotWrite, clock: &dyn Clock) -> Result<BallotOutcome>;

    /// Apply a finalization result. Fails with `LeaseLost` and writes nothing
    /// when the plan is no longer at `expected_version`.
    async fn commit_finalization(&self, commit: &FinalizationCommit) -> Result<()>;

    /// Compare-and-set a plan status, optionally replacing its deadline.
    /// Fails with `LeaseLost` when the CAS loses.
    async fn transition_plan_status(
        &self,
        plan_id: Uuid,
        from: PlanStatus,
        to: PlanStatus,
        expected_version: i64,
        voting_deadline: Option<DateTime<Utc>>,
    ) -> Result<()>;

    /// Insert an option's tasks and flip its `tasks_created` flag together.
    /// Returns `false` without inserting when the flag was already set.
    async fn insert_tasks(&self, option_id: Uuid, tasks: &[MealPlanTask]) -> Result<bool>;

    async fn acquire_lease(
        &self,
        plan_id: Uuid,
        holder: Uuid,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<Option<PlanLease>>;

    async fn release_lease(&self, plan_id: Uuid, holder: Uuid, release: LeaseRelease) -> Result<()>;

    /// Remove the lease row, including backoff state.
    async fn clear_lease(&self, plan_id: Uuid) -> Result<()>;

    async fn plans_due_for_finalization(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Uuid>>;

    async fn plans_due_for_materialization(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Uuid>>;

    async fn list_tasks(&self, plan_id: Uuid, filter: &TaskFilter) -> Result<Vec<MealPlanTask>>;

    async fn get_task(&self, task_id: Uuid) -> Result<Option<MealPlanTask>>;

    /// Household owning the plan a task belongs to.
    async fn task_household(&self, task_id: Uuid) -> Result<Option<Uuid>>;

    /// Compare-and-set a task status. Returns `false` when the task was not
    /// in `from`.
    async fn update_task_status(
        &self,
        task_id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
        explanation: &str,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<bool>;
}
