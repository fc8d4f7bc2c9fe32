use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use mise_db::models::{
    Meal, MealPlan, MealPlanEvent, MealPlanOption, MealPlanOptionVote, MealPlanTask, PlanLease,
    PlanStatus, TaskStatus,
};
use mise_db::queries::tasks::TaskFilter;

use super::{FinalizationCommit, LeaseRelease, MealPlanRepository};
use crate::ballot::{self, BallotOutcome, BallotWrite};
use crate::clock::Clock;
use crate::error::{EngineError, Result};
use crate::model::PlanAggregate;
use crate::recipe::RecipeGraph;

#[derive(Debug, Default)]
struct State {
    recipes: HashMap<Uuid, RecipeGraph>,
    meals: HashMap<Uuid, (Meal, Vec<Uuid>)>,
    plans: HashMap<Uuid, MealPlan>,
    events: HashMap<Uuid, MealPlanEvent>,
    options: HashMap<Uuid, MealPlanOption>,
    votes: Vec<MealPlanOptionVote>,
    tasks: HashMap<Uuid, MealPlanTask>,
    leases: HashMap<Uuid, PlanLease>,
    failing_writes: usize,
}

impl State {
    fn plan_of_option(&self, option_id: Uuid) -> Option<Uuid> {
        let option = self.options.get(&option_id)?;
        self.events.get(&option.event_id).map(|e| e.plan_id)
    }

    fn backoff_elapsed(&self, plan_id: Uuid, now: DateTime<Utc>) -> bool {
        self.leases
            .get(&plan_id)
            .and_then(|l| l.next_eligible_at)
            .is_none_or(|at| at <= now)
    }

    fn take_failure(&mut self) -> Result<()> {
        if self.failing_writes > 0 {
            self.failing_writes -= 1;
            return Err(EngineError::RepositoryUnavailable(anyhow::anyhow!(
                "injected repository failure"
            )));
        }
        Ok(())
    }
}

/// In-process repository with the same atomicity as [`super::PgRepository`]:
/// every method runs under one lock and validates before mutating.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    state: Mutex<State>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make the next `count` finalization, status, or task writes fail with
    /// `RepositoryUnavailable`.
    pub fn fail_next_writes(&self, count: usize) {
        self.state().failing_writes = count;
    }

    pub fn lease(&self, plan_id: Uuid) -> Option<PlanLease> {
        self.state().leases.get(&plan_id).cloned()
    }
}

#[async_trait]
impl MealPlanRepository for MemoryRepository {
    async fn insert_recipe(&self, graph: &RecipeGraph) -> Result<()> {
        self.state().recipes.insert(graph.recipe.id, graph.clone());
        Ok(())
    }

    async fn load_recipe(&self, recipe_id: Uuid) -> Result<RecipeGraph> {
        self.state()
            .recipes
            .get(&recipe_id)
            .cloned()
            .ok_or(EngineError::NotFound {
                entity: "recipe",
                id: recipe_id,
            })
    }

    async fn create_meal(&self, meal: &Meal, recipe_ids: &[Uuid]) -> Result<()> {
        let mut state = self.state();
        if let Some(missing) = recipe_ids.iter().find(|id| !state.recipes.contains_key(id)) {
            return Err(EngineError::NotFound {
                entity: "recipe",
                id: *missing,
            });
        }
        state
            .meals
            .insert(meal.id, (meal.clone(), recipe_ids.to_vec()));
        Ok(())
    }

    async fn meal_recipe_ids(&self, meal_id: Uuid) -> Result<Vec<Uuid>> {
        self.state()
            .meals
            .get(&meal_id)
            .map(|(_, recipes)| recipes.clone())
            .ok_or(EngineError::NotFound {
                entity: "meal",
                id: meal_id,
            })
    }

    async fn insert_plan(&self, plan: &PlanAggregate) -> Result<()> {
        let mut state = self.state();
        if let Some(option) = plan.options().find(|o| !state.meals.contains_key(&o.meal_id)) {
            return Err(EngineError::NotFound {
                entity: "meal",
                id: option.meal_id,
            });
        }
        state.plans.insert(plan.id(), plan.plan.clone());
        for event in &plan.events {
            state.events.insert(event.event.id, event.event.clone());
            for option in &event.options {
                state.options.insert(option.id, option.clone());
            }
        }
        Ok(())
    }

    async fn load_plan(&self, plan_id: Uuid) -> Result<PlanAggregate> {
        let state = self.state();
        let plan = state.plans.get(&plan_id).cloned().ok_or(EngineError::NotFound {
            entity: "meal plan",
            id: plan_id,
        })?;

        let mut events: Vec<MealPlanEvent> = state
            .events
            .values()
            .filter(|e| e.plan_id == plan_id)
            .cloned()
            .collect();
        events.sort_by_key(|e| (e.starts_at, e.id));
        let event_ids: HashSet<Uuid> = events.iter().map(|e| e.id).collect();

        let options: Vec<MealPlanOption> = state
            .options
            .values()
            .filter(|o| event_ids.contains(&o.event_id))
            .cloned()
            .collect();
        let option_ids: HashSet<Uuid> = options.iter().map(|o| o.id).collect();

        let votes = state
            .votes
            .iter()
            .filter(|v| option_ids.contains(&v.option_id))
            .cloned()
            .collect();

        Ok(PlanAggregate::from_rows(plan, events, options, votes))
    }

    async fn record_ballot(&self, write: &BallotWrite, clock: &dyn Clock) -> Result<BallotOutcome> {
        let mut state = self.state();
        let plan = state
            .plans
            .get(&write.plan_id)
            .cloned()
            .ok_or(EngineError::NotFound {
                entity: "meal plan",
                id: write.plan_id,
            })?;

        let option_ids: HashSet<Uuid> = write.option_ids().into_iter().collect();
        let existing: Vec<MealPlanOptionVote> = state
            .votes
            .iter()
            .filter(|v| v.by_user == write.user_id && option_ids.contains(&v.option_id))
            .cloned()
            .collect();
        if let Some(outcome) = write.reconcile(&existing)? {
            ballot::check_open(&plan, clock.now())?;
            return Ok(outcome);
        }

        ballot::check_open(&plan, clock.now())?;
        state.votes.extend(write.votes.iter().cloned());
        Ok(BallotOutcome::Recorded {
            votes: write.votes.len(),
        })
    }

    async fn commit_finalization(&self, commit: &FinalizationCommit) -> Result<()> {
        let mut state = self.state();
        state.take_failure()?;

        let current = state.plans.get(&commit.plan_id).ok_or(EngineError::NotFound {
            entity: "meal plan",
            id: commit.plan_id,
        })?;
        if current.version != commit.expected_version || current.status != PlanStatus::AwaitingVotes {
            return Err(EngineError::LeaseLost {
                plan_id: commit.plan_id,
            });
        }
        for chosen in &commit.chosen {
            match state.options.get(&chosen.option_id) {
                Some(o) if !o.chosen => {}
                _ => {
                    return Err(EngineError::Internal(format!(
                        "option {} is missing or already chosen",
                        chosen.option_id
                    )));
                }
            }
        }

        for chosen in &commit.chosen {
            if let Some(option) = state.options.get_mut(&chosen.option_id) {
                option.chosen = true;
                option.tiebroken = chosen.tiebroken;
            }
        }
        if let Some(plan) = state.plans.get_mut(&commit.plan_id) {
            plan.status = commit.outcome;
            plan.tie_recorded = commit.tie_recorded;
            plan.finalized_at = commit.finalized_at;
            plan.version += 1;
        }
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
        let mut state = self.state();
        state.take_failure()?;

        let plan = state.plans.get_mut(&plan_id).ok_or(EngineError::NotFound {
            entity: "meal plan",
            id: plan_id,
        })?;
        if plan.status != from || plan.version != expected_version {
            return Err(EngineError::LeaseLost { plan_id });
        }
        plan.status = to;
        if let Some(deadline) = voting_deadline {
            plan.voting_deadline = deadline;
        }
        plan.version += 1;
        Ok(())
    }

    async fn insert_tasks(&self, option_id: Uuid, tasks: &[MealPlanTask]) -> Result<bool> {
        let mut state = self.state();
        state.take_failure()?;

        let Some(option) = state.options.get_mut(&option_id) else {
            return Ok(false);
        };
        if !option.chosen || option.tasks_created {
            return Ok(false);
        }
        option.tasks_created = true;
        for task in tasks {
            state.tasks.insert(task.id, task.clone());
        }
        Ok(true)
    }

    async fn acquire_lease(
        &self,
        plan_id: Uuid,
        holder: Uuid,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<Option<PlanLease>> {
        let mut state = self.state();
        let lease = state.leases.entry(plan_id).or_insert_with(|| PlanLease {
            plan_id,
            holder: None,
            expires_at: None,
            attempts: 0,
            next_eligible_at: None,
        });
        let free = lease.holder.is_none_or(|h| h == holder)
            || lease.expires_at.is_none_or(|at| at <= now);
        if !free {
            return Ok(None);
        }
        lease.holder = Some(holder);
        lease.expires_at = Some(now + ttl);
        Ok(Some(lease.clone()))
    }

    async fn release_lease(&self, plan_id: Uuid, holder: Uuid, release: LeaseRelease) -> Result<()> {
        let mut state = self.state();
        let Some(lease) = state
            .leases
            .get_mut(&plan_id)
            .filter(|l| l.holder == Some(holder))
        else {
            tracing::warn!(plan_id = %plan_id, holder = %holder, "lease was taken over before release");
            return Ok(());
        };
        lease.holder = None;
        lease.expires_at = None;
        match release {
            LeaseRelease::Done => {
                lease.attempts = 0;
                lease.next_eligible_at = None;
            }
            LeaseRelease::Backoff { next_eligible_at } => {
                lease.attempts += 1;
                lease.next_eligible_at = Some(next_eligible_at);
            }
        }
        Ok(())
    }

    async fn clear_lease(&self, plan_id: Uuid) -> Result<()> {
        self.state().leases.remove(&plan_id);
        Ok(())
    }

    async fn plans_due_for_finalization(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Uuid>> {
        let state = self.state();
        let mut due: Vec<&MealPlan> = state
            .plans
            .values()
            .filter(|p| p.status == PlanStatus::AwaitingVotes && p.voting_deadline <= now)
            .filter(|p| state.backoff_elapsed(p.id, now))
            .collect();
        due.sort_by_key(|p| (p.voting_deadline, p.id));
        Ok(due
            .into_iter()
            .take(usize::try_from(limit).unwrap_or(0))
            .map(|p| p.id)
            .collect())
    }

    async fn plans_due_for_materialization(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Uuid>> {
        let state = self.state();
        let pending: HashSet<Uuid> = state
            .options
            .values()
            .filter(|o| o.chosen && !o.tasks_created)
            .filter_map(|o| state.plan_of_option(o.id))
            .collect();
        let mut due: Vec<&MealPlan> = state
            .plans
            .values()
            .filter(|p| p.status == PlanStatus::Finalized && pending.contains(&p.id))
            .filter(|p| state.backoff_elapsed(p.id, now))
            .collect();
        due.sort_by_key(|p| (p.voting_deadline, p.id));
        Ok(due
            .into_iter()
            .take(usize::try_from(limit).unwrap_or(0))
            .map(|p| p.id)
            .collect())
    }

    async fn list_tasks(&self, plan_id: Uuid, filter: &TaskFilter) -> Result<Vec<MealPlanTask>> {
        let state = self.state();
        let mut tasks: Vec<MealPlanTask> = state
            .tasks
            .values()
            .filter(|t| state.plan_of_option(t.option_id) == Some(plan_id))
            .filter(|t| filter.matches(t))
            .cloned()
            .collect();
        tasks.sort_by_key(|t| (t.must_finish_by, t.cannot_start_before, t.id));
        Ok(tasks
            .into_iter()
            .skip(usize::try_from(filter.offset).unwrap_or(0))
            .take(usize::try_from(filter.limit).unwrap_or(0))
            .collect())
    }

    async fn get_task(&self, task_id: Uuid) -> Result<Option<MealPlanTask>> {
        Ok(self.state().tasks.get(&task_id).cloned())
    }

    async fn task_household(&self, task_id: Uuid) -> Result<Option<Uuid>> {
        let state = self.state();
        Ok(state
            .tasks
            .get(&task_id)
            .and_then(|t| state.plan_of_option(t.option_id))
            .and_then(|plan_id| state.plans.get(&plan_id))
            .map(|p| p.household_id))
    }

    async fn update_task_status(
        &self,
        task_id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
        explanation: &str,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let mut state = self.state();
        let Some(task) = state.tasks.get_mut(&task_id).filter(|t| t.status == from) else {
            return Ok(false);
        };
        task.status = to;
        task.status_explanation = explanation.to_owned();
        task.completed_at = completed_at;
        Ok(true)
    }
}
