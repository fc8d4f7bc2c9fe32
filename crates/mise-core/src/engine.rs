//! The engine facade.
//!
//! [`Engine`] binds a repository, a clock and a publisher together and
//! exposes the request-path operations. Finalization and materialization
//! live in [`crate::finalize`] and [`crate::materialize`]; the worker loop
//! drives them.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use mise_db::models::{
    Meal, MealPlan, MealPlanEvent, MealPlanOption, MealPlanOptionVote, MealPlanTask, PlanStatus,
    TaskStatus,
};
use mise_db::queries::tasks::TaskFilter;
use serde::Serialize;
use uuid::Uuid;

use crate::ballot::{self, BallotOutcome, BallotVote, BallotWrite, EventMissingVoters, Voter};
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::model::{NewPlan, PlanAggregate};
use crate::publish::{topics, BufferedPublisher, DataChangeMessage, EventType};
use crate::recipe::{NewRecipe, RecipeGraph, RecipeGraphError, RecipeWalk};
use crate::repo::MealPlanRepository;
use crate::state::{PlanStateMachine, TaskStateMachine};

pub struct Engine {
    repo: Arc<dyn MealPlanRepository>,
    clock: Arc<dyn Clock>,
    publisher: Arc<BufferedPublisher>,
    config: EngineConfig,
}

/// A plan as one household member sees it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanView {
    pub plan: MealPlan,
    pub earliest_event: Option<DateTime<Utc>>,
    pub latest_event: Option<DateTime<Utc>>,
    pub events: Vec<EventView>,
    /// The viewer's own votes; empty without a viewer.
    pub my_votes: Vec<MealPlanOptionVote>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventView {
    pub event: MealPlanEvent,
    pub options: Vec<MealPlanOption>,
    /// Distinct users with a ballot on this event.
    pub voters: usize,
}

impl Engine {
    pub fn new(
        repo: Arc<dyn MealPlanRepository>,
        clock: Arc<dyn Clock>,
        publisher: Arc<BufferedPublisher>,
        config: EngineConfig,
    ) -> Self {
        Self {
            repo,
            clock,
            publisher,
            config,
        }
    }

    pub fn repo(&self) -> &Arc<dyn MealPlanRepository> {
        &self.repo
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn publisher(&self) -> &Arc<BufferedPublisher> {
        &self.publisher
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub(crate) fn emit(&self, topic: &str, message: DataChangeMessage) {
        self.publisher.enqueue(topic, message);
    }

    /// Flush buffered messages, bounded by `publisher.flush_timeout`.
    pub async fn shutdown(&self) -> bool {
        self.publisher.shutdown(self.config.flush_timeout()).await
    }

    // -- recipes and meals ---------------------------------------------------

    /// Validate and store an authored recipe. Recipes that fail the walk are
    /// refused before anything is written.
    pub async fn import_recipe(&self, recipe: NewRecipe) -> Result<RecipeGraph> {
        let recipe_id = Uuid::new_v4();
        let invalid = |source: RecipeGraphError| EngineError::RecipeGraphInvalid { recipe_id, source };
        let graph = recipe
            .into_graph_with_id(recipe_id, self.now())
            .map_err(invalid)?;
        RecipeWalk::new(graph.clone()).map_err(invalid)?;

        self.repo.insert_recipe(&graph).await?;
        tracing::info!(
            recipe_id = %recipe_id,
            name = %graph.recipe.name,
            steps = graph.steps.len(),
            prep_tasks = graph.prep_tasks.len(),
            "imported recipe"
        );
        Ok(graph)
    }

    /// Load and walk a stored recipe.
    pub async fn walk_recipe(&self, recipe_id: Uuid) -> Result<RecipeWalk> {
        let graph = self.repo.load_recipe(recipe_id).await?;
        RecipeWalk::new(graph).map_err(|source| EngineError::RecipeGraphInvalid { recipe_id, source })
    }

    pub async fn create_meal(&self, name: &str, recipe_ids: &[Uuid]) -> Result<Meal> {
        if recipe_ids.is_empty() {
            return Err(EngineError::InvalidPlan(format!(
                "meal {name:?} needs at least one recipe"
            )));
        }
        let meal = Meal {
            id: Uuid::new_v4(),
            name: name.to_owned(),
            created_at: self.now(),
        };
        self.repo.create_meal(&meal, recipe_ids).await?;
        tracing::info!(meal_id = %meal.id, name = %meal.name, recipes = recipe_ids.len(), "created meal");
        Ok(meal)
    }

    // -- plans ---------------------------------------------------------------

    pub async fn create_plan(&self, new_plan: NewPlan) -> Result<PlanAggregate> {
        let now = self.now();
        if new_plan.voting_deadline <= now {
            return Err(EngineError::InvalidPlan(format!(
                "voting deadline {} is not in the future",
                new_plan.voting_deadline
            )));
        }
        let plan = new_plan.into_aggregate(now)?;
        self.repo.insert_plan(&plan).await?;

        tracing::info!(
            plan_id = %plan.id(),
            household_id = %plan.plan.household_id,
            events = plan.events.len(),
            deadline = %plan.plan.voting_deadline,
            "created meal plan"
        );
        self.emit(
            topics::MEAL_PLANS,
            DataChangeMessage::new(
                EventType::MealPlanCreated,
                "meal_plan",
                plan.id(),
                plan.plan.household_id,
                now,
            ),
        );
        Ok(plan)
    }

    pub async fn get_plan(&self, plan_id: Uuid, viewer: Option<Uuid>) -> Result<PlanView> {
        let aggregate = self.repo.load_plan(plan_id).await?;
        let events = aggregate
            .events
            .iter()
            .map(|e| EventView {
                event: e.event.clone(),
                options: e.options.clone(),
                voters: aggregate.voters_for_event(e.event.id).len(),
            })
            .collect();
        let my_votes = viewer
            .map(|user| {
                aggregate
                    .votes
                    .iter()
                    .filter(|v| v.by_user == user)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(PlanView {
            earliest_event: aggregate.earliest_event(),
            latest_event: aggregate.latest_event(),
            plan: aggregate.plan,
            events,
            my_votes,
        })
    }

    pub async fn missing_voters(
        &self,
        plan_id: Uuid,
        members: &[Uuid],
    ) -> Result<Vec<EventMissingVoters>> {
        let plan = self.repo.load_plan(plan_id).await?;
        Ok(ballot::missing_voters(&plan, members))
    }

    /// Move a failed plan back to voting with a new deadline and clear its
    /// retry backoff.
    pub async fn replay_plan(&self, plan_id: Uuid, new_deadline: DateTime<Utc>) -> Result<MealPlan> {
        let now = self.now();
        let plan = self.repo.load_plan(plan_id).await?.plan;
        PlanStateMachine::check(plan.status, PlanStatus::AwaitingVotes)?;
        if new_deadline <= now {
            return Err(EngineError::InvalidPlan(format!(
                "replay deadline {new_deadline} is not in the future"
            )));
        }

        self.repo
            .transition_plan_status(
                plan_id,
                plan.status,
                PlanStatus::AwaitingVotes,
                plan.version,
                Some(new_deadline),
            )
            .await?;
        self.repo.clear_lease(plan_id).await?;

        tracing::info!(plan_id = %plan_id, deadline = %new_deadline, "replayed meal plan");
        self.emit(
            topics::MEAL_PLANS,
            DataChangeMessage::new(
                EventType::MealPlanFinalizationReplayed,
                "meal_plan",
                plan_id,
                plan.household_id,
                now,
            )
            .with_metadata(serde_json::json!({ "voting_deadline": new_deadline })),
        );
        Ok(self.repo.load_plan(plan_id).await?.plan)
    }

    // -- ballots -------------------------------------------------------------

    pub async fn submit_ballot(
        &self,
        plan_id: Uuid,
        voter: Voter,
        votes: &[BallotVote],
    ) -> Result<BallotOutcome> {
        let plan = self.repo.load_plan(plan_id).await?;
        ballot::check_open(&plan.plan, self.now())?;
        ballot::validate(&plan, &voter, votes)?;

        let write = BallotWrite::new(plan_id, &voter, votes, self.now())?;
        let outcome = self.repo.record_ballot(&write, self.clock.as_ref()).await?;

        match outcome {
            BallotOutcome::Recorded { votes } => {
                tracing::info!(plan_id = %plan_id, user_id = %voter.user_id, votes, "recorded ballot");
                for vote in &write.votes {
                    self.emit(
                        topics::MEAL_PLAN_OPTION_VOTES,
                        DataChangeMessage::new(
                            EventType::MealPlanOptionVoteCreated,
                            "meal_plan_option_vote",
                            vote.id,
                            voter.household_id,
                            vote.created_at,
                        )
                        .with_metadata(serde_json::json!({
                            "plan_id": plan_id,
                            "option_id": vote.option_id,
                        })),
                    );
                }
            }
            BallotOutcome::Replayed => {
                tracing::debug!(plan_id = %plan_id, user_id = %voter.user_id, "identical ballot replayed");
            }
        }
        Ok(outcome)
    }

    // -- tasks ---------------------------------------------------------------

    pub async fn list_tasks(&self, plan_id: Uuid, filter: &TaskFilter) -> Result<Vec<MealPlanTask>> {
        // Surface NotFound for unknown plans instead of an empty page.
        self.repo.load_plan(plan_id).await?;
        self.repo.list_tasks(plan_id, filter).await
    }

    pub async fn change_task_status(
        &self,
        task_id: Uuid,
        to: TaskStatus,
        explanation: &str,
    ) -> Result<MealPlanTask> {
        let not_found = || EngineError::NotFound {
            entity: "meal plan task",
            id: task_id,
        };
        let task = self.repo.get_task(task_id).await?.ok_or_else(not_found)?;
        TaskStateMachine::check(task.status, to)?;

        let now = self.now();
        let completed_at = (to == TaskStatus::Finished).then_some(now);
        let updated = self
            .repo
            .update_task_status(task_id, task.status, to, explanation, completed_at)
            .await?;
        if !updated {
            let current = self.repo.get_task(task_id).await?.ok_or_else(not_found)?;
            return Err(EngineError::illegal_task_transition(current.status, to));
        }

        let household_id = self.repo.task_household(task_id).await?.ok_or_else(not_found)?;
        tracing::info!(task_id = %task_id, from = %task.status, to = %to, "changed task status");
        self.emit(
            topics::MEAL_PLAN_TASKS,
            DataChangeMessage::new(
                EventType::MealPlanTaskStatusChanged,
                "meal_plan_task",
                task_id,
                household_id,
                now,
            )
            .with_metadata(serde_json::json!({
                "from": task.status,
                "to": to,
            })),
        );

        self.repo.get_task(task_id).await?.ok_or_else(not_found)
    }
}
