//! Plan finalization.
//!
//! Tallies each event's ballots, validates the winners' recipes and writes
//! the chosen flags together with the plan's new status under a version
//! compare-and-set. Messages go out only after that commit.

use std::collections::BTreeMap;

use mise_db::models::{MealPlanOptionVote, PlanStatus};
use serde::Serialize;
use uuid::Uuid;

use crate::config::TieBreak;
use crate::engine::Engine;
use crate::error::{EngineError, Result};
use crate::model::{EventWithOptions, PlanAggregate};
use crate::publish::{topics, DataChangeMessage, EventType};
use crate::recipe::RecipeWalk;
use crate::repo::{ChosenOption, FinalizationCommit};
use crate::state::PlanStateMachine;
use crate::tally::{self, Ballot};

/// The winner of one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EventWinner {
    pub event_id: Uuid,
    pub option_id: Uuid,
    pub tie: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FailureReason {
    /// These events had no ballots.
    NoQuorum { events: Vec<Uuid> },
    /// A winning option's recipe cannot be scheduled.
    InvalidRecipe { recipe_id: Uuid, error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FinalizeOutcome {
    Finalized { tie: bool, winners: Vec<EventWinner> },
    Failed(FailureReason),
}

/// Group an event's votes into per-voter ballots, dropping abstentions.
/// Voters who abstained on everything contribute no ballot.
pub fn event_ballots(votes: &[&MealPlanOptionVote]) -> Result<Vec<Ballot<Uuid>>> {
    let mut by_user: BTreeMap<Uuid, Ballot<Uuid>> = BTreeMap::new();
    for vote in votes.iter().filter(|v| !v.abstain) {
        let rank = u32::try_from(vote.rank).map_err(|_| {
            EngineError::Internal(format!("stored vote {} has negative rank {}", vote.id, vote.rank))
        })?;
        by_user.entry(vote.by_user).or_default().insert(vote.option_id, rank);
    }
    Ok(by_user.into_values().collect())
}

fn tally_event(
    event: &EventWithOptions,
    plan: &PlanAggregate,
    tie_break: TieBreak,
) -> Result<Option<EventWinner>> {
    let votes = plan.votes_for_event(event.event.id);
    if votes.is_empty() {
        return Ok(None);
    }
    let candidates: Vec<Uuid> = event.options.iter().map(|o| o.id).collect();
    let Some(result) = tally::schulze(&candidates, &event_ballots(&votes)?) else {
        return Ok(None);
    };
    let option_id = match tie_break {
        TieBreak::Lexicographic => result.chosen,
    };
    Ok(Some(EventWinner {
        event_id: event.event.id,
        option_id,
        tie: result.tie,
    }))
}

impl Engine {
    /// Finalize a plan whose voting deadline has passed.
    ///
    /// Every event needs at least one ballot; otherwise the plan moves to
    /// `finalization_failed` with nothing chosen. Losing the version race to
    /// another finalizer surfaces as `LeaseLost`.
    pub async fn finalize_plan(&self, plan_id: Uuid) -> Result<FinalizeOutcome> {
        let now = self.now();
        let plan = self.repo().load_plan(plan_id).await?;
        PlanStateMachine::check(plan.plan.status, PlanStatus::Finalized)?;
        if now < plan.plan.voting_deadline {
            return Err(EngineError::VotingStillOpen {
                plan_id,
                deadline: plan.plan.voting_deadline,
            });
        }

        let mut winners = Vec::with_capacity(plan.events.len());
        let mut unvoted = Vec::new();
        for event in &plan.events {
            match tally_event(event, &plan, self.config().tally.tie_break)? {
                Some(winner) => winners.push(winner),
                None => unvoted.push(event.event.id),
            }
        }

        if !unvoted.is_empty() {
            tracing::warn!(plan_id = %plan_id, events = unvoted.len(), "no quorum, failing finalization");
            return self
                .fail_finalization(&plan, FailureReason::NoQuorum { events: unvoted })
                .await;
        }

        for winner in &winners {
            if let Err(reason) = self.check_winner_recipes(&plan, winner).await? {
                return self.fail_finalization(&plan, reason).await;
            }
        }

        let tie = winners.iter().any(|w| w.tie);
        let commit = FinalizationCommit {
            plan_id,
            expected_version: plan.plan.version,
            outcome: PlanStatus::Finalized,
            tie_recorded: tie,
            finalized_at: Some(now),
            chosen: winners
                .iter()
                .map(|w| ChosenOption {
                    option_id: w.option_id,
                    tiebroken: w.tie,
                })
                .collect(),
        };
        self.repo().commit_finalization(&commit).await?;

        tracing::info!(plan_id = %plan_id, events = winners.len(), tie, "finalized meal plan");
        let household_id = plan.plan.household_id;
        for winner in &winners {
            self.emit(
                topics::MEAL_PLAN_OPTIONS,
                DataChangeMessage::new(
                    EventType::MealPlanOptionFinalized,
                    "meal_plan_option",
                    winner.option_id,
                    household_id,
                    now,
                )
                .with_metadata(serde_json::json!({
                    "plan_id": plan_id,
                    "event_id": winner.event_id,
                    "tiebroken": winner.tie,
                })),
            );
        }
        self.emit(
            topics::MEAL_PLANS,
            DataChangeMessage::new(EventType::MealPlanFinalized, "meal_plan", plan_id, household_id, now)
                .with_metadata(serde_json::json!({ "tie_recorded": tie })),
        );

        Ok(FinalizeOutcome::Finalized { tie, winners })
    }

    /// Walk every recipe of a winning option. The outer error is a
    /// repository failure; the inner one names the first unusable recipe.
    async fn check_winner_recipes(
        &self,
        plan: &PlanAggregate,
        winner: &EventWinner,
    ) -> Result<std::result::Result<(), FailureReason>> {
        let option = plan.option(winner.option_id).ok_or(EngineError::NotFound {
            entity: "meal plan option",
            id: winner.option_id,
        })?;
        for recipe_id in self.repo().meal_recipe_ids(option.meal_id).await? {
            let graph = self.repo().load_recipe(recipe_id).await?;
            if let Err(error) = RecipeWalk::new(graph) {
                tracing::error!(
                    plan_id = %plan.id(),
                    recipe_id = %recipe_id,
                    error = %error,
                    "winning option has an invalid recipe"
                );
                self.emit(
                    topics::ALERTS,
                    DataChangeMessage::new(
                        EventType::RecipeGraphInvalid,
                        "recipe",
                        recipe_id,
                        plan.plan.household_id,
                        self.now(),
                    )
                    .with_metadata(serde_json::json!({
                        "plan_id": plan.id(),
                        "error": error.to_string(),
                    })),
                );
                return Ok(Err(FailureReason::InvalidRecipe {
                    recipe_id,
                    error: error.to_string(),
                }));
            }
        }
        Ok(Ok(()))
    }

    async fn fail_finalization(
        &self,
        plan: &PlanAggregate,
        reason: FailureReason,
    ) -> Result<FinalizeOutcome> {
        let now = self.now();
        let commit = FinalizationCommit {
            plan_id: plan.id(),
            expected_version: plan.plan.version,
            outcome: PlanStatus::FinalizationFailed,
            tie_recorded: false,
            finalized_at: None,
            chosen: Vec::new(),
        };
        self.repo().commit_finalization(&commit).await?;

        tracing::info!(plan_id = %plan.id(), ?reason, "meal plan finalization failed");
        self.emit(
            topics::MEAL_PLANS,
            DataChangeMessage::new(
                EventType::MealPlanFinalizationFailed,
                "meal_plan",
                plan.id(),
                plan.plan.household_id,
                now,
            )
            .with_metadata(serde_json::to_value(&reason).unwrap_or_default()),
        );
        Ok(FinalizeOutcome::Failed(reason))
    }
}
