//! Engine error taxonomy.
//!
//! Request-path operations surface these to the caller as typed results.
//! The worker uses [`EngineError::is_transient`] to decide between retrying
//! with backoff and giving up on a plan.

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::recipe::RecipeGraphError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("voting for plan {plan_id} closed at {deadline}")]
    DeadlinePassed {
        plan_id: Uuid,
        deadline: DateTime<Utc>,
    },

    #[error("voting for plan {plan_id} is open until {deadline}")]
    VotingStillOpen {
        plan_id: Uuid,
        deadline: DateTime<Utc>,
    },

    #[error("user {user_id} has already voted on option {option_id}")]
    DuplicateBallot { user_id: Uuid, option_id: Uuid },

    #[error("{}", incomplete_message(.event_id, .missing))]
    IncompleteBallot {
        event_id: Option<Uuid>,
        missing: Vec<Uuid>,
    },

    #[error("rank {rank} for option {option_id} is out of range")]
    RankOutOfRange { option_id: Uuid, rank: u32 },

    #[error("user {user_id} may not vote on plan {plan_id}")]
    NotAuthorized { user_id: Uuid, plan_id: Uuid },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("illegal {entity} transition: {from} -> {to}")]
    IllegalTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    #[error("lost the lease or version race on plan {plan_id}")]
    LeaseLost { plan_id: Uuid },

    #[error("recipe {recipe_id} has an invalid step graph: {source}")]
    RecipeGraphInvalid {
        recipe_id: Uuid,
        #[source]
        source: RecipeGraphError,
    },

    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    #[error("repository unavailable: {0:#}")]
    RepositoryUnavailable(#[from] anyhow::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

fn incomplete_message(event_id: &Option<Uuid>, missing: &[Uuid]) -> String {
    match event_id {
        Some(event) => format!(
            "ballot omits {} option(s) of event {event}",
            missing.len()
        ),
        None => "ballot contains no votes".to_owned(),
    }
}

impl EngineError {
    /// Errors worth retrying with backoff. Everything else is permanent for
    /// the current attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RepositoryUnavailable(_))
    }

    pub fn illegal_plan_transition(
        from: mise_db::models::PlanStatus,
        to: mise_db::models::PlanStatus,
    ) -> Self {
        Self::IllegalTransition {
            entity: "meal plan",
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    pub fn illegal_task_transition(
        from: mise_db::models::TaskStatus,
        to: mise_db::models::TaskStatus,
    ) -> Self {
        Self::IllegalTransition {
            entity: "meal plan task",
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
