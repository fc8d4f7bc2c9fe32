//! Plan aggregates and the inputs that create them.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use mise_db::models::{
    ElectionMethod, MealName, MealPlan, MealPlanEvent, MealPlanOption, MealPlanOptionVote,
    PlanStatus,
};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{EngineError, Result};

/// An event together with its candidate options.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventWithOptions {
    pub event: MealPlanEvent,
    pub options: Vec<MealPlanOption>,
}

/// A plan with everything finalization reads, loaded in one consistent
/// snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanAggregate {
    pub plan: MealPlan,
    pub events: Vec<EventWithOptions>,
    pub votes: Vec<MealPlanOptionVote>,
}

impl PlanAggregate {
    /// Group flat rows into an aggregate. Events keep their given order;
    /// options attach to their parent event.
    pub fn from_rows(
        plan: MealPlan,
        events: Vec<MealPlanEvent>,
        options: Vec<MealPlanOption>,
        votes: Vec<MealPlanOptionVote>,
    ) -> Self {
        let mut by_event: HashMap<Uuid, Vec<MealPlanOption>> = HashMap::new();
        for option in options {
            by_event.entry(option.event_id).or_default().push(option);
        }
        let events = events
            .into_iter()
            .map(|event| {
                let mut options = by_event.remove(&event.id).unwrap_or_default();
                options.sort_by_key(|o| o.id);
                EventWithOptions { event, options }
            })
            .collect();
        Self { plan, events, votes }
    }

    pub fn id(&self) -> Uuid {
        self.plan.id
    }

    pub fn earliest_event(&self) -> Option<DateTime<Utc>> {
        self.events.iter().map(|e| e.event.starts_at).min()
    }

    pub fn latest_event(&self) -> Option<DateTime<Utc>> {
        self.events.iter().map(|e| e.event.ends_at).max()
    }

    pub fn options(&self) -> impl Iterator<Item = &MealPlanOption> {
        self.events.iter().flat_map(|e| e.options.iter())
    }

    pub fn option(&self, option_id: Uuid) -> Option<&MealPlanOption> {
        self.options().find(|o| o.id == option_id)
    }

    pub fn event(&self, event_id: Uuid) -> Option<&EventWithOptions> {
        self.events.iter().find(|e| e.event.id == event_id)
    }

    /// Votes cast on any option of `event_id`.
    pub fn votes_for_event(&self, event_id: Uuid) -> Vec<&MealPlanOptionVote> {
        let Some(event) = self.event(event_id) else {
            return Vec::new();
        };
        let options: HashSet<Uuid> = event.options.iter().map(|o| o.id).collect();
        self.votes
            .iter()
            .filter(|v| options.contains(&v.option_id))
            .collect()
    }

    /// Users with a ballot on `event_id`.
    pub fn voters_for_event(&self, event_id: Uuid) -> HashSet<Uuid> {
        self.votes_for_event(event_id)
            .into_iter()
            .map(|v| v.by_user)
            .collect()
    }

    /// Options already chosen, across all events.
    pub fn chosen_options(&self) -> impl Iterator<Item = (&MealPlanEvent, &MealPlanOption)> {
        self.events
            .iter()
            .flat_map(|e| e.options.iter().filter(|o| o.chosen).map(move |o| (&e.event, o)))
    }
}

// ---------------------------------------------------------------------------
// Creation inputs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct NewPlan {
    pub household_id: Uuid,
    pub notes: String,
    pub voting_deadline: DateTime<Utc>,
    pub events: Vec<NewEvent>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub meal_name: MealName,
    pub notes: String,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub options: Vec<NewOption>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewOption {
    pub meal_id: Uuid,
    pub notes: String,
    pub assigned_cook: Option<Uuid>,
}

impl NewPlan {
    /// Check creation invariants: at least one event, every event has a
    /// window and an option, and events of the same meal on the same UTC day
    /// do not overlap.
    pub fn validate(&self) -> Result<()> {
        if self.events.is_empty() {
            return Err(EngineError::InvalidPlan("a plan needs at least one event".into()));
        }
        for (i, event) in self.events.iter().enumerate() {
            if event.starts_at >= event.ends_at {
                return Err(EngineError::InvalidPlan(format!(
                    "event {i} ({}) must start before it ends",
                    event.meal_name
                )));
            }
            if event.options.is_empty() {
                return Err(EngineError::InvalidPlan(format!(
                    "event {i} ({}) has no options",
                    event.meal_name
                )));
            }
        }
        for (i, a) in self.events.iter().enumerate() {
            for b in &self.events[i + 1..] {
                let same_slot = a.meal_name == b.meal_name
                    && a.starts_at.date_naive() == b.starts_at.date_naive();
                if same_slot && a.starts_at < b.ends_at && b.starts_at < a.ends_at {
                    return Err(EngineError::InvalidPlan(format!(
                        "overlapping {} events on {}",
                        a.meal_name,
                        a.starts_at.date_naive()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Validate and assign ids, producing an awaiting-votes aggregate.
    pub fn into_aggregate(self, now: DateTime<Utc>) -> Result<PlanAggregate> {
        self.validate()?;
        let plan = MealPlan {
            id: Uuid::new_v4(),
            household_id: self.household_id,
            status: PlanStatus::AwaitingVotes,
            notes: self.notes,
            election_method: ElectionMethod::Schulze,
            voting_deadline: self.voting_deadline,
            tie_recorded: false,
            version: 0,
            created_at: now,
            finalized_at: None,
        };
        let events = self
            .events
            .into_iter()
            .map(|e| {
                let event = MealPlanEvent {
                    id: Uuid::new_v4(),
                    plan_id: plan.id,
                    meal_name: e.meal_name,
                    notes: e.notes,
                    starts_at: e.starts_at,
                    ends_at: e.ends_at,
                    created_at: now,
                };
                let options = e
                    .options
                    .into_iter()
                    .map(|o| MealPlanOption {
                        id: Uuid::new_v4(),
                        event_id: event.id,
                        meal_id: o.meal_id,
                        notes: o.notes,
                        assigned_cook: o.assigned_cook,
                        chosen: false,
                        tiebroken: false,
                        tasks_created: false,
                        created_at: now,
                    })
                    .collect();
                EventWithOptions { event, options }
            })
            .collect();
        Ok(PlanAggregate {
            plan,
            events,
            votes: Vec::new(),
        })
    }
}
