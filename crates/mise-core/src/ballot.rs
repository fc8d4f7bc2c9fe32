//! Ballot validation and the replay rules shared by every repository.
//!
//! A ballot is one user's votes over one or more events of a plan. It must
//! cover every option of each event it touches and is written atomically.
//! Resubmitting an identical ballot is a no-op; anything else that touches
//! an already-voted option is a duplicate.

use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Utc};
use mise_db::models::{MealName, MealPlan, MealPlanOptionVote, PlanStatus};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::model::PlanAggregate;

/// One entry of a submitted ballot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BallotVote {
    pub option_id: Uuid,
    #[serde(default)]
    pub rank: u32,
    #[serde(default)]
    pub abstain: bool,
    #[serde(default)]
    pub notes: String,
}

/// Who is voting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Voter {
    pub user_id: Uuid,
    pub household_id: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BallotOutcome {
    Recorded { votes: usize },
    /// An identical ballot was already stored.
    Replayed,
}

/// A validated ballot ready for the repository.
#[derive(Debug, Clone, PartialEq)]
pub struct BallotWrite {
    pub plan_id: Uuid,
    pub household_id: Uuid,
    pub user_id: Uuid,
    pub votes: Vec<MealPlanOptionVote>,
}

impl BallotWrite {
    pub fn new(
        plan_id: Uuid,
        voter: &Voter,
        votes: &[BallotVote],
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let votes = votes
            .iter()
            .map(|v| {
                let rank = i32::try_from(v.rank).map_err(|_| EngineError::RankOutOfRange {
                    option_id: v.option_id,
                    rank: v.rank,
                })?;
                Ok(MealPlanOptionVote {
                    id: Uuid::new_v4(),
                    option_id: v.option_id,
                    by_user: voter.user_id,
                    rank,
                    abstain: v.abstain,
                    notes: v.notes.clone(),
                    created_at: now,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            plan_id,
            household_id: voter.household_id,
            user_id: voter.user_id,
            votes,
        })
    }

    pub fn option_ids(&self) -> Vec<Uuid> {
        self.votes.iter().map(|v| v.option_id).collect()
    }

    /// Decide what to do given the user's stored votes on this ballot's
    /// options: `None` means insert, `Some(Replayed)` means the same ballot
    /// is already stored.
    pub fn reconcile(&self, existing: &[MealPlanOptionVote]) -> Result<Option<BallotOutcome>> {
        let Some(first) = existing.first() else {
            return Ok(None);
        };
        let stored: HashMap<Uuid, &MealPlanOptionVote> =
            existing.iter().map(|v| (v.option_id, v)).collect();
        let identical = stored.len() == self.votes.len()
            && self.votes.iter().all(|v| {
                stored.get(&v.option_id).is_some_and(|s| {
                    s.by_user == v.by_user
                        && s.rank == v.rank
                        && s.abstain == v.abstain
                        && s.notes == v.notes
                })
            });
        if identical {
            return Ok(Some(BallotOutcome::Replayed));
        }
        Err(EngineError::DuplicateBallot {
            user_id: self.user_id,
            option_id: first.option_id,
        })
    }
}

/// Reject ballots for plans no longer accepting votes. Runs at commit time.
pub fn check_open(plan: &MealPlan, now: DateTime<Utc>) -> Result<()> {
    if plan.status != PlanStatus::AwaitingVotes || now >= plan.voting_deadline {
        return Err(EngineError::DeadlinePassed {
            plan_id: plan.id,
            deadline: plan.voting_deadline,
        });
    }
    Ok(())
}

/// Validate a ballot against the plan: voter's household, known options,
/// no repeated option, and full coverage of each touched event.
pub fn validate(plan: &PlanAggregate, voter: &Voter, votes: &[BallotVote]) -> Result<()> {
    if voter.household_id != plan.plan.household_id {
        return Err(EngineError::NotAuthorized {
            user_id: voter.user_id,
            plan_id: plan.id(),
        });
    }
    if votes.is_empty() {
        return Err(EngineError::IncompleteBallot {
            event_id: None,
            missing: Vec::new(),
        });
    }

    let mut seen = HashSet::new();
    let mut touched = BTreeSet::new();
    for vote in votes {
        let option = plan.option(vote.option_id).ok_or(EngineError::NotFound {
            entity: "meal plan option",
            id: vote.option_id,
        })?;
        if !seen.insert(vote.option_id) {
            return Err(EngineError::DuplicateBallot {
                user_id: voter.user_id,
                option_id: vote.option_id,
            });
        }
        touched.insert(option.event_id);
    }

    for event_id in touched {
        let Some(event) = plan.event(event_id) else {
            continue;
        };
        let missing: Vec<Uuid> = event
            .options
            .iter()
            .map(|o| o.id)
            .filter(|id| !seen.contains(id))
            .collect();
        if !missing.is_empty() {
            return Err(EngineError::IncompleteBallot {
                event_id: Some(event_id),
                missing,
            });
        }
    }
    Ok(())
}

/// Household members who have not voted on an event yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventMissingVoters {
    pub event_id: Uuid,
    pub meal_name: MealName,
    pub starts_at: DateTime<Utc>,
    pub missing: Vec<Uuid>,
}

pub fn missing_voters(plan: &PlanAggregate, members: &[Uuid]) -> Vec<EventMissingVoters> {
    plan.events
        .iter()
        .map(|e| {
            let voted = plan.voters_for_event(e.event.id);
            let mut missing: Vec<Uuid> = members
                .iter()
                .copied()
                .filter(|m| !voted.contains(m))
                .collect();
            missing.sort();
            missing.dedup();
            EventMissingVoters {
                event_id: e.event.id,
                meal_name: e.event.meal_name,
                starts_at: e.event.starts_at,
                missing,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NewEvent, NewOption, NewPlan};
    use chrono::Duration;

    fn two_event_plan(household_id: Uuid) -> PlanAggregate {
        let start = DateTime::parse_from_rfc3339("2025-01-10T18:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let option = || NewOption {
            meal_id: Uuid::new_v4(),
            notes: String::new(),
            assigned_cook: None,
        };
        NewPlan {
            household_id,
            notes: String::new(),
            voting_deadline: start - Duration::days(1),
            events: vec![
                NewEvent {
                    meal_name: MealName::Dinner,
                    notes: String::new(),
                    starts_at: start,
                    ends_at: start + Duration::hours(2),
                    options: vec![option(), option()],
                },
                NewEvent {
                    meal_name: MealName::Breakfast,
                    notes: String::new(),
                    starts_at: start + Duration::hours(14),
                    ends_at: start + Duration::hours(15),
                    options: vec![option()],
                },
            ],
        }
        .into_aggregate(start - Duration::days(2))
        .unwrap()
    }

    fn vote(option_id: Uuid, rank: u32) -> BallotVote {
        BallotVote {
            option_id,
            rank,
            abstain: false,
            notes: String::new(),
        }
    }

    #[test]
    fn full_event_coverage_is_valid() {
        let household = Uuid::new_v4();
        let plan = two_event_plan(household);
        let voter = Voter { user_id: Uuid::new_v4(), household_id: household };
        let dinner = &plan.events[0].options;
        let votes = vec![vote(dinner[0].id, 0), vote(dinner[1].id, 1)];
        assert!(validate(&plan, &voter, &votes).is_ok());
    }

    #[test]
    fn partial_event_coverage_is_incomplete() {
        let household = Uuid::new_v4();
        let plan = two_event_plan(household);
        let voter = Voter { user_id: Uuid::new_v4(), household_id: household };
        let dinner = &plan.events[0].options;
        let err = validate(&plan, &voter, &[vote(dinner[0].id, 0)]).unwrap_err();
        match err {
            EngineError::IncompleteBallot { event_id, missing } => {
                assert_eq!(event_id, Some(plan.events[0].event.id));
                assert_eq!(missing, vec![dinner[1].id]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn other_household_is_not_authorized() {
        let plan = two_event_plan(Uuid::new_v4());
        let voter = Voter { user_id: Uuid::new_v4(), household_id: Uuid::new_v4() };
        let only = plan.events[1].options[0].id;
        assert!(matches!(
            validate(&plan, &voter, &[vote(only, 0)]),
            Err(EngineError::NotAuthorized { .. })
        ));
    }

    #[test]
    fn repeated_option_and_unknown_option_are_rejected() {
        let household = Uuid::new_v4();
        let plan = two_event_plan(household);
        let voter = Voter { user_id: Uuid::new_v4(), household_id: household };
        let only = plan.events[1].options[0].id;
        assert!(matches!(
            validate(&plan, &voter, &[vote(only, 0), vote(only, 1)]),
            Err(EngineError::DuplicateBallot { .. })
        ));
        assert!(matches!(
            validate(&plan, &voter, &[vote(Uuid::new_v4(), 0)]),
            Err(EngineError::NotFound { .. })
        ));
        assert!(matches!(
            validate(&plan, &voter, &[]),
            Err(EngineError::IncompleteBallot { event_id: None, .. })
        ));
    }

    #[test]
    fn reconcile_distinguishes_replay_from_duplicate() {
        let household = Uuid::new_v4();
        let plan = two_event_plan(household);
        let voter = Voter { user_id: Uuid::new_v4(), household_id: household };
        let only = plan.events[1].options[0].id;
        let now = Utc::now();

        let first = BallotWrite::new(plan.id(), &voter, &[vote(only, 0)], now).unwrap();
        assert_eq!(first.reconcile(&[]).unwrap(), None);

        let same = BallotWrite::new(plan.id(), &voter, &[vote(only, 0)], now).unwrap();
        assert_eq!(same.reconcile(&first.votes).unwrap(), Some(BallotOutcome::Replayed));

        let changed = BallotWrite::new(plan.id(), &voter, &[vote(only, 3)], now).unwrap();
        assert!(matches!(
            changed.reconcile(&first.votes),
            Err(EngineError::DuplicateBallot { option_id, .. }) if option_id == only
        ));
    }

    #[test]
    fn rank_beyond_storage_range_is_rejected() {
        let household = Uuid::new_v4();
        let plan = two_event_plan(household);
        let voter = Voter { user_id: Uuid::new_v4(), household_id: household };
        let only = plan.events[1].options[0].id;
        let err = BallotWrite::new(plan.id(), &voter, &[vote(only, u32::MAX)], Utc::now()).unwrap_err();
        assert!(matches!(
            err,
            EngineError::RankOutOfRange { option_id, rank: u32::MAX } if option_id == only
        ));
    }

    #[test]
    fn check_open_fences_the_deadline() {
        let plan = two_event_plan(Uuid::new_v4());
        let deadline = plan.plan.voting_deadline;
        assert!(check_open(&plan.plan, deadline - Duration::seconds(1)).is_ok());
        assert!(matches!(
            check_open(&plan.plan, deadline),
            Err(EngineError::DeadlinePassed { .. })
        ));
    }

    #[test]
    fn missing_voters_lists_members_without_ballots() {
        let household = Uuid::new_v4();
        let mut plan = two_event_plan(household);
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let voter = Voter { user_id: alice, household_id: household };
        let only = plan.events[1].options[0].id;
        plan.votes = BallotWrite::new(plan.id(), &voter, &[vote(only, 0)], Utc::now()).unwrap().votes;

        let report = missing_voters(&plan, &[alice, bob]);
        assert_eq!(report.len(), 2);
        let mut everyone = vec![alice, bob];
        everyone.sort();
        assert_eq!(report[0].missing, everyone);
        assert_eq!(report[1].missing, vec![bob]);
    }
}
