//! Operator-mode CLI handlers for `mise plan` and `mise ballot` subcommands.
//!
//! Implements:
//! - `mise plan create <file>`              -- create a meal plan from a TOML file
//! - `mise plan show <plan-id>`             -- events, options and vote counts
//! - `mise plan finalize <plan-id>`         -- tally and choose winners now
//! - `mise plan materialize <plan-id>`      -- create prep tasks for winners
//! - `mise plan replay <plan-id>`           -- reopen voting after a failure
//! - `mise plan missing-voters <plan-id>`   -- who still has to vote
//! - `mise ballot submit <plan-id> <file>`  -- record one user's ballot

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use mise_core::ballot::{BallotOutcome, Voter};
use mise_core::finalize::{FailureReason, FinalizeOutcome};
use mise_core::import;
use mise_core::Engine;

use crate::{BallotCommands, PlanCommands};

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M UTC";

// -----------------------------------------------------------------------
// Public entry points
// -----------------------------------------------------------------------

/// Dispatch a `PlanCommands` variant to the appropriate handler.
pub async fn run_plan_command(command: PlanCommands, engine: &Engine) -> Result<()> {
    match command {
        PlanCommands::Create { file } => cmd_create(engine, &file).await,
        PlanCommands::Show { plan_id, user } => cmd_show(engine, &plan_id, user.as_deref()).await,
        PlanCommands::Finalize { plan_id } => cmd_finalize(engine, &plan_id).await,
        PlanCommands::Materialize { plan_id } => cmd_materialize(engine, &plan_id).await,
        PlanCommands::Replay { plan_id, deadline } => cmd_replay(engine, &plan_id, &deadline).await,
        PlanCommands::MissingVoters { plan_id, members } => {
            cmd_missing_voters(engine, &plan_id, &members).await
        }
    }
}

pub async fn run_ballot_command(command: BallotCommands, engine: &Engine) -> Result<()> {
    match command {
        BallotCommands::Submit {
            plan_id,
            user,
            household,
            file,
        } => cmd_submit_ballot(engine, &plan_id, &user, &household, &file).await,
    }
}

/// Parse a UUID argument, naming what it identifies on failure.
pub fn parse_id(what: &str, value: &str) -> Result<Uuid> {
    value
        .parse()
        .with_context(|| format!("invalid {what} ID: {value:?}"))
}

pub fn read_file(what: &str, path: &str) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("failed to read {what} file: {path}"))
}

// -----------------------------------------------------------------------
// mise plan create <file>
// -----------------------------------------------------------------------

async fn cmd_create(engine: &Engine, file_path: &str) -> Result<()> {
    let content = read_file("plan", file_path)?;
    let new_plan = import::parse_plan(&content)
        .with_context(|| format!("failed to parse plan file: {file_path}"))?;

    let plan = engine.create_plan(new_plan).await?;

    println!("Meal plan created successfully.");
    println!();
    println!("  Plan ID:          {}", plan.plan.id);
    println!("  Household:        {}", plan.plan.household_id);
    println!("  Status:           {}", plan.plan.status);
    println!(
        "  Voting deadline:  {}",
        plan.plan.voting_deadline.format(TIME_FORMAT)
    );
    println!("  Events:           {}", plan.events.len());
    println!("  Options:          {}", plan.options().count());

    Ok(())
}

// -----------------------------------------------------------------------
// mise plan show <plan-id> [--user <id>]
// -----------------------------------------------------------------------

async fn cmd_show(engine: &Engine, plan_id_str: &str, user: Option<&str>) -> Result<()> {
    let plan_id = parse_id("plan", plan_id_str)?;
    let viewer = user.map(|u| parse_id("user", u)).transpose()?;

    let view = engine.get_plan(plan_id, viewer).await?;
    let plan = &view.plan;

    println!("Meal plan: {}", plan.id);
    println!("  Household:        {}", plan.household_id);
    println!("  Status:           {}", plan.status);
    println!("  Method:           {}", plan.election_method);
    println!(
        "  Voting deadline:  {}",
        plan.voting_deadline.format(TIME_FORMAT)
    );
    if let Some(finalized) = plan.finalized_at {
        println!("  Finalized:        {}", finalized.format(TIME_FORMAT));
    }
    if plan.tie_recorded {
        println!("  Tie broken:       yes");
    }
    if !plan.notes.is_empty() {
        println!("  Notes:            {}", plan.notes);
    }

    for event in &view.events {
        println!();
        println!(
            "  [{}] {} - {}  ({} voter(s))",
            event.event.meal_name,
            event.event.starts_at.format(TIME_FORMAT),
            event.event.ends_at.format("%H:%M"),
            event.voters,
        );
        for option in &event.options {
            let marker = if option.chosen { "*" } else { " " };
            let mut flags = Vec::new();
            if option.tiebroken {
                flags.push("tiebroken");
            }
            if option.tasks_created {
                flags.push("tasks created");
            }
            let flags = if flags.is_empty() {
                String::new()
            } else {
                format!(" ({})", flags.join(", "))
            };
            println!("    {marker} {}  meal {}{flags}", option.id, option.meal_id);
            if let Some(cook) = option.assigned_cook {
                println!("        cook: {cook}");
            }
        }
    }

    if viewer.is_some() {
        println!();
        if view.my_votes.is_empty() {
            println!("You have not voted on this plan.");
        } else {
            println!("Your votes:");
            let mut votes = view.my_votes.clone();
            votes.sort_by_key(|v| (v.option_id, v.rank));
            for vote in &votes {
                if vote.abstain {
                    println!("  {}  abstain", vote.option_id);
                } else {
                    println!("  {}  rank {}", vote.option_id, vote.rank);
                }
            }
        }
    }

    Ok(())
}

// -----------------------------------------------------------------------
// mise plan finalize <plan-id>
// -----------------------------------------------------------------------

async fn cmd_finalize(engine: &Engine, plan_id_str: &str) -> Result<()> {
    let plan_id = parse_id("plan", plan_id_str)?;

    match engine.finalize_plan(plan_id).await? {
        FinalizeOutcome::Finalized { tie, winners } => {
            println!("Meal plan {plan_id} finalized.");
            for winner in &winners {
                let note = if winner.tie { " (tie broken)" } else { "" };
                println!("  event {} -> option {}{note}", winner.event_id, winner.option_id);
            }
            if tie {
                println!();
                println!("At least one event was decided by the tie-break rule.");
            }
        }
        FinalizeOutcome::Failed(reason) => {
            println!("Meal plan {plan_id} could not be finalized.");
            match reason {
                FailureReason::NoQuorum { events } => {
                    println!("  No ballots were cast for:");
                    for event in &events {
                        println!("    - event {event}");
                    }
                }
                FailureReason::InvalidRecipe { recipe_id, error } => {
                    println!("  Recipe {recipe_id} cannot be scheduled: {error}");
                }
            }
            println!();
            println!("To reopen voting: mise plan replay {plan_id} --deadline <rfc3339>");
            anyhow::bail!("meal plan {plan_id} finalization failed");
        }
    }

    Ok(())
}

// -----------------------------------------------------------------------
// mise plan materialize <plan-id>
// -----------------------------------------------------------------------

async fn cmd_materialize(engine: &Engine, plan_id_str: &str) -> Result<()> {
    let plan_id = parse_id("plan", plan_id_str)?;

    let report = engine.materialize_tasks(plan_id).await?;

    if report.materialized.is_empty() {
        println!(
            "Nothing to materialize; {} option(s) already have tasks.",
            report.already_materialized
        );
        return Ok(());
    }

    println!("Created {} task(s):", report.task_count());
    for option in &report.materialized {
        println!("  option {}: {} task(s)", option.option_id, option.tasks);
    }
    if report.already_materialized > 0 {
        println!("  ({} option(s) were already materialized)", report.already_materialized);
    }

    Ok(())
}

// -----------------------------------------------------------------------
// mise plan replay <plan-id> --deadline <rfc3339>
// -----------------------------------------------------------------------

pub fn parse_deadline(value: &str) -> Result<DateTime<Utc>> {
    Ok(import::parse_timestamp("deadline", value)?)
}

async fn cmd_replay(engine: &Engine, plan_id_str: &str, deadline: &str) -> Result<()> {
    let plan_id = parse_id("plan", plan_id_str)?;
    let deadline = parse_deadline(deadline)?;

    let plan = engine.replay_plan(plan_id, deadline).await?;

    println!("Meal plan {} reopened for voting.", plan.id);
    println!("  Status:           {}", plan.status);
    println!(
        "  Voting deadline:  {}",
        plan.voting_deadline.format(TIME_FORMAT)
    );

    Ok(())
}

// -----------------------------------------------------------------------
// mise plan missing-voters <plan-id> --member <id>...
// -----------------------------------------------------------------------

async fn cmd_missing_voters(engine: &Engine, plan_id_str: &str, members: &[String]) -> Result<()> {
    let plan_id = parse_id("plan", plan_id_str)?;
    let members = members
        .iter()
        .map(|m| parse_id("member", m))
        .collect::<Result<Vec<_>>>()?;

    let events = engine.missing_voters(plan_id, &members).await?;

    if events.iter().all(|e| e.missing.is_empty()) {
        println!("Everyone has voted.");
        return Ok(());
    }

    for event in events.iter().filter(|e| !e.missing.is_empty()) {
        println!(
            "[{}] {} ({})",
            event.meal_name,
            event.starts_at.format(TIME_FORMAT),
            event.event_id
        );
        for user in &event.missing {
            println!("  - {user}");
        }
    }

    Ok(())
}

// -----------------------------------------------------------------------
// mise ballot submit <plan-id> --user <id> --household <id> <file>
// -----------------------------------------------------------------------

async fn cmd_submit_ballot(
    engine: &Engine,
    plan_id_str: &str,
    user: &str,
    household: &str,
    file_path: &str,
) -> Result<()> {
    let plan_id = parse_id("plan", plan_id_str)?;
    let voter = Voter {
        user_id: parse_id("user", user)?,
        household_id: parse_id("household", household)?,
    };
    let content = read_file("ballot", file_path)?;
    let votes = import::parse_ballot(&content)
        .with_context(|| format!("failed to parse ballot file: {file_path}"))?;

    match engine.submit_ballot(plan_id, voter, &votes).await? {
        BallotOutcome::Recorded { votes } => println!("Ballot recorded ({votes} vote(s))."),
        BallotOutcome::Replayed => println!("Ballot already recorded; nothing changed."),
    }

    Ok(())
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_id_accepts_uuid() {
        let id = "550e8400-e29b-41d4-a716-446655440000";
        assert_eq!(parse_id("plan", id).unwrap().to_string(), id);
    }

    #[test]
    fn parse_id_names_the_argument() {
        let err = parse_id("household", "not-a-uuid").unwrap_err();
        assert!(err.to_string().contains("household"), "unexpected error: {err}");
    }

    #[test]
    fn parse_deadline_normalizes_offset() {
        let deadline = parse_deadline("2025-01-08T13:00:00+01:00").unwrap();
        assert_eq!(deadline.to_rfc3339(), "2025-01-08T12:00:00+00:00");
        assert!(parse_deadline("tomorrow").is_err());
    }

    #[test]
    fn read_file_reports_path() {
        let err = read_file("ballot", "/nonexistent/ballot.toml").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/ballot.toml"));
    }
}
