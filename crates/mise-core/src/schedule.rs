//! Prep-task scheduling.
//!
//! Turns a chosen option's walked recipes into concrete task windows
//! anchored to the event's serving time. Prep tasks are placed by their
//! buffer window; steps not replaced by a prep task run at serving time and
//! are spread backward using their estimated durations so that each step
//! finishes before anything that consumes its product starts.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use mise_db::models::{
    MealPlanOption, MealPlanTask, RecipePrepTask, StorageType, TaskOrigin, TaskStatus,
};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::recipe::{RecipeGraphError, RecipeWalk};

/// A scheduled task before it is bound to an option.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledTask {
    pub origin: TaskOrigin,
    pub cannot_start_before: DateTime<Utc>,
    pub must_finish_by: DateTime<Utc>,
    pub creation_explanation: String,
    pub storage: Option<StorageAttributes>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StorageAttributes {
    pub storage_type: StorageType,
    pub instructions: String,
    pub min_temp_c: Option<f32>,
    pub max_temp_c: Option<f32>,
}

/// Default wording for a storage type when the recipe gives none.
pub fn default_storage_instructions(storage_type: StorageType) -> &'static str {
    match storage_type {
        StorageType::Uncovered => "store uncovered",
        StorageType::Covered => "store covered",
        StorageType::Airtight => "store in an airtight container",
        StorageType::WireRack => "store on a wire rack",
    }
}

fn storage_for(task: &RecipePrepTask) -> StorageAttributes {
    let instructions = if task.explicit_storage_instructions.trim().is_empty() {
        default_storage_instructions(task.storage_type).to_owned()
    } else {
        task.explicit_storage_instructions.clone()
    };
    StorageAttributes {
        storage_type: task.storage_type,
        instructions,
        min_temp_c: task.min_storage_temp_c,
        max_temp_c: task.max_storage_temp_c,
    }
}

/// Schedule one recipe against `serve_at`.
///
/// Prep tasks come first in declared order, then serving-time steps in
/// walk order. Every window satisfies
/// `cannot_start_before <= must_finish_by <= serve_at`.
///
/// A prep task starts no earlier than its max buffer allows, and any step
/// feeding a step it replaces must finish by then. It must finish before
/// the first step outside it that consumes the work it replaces; when that
/// leaves no room the recipe is unschedulable.
pub fn schedule_recipe(
    walk: &RecipeWalk,
    serve_at: DateTime<Utc>,
) -> Result<Vec<ScheduledTask>, RecipeGraphError> {
    let recipe_name = &walk.recipe().name;

    let prep_starts: HashMap<Uuid, DateTime<Utc>> = walk
        .prep_tasks()
        .iter()
        .map(|p| (p.task.id, serve_at - seconds(p.task.max_buffer_seconds)))
        .collect();

    // Backward pass in reverse walk order. A replaced step starts when its
    // prep task does.
    let mut starts: HashMap<Uuid, DateTime<Utc>> = HashMap::new();
    let mut windows = Vec::new();
    for step in walk.steps().iter().rev() {
        if let Some(start) = walk.satisfied_by(step.id).and_then(|p| prep_starts.get(&p)) {
            starts.insert(step.id, *start);
            continue;
        }
        let finish = walk
            .successors(step.id)
            .iter()
            .filter_map(|next| starts.get(next))
            .copied()
            .fold(serve_at, DateTime::min);
        let start = finish - seconds(step.estimated_seconds.unwrap_or(0));
        starts.insert(step.id, start);
        windows.push((step, start, finish));
    }

    let mut out = Vec::new();
    for prep in walk.prep_tasks() {
        let task = &prep.task;
        let start = serve_at - seconds(task.max_buffer_seconds);
        let finish = prep
            .steps
            .iter()
            .filter(|link| walk.satisfied_by(link.recipe_step_id) == Some(task.id))
            .flat_map(|link| walk.successors(link.recipe_step_id))
            .filter(|next| walk.satisfied_by(**next) != Some(task.id))
            .filter_map(|next| starts.get(next))
            .copied()
            .fold(serve_at - seconds(task.min_buffer_seconds), DateTime::min);
        if finish < start {
            return Err(RecipeGraphError::PrepWindowUnfit {
                name: task.name.clone(),
            });
        }
        out.push(ScheduledTask {
            origin: TaskOrigin::PrepTask {
                prep_task_id: task.id,
            },
            cannot_start_before: start,
            must_finish_by: finish,
            creation_explanation: format!("prep task {:?} for recipe {:?}", task.name, recipe_name),
            storage: Some(storage_for(task)),
        });
    }

    for (step, start, finish) in windows.into_iter().rev() {
        out.push(ScheduledTask {
            origin: TaskOrigin::RecipeStep { step_id: step.id },
            cannot_start_before: start,
            must_finish_by: finish,
            creation_explanation: format!(
                "step {} of recipe {:?}: {}",
                step.step_index + 1,
                recipe_name,
                step.preparation
            ),
            storage: None,
        });
    }

    Ok(out)
}

fn seconds(value: i32) -> Duration {
    Duration::seconds(i64::from(value.max(0)))
}

/// Schedule every recipe of a chosen option and bind the results to it.
pub fn schedule_option(
    option: &MealPlanOption,
    serve_at: DateTime<Utc>,
    walks: &[RecipeWalk],
    now: DateTime<Utc>,
) -> Result<Vec<MealPlanTask>> {
    let mut scheduled = Vec::new();
    for walk in walks {
        let tasks = schedule_recipe(walk, serve_at).map_err(|source| {
            EngineError::RecipeGraphInvalid {
                recipe_id: walk.recipe().id,
                source,
            }
        })?;
        scheduled.extend(tasks);
    }

    Ok(scheduled
        .into_iter()
        .map(|t| {
            let storage = t.storage;
            MealPlanTask {
                id: Uuid::new_v4(),
                option_id: option.id,
                origin: t.origin,
                assigned_cook: option.assigned_cook,
                cannot_start_before: t.cannot_start_before,
                must_finish_by: t.must_finish_by,
                status: TaskStatus::Unfinished,
                status_explanation: String::new(),
                creation_explanation: t.creation_explanation,
                storage_type: storage.as_ref().map(|s| s.storage_type),
                storage_instructions: storage.as_ref().map(|s| s.instructions.clone()),
                min_storage_temp_c: storage.as_ref().and_then(|s| s.min_temp_c),
                max_storage_temp_c: storage.as_ref().and_then(|s| s.max_temp_c),
                created_at: now,
                completed_at: None,
            }
        })
        .collect())
}
