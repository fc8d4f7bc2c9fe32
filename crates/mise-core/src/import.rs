//! TOML documents for recipes, plans and ballots.
//!
//! Timestamps are RFC 3339 strings. Enum-valued fields (`storage_type`,
//! `meal_name`) are checked here so a typo names the offending entry;
//! structural checks stay with [`crate::recipe::RecipeWalk`] and
//! [`crate::model::NewPlan::validate`].

use chrono::{DateTime, Utc};
use mise_db::models::{MealName, StorageType};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::ballot::BallotVote;
use crate::model::{NewEvent, NewOption, NewPlan};
use crate::recipe::{NewPrepTask, NewPrepTaskStep, NewRecipe, NewStep, NewStepInput, ProductRef};

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid timestamp {value:?} for {field}: {source}")]
    BadTimestamp {
        field: String,
        value: String,
        source: chrono::ParseError,
    },

    #[error("invalid storage type {value:?} on prep task {task:?}")]
    UnknownStorage { task: String, value: String },

    #[error("invalid meal name {value:?} on event {event}")]
    UnknownMealName { event: usize, value: String },

    #[error("step {step} ingredient {input:?} names a product but no source step")]
    DanglingProduct { step: usize, input: String },

    #[error("ballot has no votes")]
    EmptyBallot,
}

// ---------------------------------------------------------------------------
// Recipes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecipeDocument {
    pub recipe: RecipeMeta,
    #[serde(default)]
    pub steps: Vec<StepToml>,
    #[serde(default)]
    pub prep_tasks: Vec<PrepTaskToml>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecipeMeta {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepToml {
    pub preparation: String,
    #[serde(default)]
    pub notes: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_seconds: Option<u32>,
    #[serde(default)]
    pub products: Vec<String>,
    #[serde(default)]
    pub ingredients: Vec<InputToml>,
    #[serde(default)]
    pub instruments: Vec<InputToml>,
}

/// An ingredient or instrument. `from_step` (0-based) and `from_product`
/// together name another step's product.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InputToml {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_step: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_product: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PrepTaskToml {
    pub name: String,
    #[serde(default)]
    pub notes: String,
    pub storage_type: String,
    #[serde(default)]
    pub storage_instructions: String,
    pub min_buffer_seconds: u32,
    pub max_buffer_seconds: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_storage_temp_c: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_storage_temp_c: Option<f32>,
    #[serde(default)]
    pub steps: Vec<PrepStepToml>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PrepStepToml {
    pub step: usize,
    /// Whether the prep task fully replaces this step at serving time.
    #[serde(default = "default_satisfies")]
    pub satisfies: bool,
}

fn default_satisfies() -> bool {
    true
}

fn convert_input(step: usize, input: &InputToml) -> Result<NewStepInput, ImportError> {
    let from = match (input.from_step, &input.from_product) {
        (Some(step), product) => Some(ProductRef {
            step,
            product: product.clone().unwrap_or_else(|| input.name.clone()),
        }),
        (None, Some(_)) => {
            return Err(ImportError::DanglingProduct {
                step,
                input: input.name.clone(),
            });
        }
        (None, None) => None,
    };
    Ok(NewStepInput {
        name: input.name.clone(),
        from,
    })
}

/// Parse a recipe document into a [`NewRecipe`].
pub fn parse_recipe(content: &str) -> Result<NewRecipe, ImportError> {
    let doc: RecipeDocument = toml::from_str(content)?;
    recipe_from_document(doc)
}

pub fn recipe_from_document(doc: RecipeDocument) -> Result<NewRecipe, ImportError> {
    let mut steps = Vec::with_capacity(doc.steps.len());
    for (i, step) in doc.steps.iter().enumerate() {
        steps.push(NewStep {
            preparation: step.preparation.clone(),
            notes: step.notes.clone(),
            estimated_seconds: step.estimated_seconds,
            products: step.products.clone(),
            ingredients: step
                .ingredients
                .iter()
                .map(|input| convert_input(i, input))
                .collect::<Result<_, _>>()?,
            instruments: step
                .instruments
                .iter()
                .map(|input| convert_input(i, input))
                .collect::<Result<_, _>>()?,
        });
    }

    let mut prep_tasks = Vec::with_capacity(doc.prep_tasks.len());
    for task in doc.prep_tasks {
        let storage_type: StorageType =
            task.storage_type
                .parse()
                .map_err(|_| ImportError::UnknownStorage {
                    task: task.name.clone(),
                    value: task.storage_type.clone(),
                })?;
        prep_tasks.push(NewPrepTask {
            name: task.name,
            notes: task.notes,
            storage_type,
            storage_instructions: task.storage_instructions,
            min_buffer_seconds: task.min_buffer_seconds,
            max_buffer_seconds: task.max_buffer_seconds,
            min_storage_temp_c: task.min_storage_temp_c,
            max_storage_temp_c: task.max_storage_temp_c,
            steps: task
                .steps
                .iter()
                .map(|s| NewPrepTaskStep {
                    step: s.step,
                    satisfies_recipe_step: s.satisfies,
                })
                .collect(),
        });
    }

    Ok(NewRecipe {
        name: doc.recipe.name,
        steps,
        prep_tasks,
    })
}

// ---------------------------------------------------------------------------
// Plans
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanDocument {
    pub plan: PlanMeta,
    #[serde(default)]
    pub events: Vec<EventToml>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanMeta {
    pub household_id: Uuid,
    #[serde(default)]
    pub notes: String,
    pub voting_deadline: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventToml {
    pub meal_name: String,
    #[serde(default)]
    pub notes: String,
    pub starts_at: String,
    pub ends_at: String,
    #[serde(default)]
    pub options: Vec<OptionToml>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OptionToml {
    pub meal_id: Uuid,
    #[serde(default)]
    pub notes: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_cook: Option<Uuid>,
}

pub fn parse_timestamp(field: &str, value: &str) -> Result<DateTime<Utc>, ImportError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|source| ImportError::BadTimestamp {
            field: field.to_owned(),
            value: value.to_owned(),
            source,
        })
}

/// Parse a plan document into a [`NewPlan`].
pub fn parse_plan(content: &str) -> Result<NewPlan, ImportError> {
    let doc: PlanDocument = toml::from_str(content)?;
    plan_from_document(doc)
}

pub fn plan_from_document(doc: PlanDocument) -> Result<NewPlan, ImportError> {
    let voting_deadline = parse_timestamp("plan.voting_deadline", &doc.plan.voting_deadline)?;
    let mut events = Vec::with_capacity(doc.events.len());
    for (i, event) in doc.events.into_iter().enumerate() {
        let meal_name: MealName =
            event
                .meal_name
                .parse()
                .map_err(|_| ImportError::UnknownMealName {
                    event: i,
                    value: event.meal_name.clone(),
                })?;
        events.push(NewEvent {
            meal_name,
            notes: event.notes,
            starts_at: parse_timestamp(&format!("events[{i}].starts_at"), &event.starts_at)?,
            ends_at: parse_timestamp(&format!("events[{i}].ends_at"), &event.ends_at)?,
            options: event
                .options
                .into_iter()
                .map(|o| NewOption {
                    meal_id: o.meal_id,
                    notes: o.notes,
                    assigned_cook: o.assigned_cook,
                })
                .collect(),
        });
    }
    Ok(NewPlan {
        household_id: doc.plan.household_id,
        notes: doc.plan.notes,
        voting_deadline,
        events,
    })
}

// ---------------------------------------------------------------------------
// Ballots
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BallotDocument {
    #[serde(default)]
    pub votes: Vec<BallotVote>,
}

pub fn parse_ballot(content: &str) -> Result<Vec<BallotVote>, ImportError> {
    let doc: BallotDocument = toml::from_str(content)?;
    if doc.votes.is_empty() {
        return Err(ImportError::EmptyBallot);
    }
    Ok(doc.votes)
}
