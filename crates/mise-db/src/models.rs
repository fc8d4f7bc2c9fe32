use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Lifecycle status of a meal plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    AwaitingVotes,
    FinalizationFailed,
    Finalized,
}

impl fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::AwaitingVotes => "awaiting_votes",
            Self::FinalizationFailed => "finalization_failed",
            Self::Finalized => "finalized",
        };
        f.write_str(s)
    }
}

impl FromStr for PlanStatus {
    type Err = PlanStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "awaiting_votes" => Ok(Self::AwaitingVotes),
            "finalization_failed" => Ok(Self::FinalizationFailed),
            "finalized" => Ok(Self::Finalized),
            other => Err(PlanStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`PlanStatus`] string.
#[derive(Debug, Clone)]
pub struct PlanStatusParseError(pub String);

impl fmt::Display for PlanStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid plan status: {:?}", self.0)
    }
}

impl std::error::Error for PlanStatusParseError {}

// ---------------------------------------------------------------------------

/// The meal slot an event fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MealName {
    Breakfast,
    SecondBreakfast,
    Brunch,
    Lunch,
    Supper,
    Dinner,
}

impl fmt::Display for MealName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Breakfast => "breakfast",
            Self::SecondBreakfast => "second_breakfast",
            Self::Brunch => "brunch",
            Self::Lunch => "lunch",
            Self::Supper => "supper",
            Self::Dinner => "dinner",
        };
        f.write_str(s)
    }
}

impl FromStr for MealName {
    type Err = MealNameParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "breakfast" => Ok(Self::Breakfast),
            "second_breakfast" => Ok(Self::SecondBreakfast),
            "brunch" => Ok(Self::Brunch),
            "lunch" => Ok(Self::Lunch),
            "supper" => Ok(Self::Supper),
            "dinner" => Ok(Self::Dinner),
            other => Err(MealNameParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`MealName`] string.
#[derive(Debug, Clone)]
pub struct MealNameParseError(pub String);

impl fmt::Display for MealNameParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid meal name: {:?}", self.0)
    }
}

impl std::error::Error for MealNameParseError {}

// ---------------------------------------------------------------------------

/// How a prep task's output is stored until the meal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum StorageType {
    Uncovered,
    Covered,
    Airtight,
    WireRack,
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Uncovered => "uncovered",
            Self::Covered => "covered",
            Self::Airtight => "airtight",
            Self::WireRack => "wire_rack",
        };
        f.write_str(s)
    }
}

impl FromStr for StorageType {
    type Err = StorageTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uncovered" => Ok(Self::Uncovered),
            "covered" => Ok(Self::Covered),
            "airtight" => Ok(Self::Airtight),
            "wire_rack" => Ok(Self::WireRack),
            other => Err(StorageTypeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`StorageType`] string.
#[derive(Debug, Clone)]
pub struct StorageTypeParseError(pub String);

impl fmt::Display for StorageTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid storage type: {:?}", self.0)
    }
}

impl std::error::Error for StorageTypeParseError {}

// ---------------------------------------------------------------------------

/// Status of a materialized meal plan task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Unfinished,
    Delayed,
    Ignored,
    Finished,
}

impl TaskStatus {
    /// Terminal statuses accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ignored | Self::Finished)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unfinished => "unfinished",
            Self::Delayed => "delayed",
            Self::Ignored => "ignored",
            Self::Finished => "finished",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unfinished" => Ok(Self::Unfinished),
            "delayed" => Ok(Self::Delayed),
            "ignored" => Ok(Self::Ignored),
            "finished" => Ok(Self::Finished),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------

/// Voting method used to pick a winner per event. Only Schulze exists.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ElectionMethod {
    #[default]
    Schulze,
}

impl fmt::Display for ElectionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Schulze => f.write_str("schulze"),
        }
    }
}

/// Discriminant stored alongside a task's origin foreign key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskOriginKind {
    RecipeStep,
    PrepTask,
}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A meal plan: a household's set of events awaiting a vote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct MealPlan {
    pub id: Uuid,
    pub household_id: Uuid,
    pub status: PlanStatus,
    pub notes: String,
    pub election_method: ElectionMethod,
    pub voting_deadline: DateTime<Utc>,
    pub tie_recorded: bool,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub finalized_at: Option<DateTime<Utc>>,
}

/// A (meal-name, time-window) slot within a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct MealPlanEvent {
    pub id: Uuid,
    pub plan_id: Uuid,
    pub meal_name: MealName,
    pub notes: String,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// A candidate meal for one event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct MealPlanOption {
    pub id: Uuid,
    pub event_id: Uuid,
    pub meal_id: Uuid,
    pub notes: String,
    pub assigned_cook: Option<Uuid>,
    pub chosen: bool,
    pub tiebroken: bool,
    pub tasks_created: bool,
    pub created_at: DateTime<Utc>,
}

/// One user's ranking of one option.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct MealPlanOptionVote {
    pub id: Uuid,
    pub option_id: Uuid,
    pub by_user: Uuid,
    pub rank: i32,
    pub abstain: bool,
    pub notes: String,
    pub created_at: DateTime<Utc>,
}

/// A named bundle of recipes that can be offered as an option.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Meal {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Recipe {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// A recipe step, indexed from 0 within its recipe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct RecipeStep {
    pub id: Uuid,
    pub recipe_id: Uuid,
    pub step_index: i32,
    pub preparation: String,
    pub notes: String,
    pub estimated_seconds: Option<i32>,
}

/// An output of a step that later steps may consume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct RecipeStepProduct {
    pub id: Uuid,
    pub step_id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct RecipeStepIngredient {
    pub id: Uuid,
    pub step_id: Uuid,
    pub name: String,
    /// Set when the ingredient is the product of an earlier step.
    pub product_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct RecipeStepInstrument {
    pub id: Uuid,
    pub step_id: Uuid,
    pub name: String,
    pub product_id: Option<Uuid>,
}

/// A sub-procedure of a recipe that can be done ahead of serving time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct RecipePrepTask {
    pub id: Uuid,
    pub recipe_id: Uuid,
    /// Declaration order within the recipe.
    pub position: i32,
    pub name: String,
    pub notes: String,
    pub explicit_storage_instructions: String,
    pub storage_type: StorageType,
    pub min_buffer_seconds: i32,
    pub max_buffer_seconds: i32,
    pub min_storage_temp_c: Option<f32>,
    pub max_storage_temp_c: Option<f32>,
}

/// Links a prep task to a recipe step it covers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct RecipePrepTaskStep {
    pub id: Uuid,
    pub prep_task_id: Uuid,
    pub recipe_step_id: Uuid,
    pub satisfies_recipe_step: bool,
}

/// Where a materialized task came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskOrigin {
    RecipeStep { step_id: Uuid },
    PrepTask { prep_task_id: Uuid },
}

impl TaskOrigin {
    pub fn kind(&self) -> TaskOriginKind {
        match self {
            Self::RecipeStep { .. } => TaskOriginKind::RecipeStep,
            Self::PrepTask { .. } => TaskOriginKind::PrepTask,
        }
    }

    pub fn recipe_step_id(&self) -> Option<Uuid> {
        match self {
            Self::RecipeStep { step_id } => Some(*step_id),
            Self::PrepTask { .. } => None,
        }
    }

    pub fn prep_task_id(&self) -> Option<Uuid> {
        match self {
            Self::PrepTask { prep_task_id } => Some(*prep_task_id),
            Self::RecipeStep { .. } => None,
        }
    }
}

/// A materialized unit of work for a chosen option.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MealPlanTask {
    pub id: Uuid,
    pub option_id: Uuid,
    pub origin: TaskOrigin,
    pub assigned_cook: Option<Uuid>,
    pub cannot_start_before: DateTime<Utc>,
    pub must_finish_by: DateTime<Utc>,
    pub status: TaskStatus,
    pub status_explanation: String,
    pub creation_explanation: String,
    pub storage_type: Option<StorageType>,
    pub storage_instructions: Option<String>,
    pub min_storage_temp_c: Option<f32>,
    pub max_storage_temp_c: Option<f32>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Flat row shape of `meal_plan_tasks`; converted into [`MealPlanTask`].
#[derive(Debug, Clone, FromRow)]
pub struct MealPlanTaskRow {
    pub id: Uuid,
    pub option_id: Uuid,
    pub origin_kind: TaskOriginKind,
    pub recipe_step_id: Option<Uuid>,
    pub recipe_prep_task_id: Option<Uuid>,
    pub assigned_cook: Option<Uuid>,
    pub cannot_start_before: DateTime<Utc>,
    pub must_finish_by: DateTime<Utc>,
    pub status: TaskStatus,
    pub status_explanation: String,
    pub creation_explanation: String,
    pub storage_type: Option<StorageType>,
    pub storage_instructions: Option<String>,
    pub min_storage_temp_c: Option<f32>,
    pub max_storage_temp_c: Option<f32>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Error returned when a task row's origin columns disagree with its kind.
#[derive(Debug, Clone, thiserror::Error)]
#[error("task {task_id} has origin kind {kind:?} but no matching foreign key")]
pub struct TaskOriginError {
    pub task_id: Uuid,
    pub kind: TaskOriginKind,
}

impl TryFrom<MealPlanTaskRow> for MealPlanTask {
    type Error = TaskOriginError;

    fn try_from(row: MealPlanTaskRow) -> Result<Self, Self::Error> {
        let origin = match (row.origin_kind, row.recipe_step_id, row.recipe_prep_task_id) {
            (TaskOriginKind::RecipeStep, Some(step_id), None) => TaskOrigin::RecipeStep { step_id },
            (TaskOriginKind::PrepTask, None, Some(prep_task_id)) => {
                TaskOrigin::PrepTask { prep_task_id }
            }
            (kind, _, _) => {
                return Err(TaskOriginError {
                    task_id: row.id,
                    kind,
                });
            }
        };
        Ok(Self {
            id: row.id,
            option_id: row.option_id,
            origin,
            assigned_cook: row.assigned_cook,
            cannot_start_before: row.cannot_start_before,
            must_finish_by: row.must_finish_by,
            status: row.status,
            status_explanation: row.status_explanation,
            creation_explanation: row.creation_explanation,
            storage_type: row.storage_type,
            storage_instructions: row.storage_instructions,
            min_storage_temp_c: row.min_storage_temp_c,
            max_storage_temp_c: row.max_storage_temp_c,
            created_at: row.created_at,
            completed_at: row.completed_at,
        })
    }
}

/// A per-plan worker lease plus its retry backoff state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct PlanLease {
    pub plan_id: Uuid,
    pub holder: Option<Uuid>,
    pub expires_at: Option<DateTime<Utc>>,
    pub attempts: i32,
    pub next_eligible_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
