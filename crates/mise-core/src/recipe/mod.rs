//! Recipe step graphs.
//!
//! A [`RecipeGraph`] is everything stored about one recipe: its steps, the
//! products those steps emit, the ingredients and instruments that consume
//! them, and its prep tasks. [`RecipeWalk`] validates a graph and orders its
//! steps; [`NewRecipe`] builds a graph from authored input.

mod builder;
mod walk;

pub use builder::{NewPrepTask, NewPrepTaskStep, NewRecipe, NewStep, NewStepInput, ProductRef};
pub use walk::RecipeWalk;

use mise_db::models::{
    Recipe, RecipePrepTask, RecipePrepTaskStep, RecipeStep, RecipeStepIngredient,
    RecipeStepInstrument, RecipeStepProduct,
};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct RecipeGraph {
    pub recipe: Recipe,
    pub steps: Vec<RecipeStep>,
    pub products: Vec<RecipeStepProduct>,
    pub ingredients: Vec<RecipeStepIngredient>,
    pub instruments: Vec<RecipeStepInstrument>,
    pub prep_tasks: Vec<PrepTaskWithSteps>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PrepTaskWithSteps {
    pub task: RecipePrepTask,
    pub steps: Vec<RecipePrepTaskStep>,
}

impl RecipeGraph {
    /// Reassemble a graph from flat rows, attaching prep task links to
    /// their tasks.
    pub fn from_rows(
        recipe: Recipe,
        steps: Vec<RecipeStep>,
        products: Vec<RecipeStepProduct>,
        ingredients: Vec<RecipeStepIngredient>,
        instruments: Vec<RecipeStepInstrument>,
        prep_tasks: Vec<RecipePrepTask>,
        prep_task_steps: Vec<RecipePrepTaskStep>,
    ) -> Self {
        let prep_tasks = prep_tasks
            .into_iter()
            .map(|task| {
                let steps = prep_task_steps
                    .iter()
                    .filter(|link| link.prep_task_id == task.id)
                    .cloned()
                    .collect();
                PrepTaskWithSteps { task, steps }
            })
            .collect();
        Self {
            recipe,
            steps,
            products,
            ingredients,
            instruments,
            prep_tasks,
        }
    }
}

/// Ways a recipe's stored graph can be unusable for scheduling.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RecipeGraphError {
    #[error("recipe has no steps")]
    NoSteps,

    #[error("step index {0} appears more than once")]
    DuplicateStepIndex(i32),

    #[error("step {step_index} references unknown product {product_id}")]
    DanglingProduct { step_index: i32, product_id: Uuid },

    #[error("step {step_index} consumes its own product {product:?}")]
    SelfReference { step_index: i32, product: String },

    #[error("product references form a cycle through steps {step_indices:?}")]
    Cycle { step_indices: Vec<i32> },

    #[error("step {step_index} refers to product {product:?}, which that step does not produce")]
    UnknownProduct { step_index: usize, product: String },

    #[error("prep task {name:?} covers no steps")]
    PrepTaskWithoutSteps { name: String },

    #[error("prep task {name:?} covers step {step} that is not part of the recipe")]
    UnknownPrepTaskStep { name: String, step: String },

    #[error("prep task {name:?} has buffer window {min}s..{max}s (min must not exceed max)")]
    BufferRange { name: String, min: i32, max: i32 },

    #[error("prep task {name:?} cannot finish before the steps that consume its work")]
    PrepWindowUnfit { name: String },

    #[error("prep task {name:?} has storage temperature {min}..{max} C (min must not exceed max)")]
    TemperatureRange { name: String, min: f32, max: f32 },
}
