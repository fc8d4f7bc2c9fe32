use std::collections::HashMap;

use chrono::{DateTime, Utc};
use mise_db::models::{
    Recipe, RecipePrepTask, RecipePrepTaskStep, RecipeStep, RecipeStepIngredient,
    RecipeStepInstrument, RecipeStepProduct, StorageType,
};
use uuid::Uuid;

use super::{PrepTaskWithSteps, RecipeGraph, RecipeGraphError};

/// An authored recipe whose cross references are positional: products are
/// named per step and consumers point at them by step position.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewRecipe {
    pub name: String,
    pub steps: Vec<NewStep>,
    pub prep_tasks: Vec<NewPrepTask>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewStep {
    pub preparation: String,
    pub notes: String,
    pub estimated_seconds: Option<u32>,
    pub products: Vec<String>,
    pub ingredients: Vec<NewStepInput>,
    pub instruments: Vec<NewStepInput>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewStepInput {
    pub name: String,
    /// Set when this input is the product of another step.
    pub from: Option<ProductRef>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProductRef {
    pub step: usize,
    pub product: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewPrepTask {
    pub name: String,
    pub notes: String,
    pub storage_type: StorageType,
    pub storage_instructions: String,
    pub min_buffer_seconds: u32,
    pub max_buffer_seconds: u32,
    pub min_storage_temp_c: Option<f32>,
    pub max_storage_temp_c: Option<f32>,
    pub steps: Vec<NewPrepTaskStep>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NewPrepTaskStep {
    pub step: usize,
    pub satisfies_recipe_step: bool,
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn to_index(value: usize) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

impl NewRecipe {
    /// Assign ids and resolve positional references into a [`RecipeGraph`].
    ///
    /// Only reference resolution is checked here; structural validation
    /// (cycles, buffer windows) is [`super::RecipeWalk::new`]'s job.
    pub fn into_graph(self, now: DateTime<Utc>) -> Result<RecipeGraph, RecipeGraphError> {
        self.into_graph_with_id(Uuid::new_v4(), now)
    }

    /// Like [`Self::into_graph`] with a caller-chosen recipe id.
    pub fn into_graph_with_id(
        self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<RecipeGraph, RecipeGraphError> {
        let recipe = Recipe {
            id,
            name: self.name,
            created_at: now,
        };

        let steps: Vec<RecipeStep> = self
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| RecipeStep {
                id: Uuid::new_v4(),
                recipe_id: recipe.id,
                step_index: to_index(i),
                preparation: s.preparation.clone(),
                notes: s.notes.clone(),
                estimated_seconds: s.estimated_seconds.map(to_i32),
            })
            .collect();

        let mut products = Vec::new();
        let mut product_ids: HashMap<(usize, &str), Uuid> = HashMap::new();
        for (i, s) in self.steps.iter().enumerate() {
            for name in &s.products {
                let product = RecipeStepProduct {
                    id: Uuid::new_v4(),
                    step_id: steps[i].id,
                    name: name.clone(),
                };
                product_ids.insert((i, name.as_str()), product.id);
                products.push(product);
            }
        }

        let resolve = |input: &NewStepInput| -> Result<Option<Uuid>, RecipeGraphError> {
            let Some(from) = &input.from else {
                return Ok(None);
            };
            product_ids
                .get(&(from.step, from.product.as_str()))
                .copied()
                .map(Some)
                .ok_or_else(|| RecipeGraphError::UnknownProduct {
                    step_index: from.step,
                    product: from.product.clone(),
                })
        };

        let mut ingredients = Vec::new();
        let mut instruments = Vec::new();
        for (i, s) in self.steps.iter().enumerate() {
            for input in &s.ingredients {
                ingredients.push(RecipeStepIngredient {
                    id: Uuid::new_v4(),
                    step_id: steps[i].id,
                    name: input.name.clone(),
                    product_id: resolve(input)?,
                });
            }
            for input in &s.instruments {
                instruments.push(RecipeStepInstrument {
                    id: Uuid::new_v4(),
                    step_id: steps[i].id,
                    name: input.name.clone(),
                    product_id: resolve(input)?,
                });
            }
        }

        let mut prep_tasks = Vec::with_capacity(self.prep_tasks.len());
        for (position, p) in self.prep_tasks.iter().enumerate() {
            let task = RecipePrepTask {
                id: Uuid::new_v4(),
                recipe_id: recipe.id,
                position: to_index(position),
                name: p.name.clone(),
                notes: p.notes.clone(),
                explicit_storage_instructions: p.storage_instructions.clone(),
                storage_type: p.storage_type,
                min_buffer_seconds: to_i32(p.min_buffer_seconds),
                max_buffer_seconds: to_i32(p.max_buffer_seconds),
                min_storage_temp_c: p.min_storage_temp_c,
                max_storage_temp_c: p.max_storage_temp_c,
            };
            let mut links = Vec::with_capacity(p.steps.len());
            for link in &p.steps {
                let Some(step) = steps.get(link.step) else {
                    return Err(RecipeGraphError::UnknownPrepTaskStep {
                        name: p.name.clone(),
                        step: format!("#{}", link.step),
                    });
                };
                links.push(RecipePrepTaskStep {
                    id: Uuid::new_v4(),
                    prep_task_id: task.id,
                    recipe_step_id: step.id,
                    satisfies_recipe_step: link.satisfies_recipe_step,
                });
            }
            prep_tasks.push(PrepTaskWithSteps { task, steps: links });
        }

        Ok(RecipeGraph {
            recipe,
            steps,
            products,
            ingredients,
            instruments,
            prep_tasks,
        })
    }
}
