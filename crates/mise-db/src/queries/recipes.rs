//! Database query functions for recipes, their step graph and prep tasks,
//! and the meals that bundle recipes.

use anyhow::{Context, Result};
use sqlx::PgExecutor;
use uuid::Uuid;

use crate::models::{
    Meal, Recipe, RecipePrepTask, RecipePrepTaskStep, RecipeStep, RecipeStepIngredient,
    RecipeStepInstrument, RecipeStepProduct,
};

// -----------------------------------------------------------------------
// Inserts
// -----------------------------------------------------------------------

pub async fn insert_recipe<'e, E: PgExecutor<'e>>(executor: E, recipe: &Recipe) -> Result<()> {
    sqlx::query("INSERT INTO recipes (id, name, created_at) VALUES ($1, $2, $3)")
        .bind(recipe.id)
        .bind(&recipe.name)
        .bind(recipe.created_at)
        .execute(executor)
        .await
        .context("failed to insert recipe")?;

    Ok(())
}

pub async fn insert_step<'e, E: PgExecutor<'e>>(executor: E, step: &RecipeStep) -> Result<()> {
    sqlx::query(
        "INSERT INTO recipe_steps (id, recipe_id, step_index, preparation, notes, estimated_seconds) \
         VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(step.id)
    .bind(step.recipe_id)
    .bind(step.step_index)
    .bind(&step.preparation)
    .bind(&step.notes)
    .bind(step.estimated_seconds)
    .execute(executor)
    .await
    .with_context(|| format!("failed to insert recipe step {}", step.step_index))?;

    Ok(())
}

pub async fn insert_product<'e, E: PgExecutor<'e>>(
    executor: E,
    product: &RecipeStepProduct,
) -> Result<()> {
    sqlx::query("INSERT INTO recipe_step_products (id, step_id, name) VALUES ($1, $2, $3)")
        .bind(product.id)
        .bind(product.step_id)
        .bind(&product.name)
        .execute(executor)
        .await
        .context("failed to insert recipe step product")?;

    Ok(())
}

pub async fn insert_ingredient<'e, E: PgExecutor<'e>>(
    executor: E,
    ingredient: &RecipeStepIngredient,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO recipe_step_ingredients (id, step_id, name, product_id) \
         VALUES ($1, $2, $3, $4)",
    )
    .bind(ingredient.id)
    .bind(ingredient.step_id)
    .bind(&ingredient.name)
    .bind(ingredient.product_id)
    .execute(executor)
    .await
    .context("failed to insert recipe step ingredient")?;

    Ok(())
}

pub async fn insert_instrument<'e, E: PgExecutor<'e>>(
    executor: E,
    instrument: &RecipeStepInstrument,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO recipe_step_instruments (id, step_id, name, product_id) \
         VALUES ($1, $2, $3, $4)",
    )
    .bind(instrument.id)
    .bind(instrument.step_id)
    .bind(&instrument.name)
    .bind(instrument.product_id)
    .execute(executor)
    .await
    .context("failed to insert recipe step instrument")?;

    Ok(())
}

pub async fn insert_prep_task<'e, E: PgExecutor<'e>>(
    executor: E,
    task: &RecipePrepTask,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO recipe_prep_tasks \
         (id, recipe_id, position, name, notes, explicit_storage_instructions, storage_type, \
          min_buffer_seconds, max_buffer_seconds, min_storage_temp_c, max_storage_temp_c) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
    )
    .bind(task.id)
    .bind(task.recipe_id)
    .bind(task.position)
    .bind(&task.name)
    .bind(&task.notes)
    .bind(&task.explicit_storage_instructions)
    .bind(task.storage_type)
    .bind(task.min_buffer_seconds)
    .bind(task.max_buffer_seconds)
    .bind(task.min_storage_temp_c)
    .bind(task.max_storage_temp_c)
    .execute(executor)
    .await
    .with_context(|| format!("failed to insert prep task {:?}", task.name))?;

    Ok(())
}

pub async fn insert_prep_task_step<'e, E: PgExecutor<'e>>(
    executor: E,
    link: &RecipePrepTaskStep,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO recipe_prep_task_steps (id, prep_task_id, recipe_step_id, satisfies_recipe_step) \
         VALUES ($1, $2, $3, $4)",
    )
    .bind(link.id)
    .bind(link.prep_task_id)
    .bind(link.recipe_step_id)
    .bind(link.satisfies_recipe_step)
    .execute(executor)
    .await
    .context("failed to insert prep task step")?;

    Ok(())
}

// -----------------------------------------------------------------------
// Reads
// -----------------------------------------------------------------------

pub async fn get_recipe<'e, E: PgExecutor<'e>>(executor: E, id: Uuid) -> Result<Option<Recipe>> {
    let recipe = sqlx::query_as::<_, Recipe>("SELECT * FROM recipes WHERE id = $1")
        .bind(id)
        .fetch_optional(executor)
        .await
        .context("failed to fetch recipe")?;

    Ok(recipe)
}

/// A recipe's steps in declared index order.
pub async fn list_steps<'e, E: PgExecutor<'e>>(
    executor: E,
    recipe_id: Uuid,
) -> Result<Vec<RecipeStep>> {
    let steps = sqlx::query_as::<_, RecipeStep>(
        "SELECT * FROM recipe_steps WHERE recipe_id = $1 ORDER BY step_index ASC",
    )
    .bind(recipe_id)
    .fetch_all(executor)
    .await
    .context("failed to list recipe steps")?;

    Ok(steps)
}

pub async fn list_products<'e, E: PgExecutor<'e>>(
    executor: E,
    recipe_id: Uuid,
) -> Result<Vec<RecipeStepProduct>> {
    let products = sqlx::query_as::<_, RecipeStepProduct>(
        "SELECT p.* FROM recipe_step_products p \
         JOIN recipe_steps s ON s.id = p.step_id \
         WHERE s.recipe_id = $1 \
         ORDER BY s.step_index ASC, p.name ASC",
    )
    .bind(recipe_id)
    .fetch_all(executor)
    .await
    .context("failed to list recipe step products")?;

    Ok(products)
}

pub async fn list_ingredients<'e, E: PgExecutor<'e>>(
    executor: E,
    recipe_id: Uuid,
) -> Result<Vec<RecipeStepIngredient>> {
    let ingredients = sqlx::query_as::<_, RecipeStepIngredient>(
        "SELECT i.* FROM recipe_step_ingredients i \
         JOIN recipe_steps s ON s.id = i.step_id \
         WHERE s.recipe_id = $1 \
         ORDER BY s.step_index ASC, i.name ASC",
    )
    .bind(recipe_id)
    .fetch_all(executor)
    .await
    .context("failed to list recipe step ingredients")?;

    Ok(ingredients)
}

pub async fn list_instruments<'e, E: PgExecutor<'e>>(
    executor: E,
    recipe_id: Uuid,
) -> Result<Vec<RecipeStepInstrument>> {
    let instruments = sqlx::query_as::<_, RecipeStepInstrument>(
        "SELECT i.* FROM recipe_step_instruments i \
         JOIN recipe_steps s ON s.id = i.step_id \
         WHERE s.recipe_id = $1 \
         ORDER BY s.step_index ASC, i.name ASC",
    )
    .bind(recipe_id)
    .fetch_all(executor)
    .await
    .context("failed to list recipe step instruments")?;

    Ok(instruments)
}

pub async fn list_prep_tasks<'e, E: PgExecutor<'e>>(
    executor: E,
    recipe_id: Uuid,
) -> Result<Vec<RecipePrepTask>> {
    let tasks = sqlx::query_as::<_, RecipePrepTask>(
        "SELECT * FROM recipe_prep_tasks WHERE recipe_id = $1 ORDER BY position ASC, id ASC",
    )
    .bind(recipe_id)
    .fetch_all(executor)
    .await
    .context("failed to list recipe prep tasks")?;

    Ok(tasks)
}

pub async fn list_prep_task_steps<'e, E: PgExecutor<'e>>(
    executor: E,
    recipe_id: Uuid,
) -> Result<Vec<RecipePrepTaskStep>> {
    let links = sqlx::query_as::<_, RecipePrepTaskStep>(
        "SELECT l.* FROM recipe_prep_task_steps l \
         JOIN recipe_prep_tasks t ON t.id = l.prep_task_id \
         WHERE t.recipe_id = $1 \
         ORDER BY l.prep_task_id ASC, l.recipe_step_id ASC",
    )
    .bind(recipe_id)
    .fetch_all(executor)
    .await
    .context("failed to list prep task steps")?;

    Ok(links)
}

// -----------------------------------------------------------------------
// Meals
// -----------------------------------------------------------------------

pub async fn insert_meal<'e, E: PgExecutor<'e>>(executor: E, meal: &Meal) -> Result<()> {
    sqlx::query("INSERT INTO meals (id, name, created_at) VALUES ($1, $2, $3)")
        .bind(meal.id)
        .bind(&meal.name)
        .bind(meal.created_at)
        .execute(executor)
        .await
        .context("failed to insert meal")?;

    Ok(())
}

pub async fn insert_meal_recipe<'e, E: PgExecutor<'e>>(
    executor: E,
    meal_id: Uuid,
    recipe_id: Uuid,
    position: i32,
) -> Result<()> {
    sqlx::query("INSERT INTO meal_recipes (meal_id, recipe_id, position) VALUES ($1, $2, $3)")
        .bind(meal_id)
        .bind(recipe_id)
        .bind(position)
        .execute(executor)
        .await
        .context("failed to link recipe to meal")?;

    Ok(())
}

pub async fn get_meal<'e, E: PgExecutor<'e>>(executor: E, id: Uuid) -> Result<Option<Meal>> {
    let meal = sqlx::query_as::<_, Meal>("SELECT * FROM meals WHERE id = $1")
        .bind(id)
        .fetch_optional(executor)
        .await
        .context("failed to fetch meal")?;

    Ok(meal)
}

/// Recipe ids bundled by a meal, in position order.
pub async fn list_meal_recipe_ids<'e, E: PgExecutor<'e>>(
    executor: E,
    meal_id: Uuid,
) -> Result<Vec<Uuid>> {
    let rows: Vec<(Uuid,)> = sqlx::query_as(
        "SELECT recipe_id FROM meal_recipes WHERE meal_id = $1 ORDER BY position ASC, recipe_id ASC",
    )
    .bind(meal_id)
    .fetch_all(executor)
    .await
    .context("failed to list meal recipes")?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}
