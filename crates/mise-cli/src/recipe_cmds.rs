//! `mise recipe` and `mise meal` commands.

use anyhow::{Context, Result};

use mise_core::import;
use mise_core::Engine;

use crate::plan_cmds::{parse_id, read_file};
use crate::{MealCommands, RecipeCommands};

pub async fn run_recipe_command(command: RecipeCommands, engine: &Engine) -> Result<()> {
    match command {
        RecipeCommands::Import { file } => cmd_import(engine, &file).await,
        RecipeCommands::Show { recipe_id } => cmd_show(engine, &recipe_id).await,
    }
}

pub async fn run_meal_command(command: MealCommands, engine: &Engine) -> Result<()> {
    match command {
        MealCommands::Create { name, recipe_ids } => cmd_create_meal(engine, &name, &recipe_ids).await,
    }
}

/// Parse, validate and store a recipe. Cyclic or dangling graphs are
/// refused before anything is written.
async fn cmd_import(engine: &Engine, file_path: &str) -> Result<()> {
    let content = read_file("recipe", file_path)?;
    let recipe = import::parse_recipe(&content)
        .with_context(|| format!("failed to parse recipe file: {file_path}"))?;

    let graph = engine.import_recipe(recipe).await?;

    println!("Recipe imported.");
    println!();
    println!("  Recipe ID:   {}", graph.recipe.id);
    println!("  Name:        {}", graph.recipe.name);
    println!("  Steps:       {}", graph.steps.len());
    println!("  Prep tasks:  {}", graph.prep_tasks.len());

    Ok(())
}

/// Print a stored recipe's steps in executable order.
async fn cmd_show(engine: &Engine, recipe_id_str: &str) -> Result<()> {
    let recipe_id = parse_id("recipe", recipe_id_str)?;
    let walk = engine.walk_recipe(recipe_id).await?;

    println!("Recipe: {} ({})", walk.recipe().name, walk.recipe().id);
    println!();
    println!("Steps:");
    for (n, step) in walk.steps().iter().enumerate() {
        let duration = step
            .estimated_seconds
            .map(|s| format!(" ~{}m", s / 60))
            .unwrap_or_default();
        let prepped = if walk.satisfies_recipe_step(step.id) {
            " [prepped ahead]"
        } else {
            ""
        };
        println!("  {:>2}. {}{duration}{prepped}", n + 1, step.preparation);
    }

    if !walk.prep_tasks().is_empty() {
        println!();
        println!("Prep tasks:");
        for prep in walk.prep_tasks() {
            let task = &prep.task;
            println!(
                "  - {} ({}, {}s..{}s before serving)",
                task.name, task.storage_type, task.min_buffer_seconds, task.max_buffer_seconds
            );
            for step in walk.covered_steps(task.id) {
                println!("      {}", step.preparation);
            }
        }
    }

    Ok(())
}

async fn cmd_create_meal(engine: &Engine, name: &str, recipe_ids: &[String]) -> Result<()> {
    let recipe_ids = recipe_ids
        .iter()
        .map(|id| parse_id("recipe", id))
        .collect::<Result<Vec<_>>>()?;

    let meal = engine.create_meal(name, &recipe_ids).await?;

    println!("Meal created.");
    println!("  Meal ID:  {}", meal.id);
    println!("  Name:     {}", meal.name);
    println!("  Recipes:  {}", recipe_ids.len());

    Ok(())
}
