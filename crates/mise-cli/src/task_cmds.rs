//! `mise task` commands: list a plan's prep tasks and move them through
//! their lifecycle.

use anyhow::{Context, Result};

use mise_core::{Engine, TaskFilter};
use mise_db::models::{MealPlanTask, TaskOrigin, TaskStatus};

use crate::TaskCommands;
use crate::plan_cmds::parse_id;

const TIME_FORMAT: &str = "%a %m-%d %H:%M";

pub async fn run_task_command(command: TaskCommands, engine: &Engine) -> Result<()> {
    match command {
        TaskCommands::List {
            plan_id,
            status,
            incomplete,
            limit,
            offset,
        } => {
            let filter = TaskFilter {
                status: status.as_deref().map(parse_status).transpose()?,
                option_id: None,
                incomplete_only: incomplete,
                limit,
                offset,
            };
            cmd_list(engine, &plan_id, &filter).await
        }
        TaskCommands::Status {
            task_id,
            status,
            explanation,
        } => cmd_status(engine, &task_id, &status, &explanation).await,
    }
}

fn parse_status(value: &str) -> Result<TaskStatus> {
    value
        .parse()
        .with_context(|| format!("invalid task status: {value:?}"))
}

fn status_icon(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Unfinished => ".",
        TaskStatus::Delayed => "~",
        TaskStatus::Ignored => "-",
        TaskStatus::Finished => "+",
    }
}

fn origin_label(task: &MealPlanTask) -> &'static str {
    match task.origin {
        TaskOrigin::RecipeStep { .. } => "step",
        TaskOrigin::PrepTask { .. } => "prep",
    }
}

async fn cmd_list(engine: &Engine, plan_id_str: &str, filter: &TaskFilter) -> Result<()> {
    let plan_id = parse_id("plan", plan_id_str)?;
    let tasks = engine.list_tasks(plan_id, filter).await?;

    if tasks.is_empty() {
        println!("No tasks found.");
        return Ok(());
    }

    println!(
        "{:<3} {:<38} {:<5} {:<16} {:<16} {:<10}",
        "", "ID", "KIND", "START AFTER", "FINISH BY", "STATUS"
    );
    println!("{}", "-".repeat(92));

    for task in &tasks {
        println!(
            "[{}] {:<38} {:<5} {:<16} {:<16} {:<10}",
            status_icon(task.status),
            task.id,
            origin_label(task),
            task.cannot_start_before.format(TIME_FORMAT).to_string(),
            task.must_finish_by.format(TIME_FORMAT).to_string(),
            task.status,
        );
        if !task.creation_explanation.is_empty() {
            println!("    {}", task.creation_explanation);
        }
        if let Some(storage) = task.storage_type {
            let temps = match (task.min_storage_temp_c, task.max_storage_temp_c) {
                (Some(min), Some(max)) => format!(" at {min}..{max} C"),
                (Some(min), None) => format!(" at >= {min} C"),
                (None, Some(max)) => format!(" at <= {max} C"),
                (None, None) => String::new(),
            };
            println!("    store: {storage}{temps}");
        }
    }

    if tasks.len() as i64 == filter.limit {
        println!();
        println!(
            "Showing {} task(s); use --offset {} for more.",
            tasks.len(),
            filter.offset + filter.limit
        );
    }

    Ok(())
}

async fn cmd_status(engine: &Engine, task_id_str: &str, status: &str, explanation: &str) -> Result<()> {
    let task_id = parse_id("task", task_id_str)?;
    let to = parse_status(status)?;

    let task = engine.change_task_status(task_id, to, explanation).await?;

    println!("Task {} is now {}.", task.id, task.status);
    if let Some(completed) = task.completed_at {
        println!("  Completed: {}", completed.format("%Y-%m-%d %H:%M:%S UTC"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_status_accepts_known_values() {
        assert_eq!(parse_status("finished").unwrap(), TaskStatus::Finished);
        assert_eq!(parse_status("delayed").unwrap(), TaskStatus::Delayed);
    }

    #[test]
    fn parse_status_rejects_unknown() {
        let err = parse_status("done").unwrap_err();
        assert!(format!("{err:#}").contains("done"));
    }
}
