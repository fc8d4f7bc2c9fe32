//! Task materialization for finalized plans.

use mise_db::models::PlanStatus;
use serde::Serialize;
use uuid::Uuid;

use crate::engine::Engine;
use crate::error::{EngineError, Result};
use crate::publish::{topics, DataChangeMessage, EventType};
use crate::recipe::RecipeWalk;
use crate::schedule;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OptionTasks {
    pub option_id: Uuid,
    pub tasks: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaterializeReport {
    /// Options whose tasks this call inserted.
    pub materialized: Vec<OptionTasks>,
    /// Chosen options that already had tasks.
    pub already_materialized: usize,
}

impl MaterializeReport {
    pub fn task_count(&self) -> usize {
        self.materialized.iter().map(|o| o.tasks).sum()
    }
}

impl Engine {
    /// Expand every chosen option without tasks into scheduled task rows.
    ///
    /// Each option's tasks are inserted in the same transaction that flips
    /// its `tasks_created` flag, so re-running is a no-op for options that
    /// already committed.
    pub async fn materialize_tasks(&self, plan_id: Uuid) -> Result<MaterializeReport> {
        let plan = self.repo().load_plan(plan_id).await?;
        if plan.plan.status != PlanStatus::Finalized {
            return Err(EngineError::IllegalTransition {
                entity: "meal plan",
                from: plan.plan.status.to_string(),
                to: "tasks_materialized".to_owned(),
            });
        }

        let household_id = plan.plan.household_id;
        let mut report = MaterializeReport::default();
        for (event, option) in plan.chosen_options() {
            if option.tasks_created {
                report.already_materialized += 1;
                continue;
            }

            let mut walks = Vec::new();
            for recipe_id in self.repo().meal_recipe_ids(option.meal_id).await? {
                let graph = self.repo().load_recipe(recipe_id).await?;
                let walk = match RecipeWalk::new(graph) {
                    Ok(walk) => walk,
                    Err(source) => {
                        self.emit(
                            topics::ALERTS,
                            DataChangeMessage::new(
                                EventType::RecipeGraphInvalid,
                                "recipe",
                                recipe_id,
                                household_id,
                                self.now(),
                            )
                            .with_metadata(serde_json::json!({
                                "plan_id": plan_id,
                                "option_id": option.id,
                                "error": source.to_string(),
                            })),
                        );
                        return Err(EngineError::RecipeGraphInvalid { recipe_id, source });
                    }
                };
                walks.push(walk);
            }

            let now = self.now();
            let tasks = schedule::schedule_option(option, event.starts_at, &walks, now)?;
            if !self.repo().insert_tasks(option.id, &tasks).await? {
                report.already_materialized += 1;
                continue;
            }

            tracing::info!(
                plan_id = %plan_id,
                option_id = %option.id,
                tasks = tasks.len(),
                "materialized tasks"
            );
            for task in &tasks {
                self.emit(
                    topics::MEAL_PLAN_TASKS,
                    DataChangeMessage::new(
                        EventType::MealPlanTaskCreated,
                        "meal_plan_task",
                        task.id,
                        household_id,
                        now,
                    )
                    .with_metadata(serde_json::json!({
                        "option_id": option.id,
                        "origin": task.origin,
                    })),
                );
            }
            self.emit(
                topics::MEAL_PLAN_OPTIONS,
                DataChangeMessage::new(
                    EventType::MealPlanTasksMaterialized,
                    "meal_plan_option",
                    option.id,
                    household_id,
                    now,
                )
                .with_metadata(serde_json::json!({ "plan_id": plan_id, "tasks": tasks.len() })),
            );
            report.materialized.push(OptionTasks {
                option_id: option.id,
                tasks: tasks.len(),
            });
        }

        Ok(report)
    }
}
