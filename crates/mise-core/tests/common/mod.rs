//! In-memory engine harness shared by the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use mise_db::models::{MealName, StorageType};

use mise_core::ballot::{BallotOutcome, BallotVote, Voter};
use mise_core::clock::ManualClock;
use mise_core::config::EngineConfig;
use mise_core::model::{NewEvent, NewOption, NewPlan, PlanAggregate};
use mise_core::publish::{BufferedPublisher, RecordingPublisher};
use mise_core::recipe::{NewPrepTask, NewPrepTaskStep, NewRecipe, NewStep, NewStepInput, ProductRef};
use mise_core::repo::MemoryRepository;
use mise_core::{Engine, Result};

pub fn ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .expect("valid timestamp")
        .with_timezone(&Utc)
}

/// Clock start for every harness.
pub const START: &str = "2025-01-08T00:00:00Z";
/// Voting deadline of plans built by [`TestHarness::plan`].
pub const DEADLINE: &str = "2025-01-08T12:00:00Z";
/// Start of the first event of plans built by [`TestHarness::plan`].
pub const FIRST_EVENT: &str = "2025-01-10T18:00:00Z";

pub struct TestHarness {
    pub engine: Arc<Engine>,
    pub repo: Arc<MemoryRepository>,
    pub clock: Arc<ManualClock>,
    pub recorder: Arc<RecordingPublisher>,
    pub household: Uuid,
}

impl TestHarness {
    pub fn new() -> Self {
        let mut config = EngineConfig::default();
        config.worker.retry_base_delay_ms = 0;
        Self::with_config(config)
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let repo = Arc::new(MemoryRepository::new());
        let clock = Arc::new(ManualClock::new(ts(START)));
        let recorder = Arc::new(RecordingPublisher::new());
        let publisher = Arc::new(BufferedPublisher::spawn(recorder.clone(), 1024));
        let engine = Arc::new(Engine::new(repo.clone(), clock.clone(), publisher, config));
        Self {
            engine,
            repo,
            clock,
            recorder,
            household: Uuid::new_v4(),
        }
    }

    pub fn voter(&self, user_id: Uuid) -> Voter {
        Voter {
            user_id,
            household_id: self.household,
        }
    }

    /// A meal made of one two-step recipe with no prep tasks.
    pub async fn simple_meal(&self, name: &str) -> Uuid {
        let recipe = NewRecipe {
            name: format!("{name} recipe"),
            steps: vec![
                NewStep {
                    preparation: "chop".into(),
                    products: vec!["chopped".into()],
                    estimated_seconds: Some(600),
                    ..NewStep::default()
                },
                NewStep {
                    preparation: "cook".into(),
                    estimated_seconds: Some(1200),
                    ingredients: vec![NewStepInput {
                        name: "chopped".into(),
                        from: Some(ProductRef {
                            step: 0,
                            product: "chopped".into(),
                        }),
                    }],
                    ..NewStep::default()
                },
            ],
            prep_tasks: Vec::new(),
        };
        let graph = self.engine.import_recipe(recipe).await.expect("import recipe");
        self.engine
            .create_meal(name, &[graph.recipe.id])
            .await
            .expect("create meal")
            .id
    }

    /// A meal whose recipe brines ahead of time (1h..24h buffer) and roasts
    /// for an hour at serving time.
    pub async fn brined_meal(&self) -> Uuid {
        let recipe = NewRecipe {
            name: "Roast chicken".into(),
            steps: vec![
                NewStep {
                    preparation: "brine".into(),
                    products: vec!["brined chicken".into()],
                    ..NewStep::default()
                },
                NewStep {
                    preparation: "roast".into(),
                    estimated_seconds: Some(3600),
                    ingredients: vec![NewStepInput {
                        name: "brined chicken".into(),
                        from: Some(ProductRef {
                            step: 0,
                            product: "brined chicken".into(),
                        }),
                    }],
                    ..NewStep::default()
                },
            ],
            prep_tasks: vec![NewPrepTask {
                name: "brine overnight".into(),
                notes: String::new(),
                storage_type: StorageType::Covered,
                storage_instructions: String::new(),
                min_buffer_seconds: 3600,
                max_buffer_seconds: 86400,
                min_storage_temp_c: Some(1.0),
                max_storage_temp_c: Some(4.0),
                steps: vec![NewPrepTaskStep {
                    step: 0,
                    satisfies_recipe_step: true,
                }],
            }],
        };
        let graph = self.engine.import_recipe(recipe).await.expect("import recipe");
        self.engine
            .create_meal("Roast chicken dinner", &[graph.recipe.id])
            .await
            .expect("create meal")
            .id
    }

    /// A plan with one dinner event per entry of `events`, on consecutive
    /// days from [`FIRST_EVENT`], each offering the given meals.
    pub async fn plan(&self, events: &[Vec<Uuid>]) -> PlanAggregate {
        let first = ts(FIRST_EVENT);
        let events = events
            .iter()
            .enumerate()
            .map(|(i, meals)| {
                let starts_at = first + Duration::days(i64::try_from(i).unwrap());
                NewEvent {
                    meal_name: MealName::Dinner,
                    notes: String::new(),
                    starts_at,
                    ends_at: starts_at + Duration::hours(2),
                    options: meals
                        .iter()
                        .map(|&meal_id| NewOption {
                            meal_id,
                            notes: String::new(),
                            assigned_cook: None,
                        })
                        .collect(),
                }
            })
            .collect();
        self.engine
            .create_plan(NewPlan {
                household_id: self.household,
                notes: String::new(),
                voting_deadline: ts(DEADLINE),
                events,
            })
            .await
            .expect("create plan")
    }

    pub async fn vote(
        &self,
        plan_id: Uuid,
        user_id: Uuid,
        ranks: &[(Uuid, u32)],
    ) -> Result<BallotOutcome> {
        let votes: Vec<BallotVote> = ranks
            .iter()
            .map(|&(option_id, rank)| BallotVote {
                option_id,
                rank,
                abstain: false,
                notes: String::new(),
            })
            .collect();
        self.engine
            .submit_ballot(plan_id, self.voter(user_id), &votes)
            .await
    }

    pub async fn abstain(&self, plan_id: Uuid, user_id: Uuid, options: &[Uuid]) -> Result<BallotOutcome> {
        let votes: Vec<BallotVote> = options
            .iter()
            .map(|&option_id| BallotVote {
                option_id,
                rank: 0,
                abstain: true,
                notes: String::new(),
            })
            .collect();
        self.engine
            .submit_ballot(plan_id, self.voter(user_id), &votes)
            .await
    }

    pub fn pass_deadline(&self) {
        self.clock.set(ts(DEADLINE) + Duration::seconds(1));
    }

    /// Everything published so far, after draining the buffer.
    pub async fn published(&self) -> &RecordingPublisher {
        self.engine.publisher().flush().await;
        &self.recorder
    }
}

pub fn option_ids(plan: &PlanAggregate, event: usize) -> Vec<Uuid> {
    plan.events[event].options.iter().map(|o| o.id).collect()
}
