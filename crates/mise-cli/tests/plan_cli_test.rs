//! Integration tests for the documents the `mise` CLI reads.
//!
//! Recipe, plan and ballot TOML go through the same parsers the commands
//! use and into an engine backed by a temporary PostgreSQL database.

use std::sync::Arc;

use chrono::{DateTime, Duration, DurationRound, SecondsFormat, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use mise_core::ballot::{BallotOutcome, Voter};
use mise_core::clock::ManualClock;
use mise_core::config::EngineConfig;
use mise_core::finalize::FinalizeOutcome;
use mise_core::import;
use mise_core::publish::{BufferedPublisher, LogPublisher};
use mise_core::repo::PgRepository;
use mise_core::{Engine, EngineError, TaskFilter};
use mise_db::models::{PlanStatus, StorageType};
use mise_test_utils::{create_test_db, drop_test_db};

const ROAST_RECIPE: &str = r#"
[recipe]
name = "Roast chicken"

[[steps]]
preparation = "brine"
products = ["brined chicken"]

[[steps]]
preparation = "roast"
estimated_seconds = 3600

[[steps.ingredients]]
name = "brined chicken"
from_step = 0

[[steps.instruments]]
name = "oven"

[[prep_tasks]]
name = "brine overnight"
storage_type = "covered"
min_buffer_seconds = 3600
max_buffer_seconds = 86400

[[prep_tasks.steps]]
step = 0
"#;

const CYCLIC_RECIPE: &str = r#"
[recipe]
name = "Ouroboros"

[[steps]]
preparation = "fold"
products = ["dough"]

[[steps.ingredients]]
name = "filling"
from_step = 1

[[steps]]
preparation = "fill"
products = ["filling"]

[[steps.ingredients]]
name = "dough"
from_step = 0
"#;

struct Fixture {
    pool: PgPool,
    db_name: String,
    engine: Engine,
    clock: Arc<ManualClock>,
    household: Uuid,
}

impl Fixture {
    async fn new() -> Self {
        let (pool, db_name) = create_test_db().await;
        let start = Utc::now()
            .duration_trunc(Duration::seconds(1))
            .expect("truncate to seconds");
        let clock = Arc::new(ManualClock::new(start));
        let engine = Engine::new(
            Arc::new(PgRepository::new(pool.clone())),
            clock.clone(),
            Arc::new(BufferedPublisher::spawn(Arc::new(LogPublisher), 64)),
            EngineConfig::default(),
        );
        Self {
            pool,
            db_name,
            engine,
            clock,
            household: Uuid::new_v4(),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        self.engine.now()
    }

    async fn roast_meal(&self) -> Uuid {
        let recipe = import::parse_recipe(ROAST_RECIPE).expect("parse recipe");
        let graph = self.engine.import_recipe(recipe).await.expect("import recipe");
        self.engine
            .create_meal("Sunday roast", &[graph.recipe.id])
            .await
            .expect("create meal")
            .id
    }

    fn plan_document(&self, meal: Uuid, serve_at: DateTime<Utc>) -> String {
        let ts = |t: DateTime<Utc>| t.to_rfc3339_opts(SecondsFormat::Secs, true);
        format!(
            r#"
[plan]
household_id = "{household}"
notes = "family dinner"
voting_deadline = "{deadline}"

[[events]]
meal_name = "dinner"
starts_at = "{starts}"
ends_at = "{ends}"

[[events.options]]
meal_id = "{meal}"
notes = "with potatoes"

[[events.options]]
meal_id = "{meal}"
notes = "with salad"
"#,
            household = self.household,
            deadline = ts(self.now() + Duration::hours(1)),
            starts = ts(serve_at),
            ends = ts(serve_at + Duration::hours(2)),
        )
    }

    fn voter(&self) -> Voter {
        Voter {
            user_id: Uuid::new_v4(),
            household_id: self.household,
        }
    }

    async fn table_count(&self, table: &str) -> i64 {
        let row: (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(&self.pool)
            .await
            .expect("count rows");
        row.0
    }

    async fn teardown(self) {
        self.engine.shutdown().await;
        self.pool.close().await;
        drop_test_db(&self.db_name).await;
    }
}

fn ballot_document(entries: &[(Uuid, Option<u32>)]) -> String {
    entries
        .iter()
        .map(|(option, rank)| match rank {
            Some(rank) => format!("[[votes]]\noption_id = \"{option}\"\nrank = {rank}\n"),
            None => format!("[[votes]]\noption_id = \"{option}\"\nabstain = true\n"),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[tokio::test]
async fn documents_drive_a_plan_to_scheduled_tasks() {
    let f = Fixture::new().await;
    let meal = f.roast_meal().await;
    let serve_at = f.now() + Duration::days(2);

    let new_plan = import::parse_plan(&f.plan_document(meal, serve_at)).expect("parse plan");
    let plan = f.engine.create_plan(new_plan).await.expect("create plan");
    assert_eq!(plan.plan.status, PlanStatus::AwaitingVotes);
    let options: Vec<Uuid> = plan.options().map(|o| o.id).collect();
    assert_eq!(options.len(), 2);

    let ballot = import::parse_ballot(&ballot_document(&[(options[0], Some(1)), (options[1], Some(0))]))
        .expect("parse ballot");
    let voter = f.voter();
    let outcome = f.engine.submit_ballot(plan.id(), voter, &ballot).await.unwrap();
    assert_eq!(outcome, BallotOutcome::Recorded { votes: 2 });
    let again = f.engine.submit_ballot(plan.id(), voter, &ballot).await.unwrap();
    assert_eq!(again, BallotOutcome::Replayed);

    let abstain = import::parse_ballot(&ballot_document(&[(options[0], None), (options[1], None)]))
        .expect("parse abstaining ballot");
    f.engine
        .submit_ballot(plan.id(), f.voter(), &abstain)
        .await
        .unwrap();

    f.clock.advance(Duration::hours(1));
    let outcome = f.engine.finalize_plan(plan.id()).await.unwrap();
    let FinalizeOutcome::Finalized { tie, winners } = outcome else {
        panic!("expected finalized, got {outcome:?}");
    };
    assert!(!tie);
    assert_eq!(winners.len(), 1);
    assert_eq!(winners[0].option_id, options[1]);

    let report = f.engine.materialize_tasks(plan.id()).await.unwrap();
    assert_eq!(report.task_count(), 2);

    let tasks = f
        .engine
        .list_tasks(plan.id(), &TaskFilter::default())
        .await
        .unwrap();
    let prep = tasks
        .iter()
        .find(|t| t.storage_type.is_some())
        .expect("prep task");
    assert_eq!(prep.storage_type, Some(StorageType::Covered));
    assert_eq!(prep.must_finish_by, serve_at - Duration::hours(1));
    assert!(tasks.iter().all(|t| t.option_id == options[1]));

    f.teardown().await;
}

#[tokio::test]
async fn cyclic_recipe_document_stores_nothing() {
    let f = Fixture::new().await;

    let recipe = import::parse_recipe(CYCLIC_RECIPE).expect("document itself is well formed");
    let err = f.engine.import_recipe(recipe).await.unwrap_err();
    assert!(
        matches!(err, EngineError::RecipeGraphInvalid { .. }),
        "unexpected error: {err}"
    );
    assert_eq!(f.table_count("recipes").await, 0);
    assert_eq!(f.table_count("recipe_steps").await, 0);

    f.teardown().await;
}

#[tokio::test]
async fn partial_ballot_document_is_rejected() {
    let f = Fixture::new().await;
    let meal = f.roast_meal().await;
    let serve_at = f.now() + Duration::days(2);
    let new_plan = import::parse_plan(&f.plan_document(meal, serve_at)).expect("parse plan");
    let plan = f.engine.create_plan(new_plan).await.expect("create plan");
    let first = plan.options().map(|o| o.id).next().expect("an option");

    let ballot = import::parse_ballot(&ballot_document(&[(first, Some(0))])).expect("parse ballot");
    let err = f
        .engine
        .submit_ballot(plan.id(), f.voter(), &ballot)
        .await
        .unwrap_err();
    assert!(
        matches!(err, EngineError::IncompleteBallot { .. }),
        "unexpected error: {err}"
    );
    assert_eq!(f.table_count("meal_plan_option_votes").await, 0);

    f.teardown().await;
}
