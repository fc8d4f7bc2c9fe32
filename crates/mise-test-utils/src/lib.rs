//! Shared test utilities for mise integration tests.
//!
//! Provides a PostgreSQL instance shared across tests. Each test gets its
//! own database within the instance.
//!
//! Two modes:
//! - **`MISE_TEST_PG_URL`** set (nextest setup script): use the external
//!   container directly. No testcontainers overhead per process.
//! - **No env var** (`cargo test`): spin up a container via testcontainers,
//!   shared per binary through a `OnceCell`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};
use testcontainers::ContainerAsync;
use testcontainers::ImageExt;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use uuid::Uuid;

use mise_db::models::{
    ElectionMethod, Meal, MealName, MealPlan, MealPlanEvent, MealPlanOption, PlanStatus, Recipe,
    RecipeStep,
};
use mise_db::pool;
use mise_db::queries::{plans, recipes};

/// Shared container state: base URL and optional container handle (kept alive).
struct SharedPg {
    base_url: String,
    /// Held to keep the container alive. `None` when using an external URL.
    _container: Option<ContainerAsync<Postgres>>,
}

/// Lazily-initialized shared PostgreSQL.
static SHARED_PG: OnceCell<SharedPg> = OnceCell::const_new();

async fn init_shared_pg() -> SharedPg {
    // If a setup script already started a container, use that directly.
    if let Ok(url) = std::env::var("MISE_TEST_PG_URL") {
        return SharedPg {
            base_url: url,
            _container: None,
        };
    }

    let container = Postgres::default()
        .with_tag("18")
        .start()
        .await
        .expect("failed to start PostgreSQL container");

    let host = container.get_host().await.expect("failed to get host");
    let port = container
        .get_host_port_ipv4(5432)
        .await
        .expect("failed to get mapped port");

    let base_url = format!("postgresql://postgres:postgres@{host}:{port}");

    SharedPg {
        base_url,
        _container: Some(container),
    }
}

/// Base URL for the shared PostgreSQL.
///
/// Lazily starts a container on first call (unless `MISE_TEST_PG_URL` is
/// set). The URL points at the server root (no database name appended).
pub async fn pg_url() -> &'static str {
    let shared = SHARED_PG.get_or_init(init_shared_pg).await;
    &shared.base_url
}

/// Create a temporary database with migrations applied.
///
/// Returns `(pool, db_name)`. The pool connects to a uniquely-named
/// database within the shared instance. Call [`drop_test_db`] with the
/// returned `db_name` when the test is done.
pub async fn create_test_db() -> (PgPool, String) {
    let base_url = pg_url().await;

    // Connect to the default "postgres" database to issue CREATE DATABASE.
    let maint_url = format!("{base_url}/postgres");
    let maint_pool = PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(30))
        .connect(&maint_url)
        .await
        .expect("failed to connect to maintenance database in container");

    let db_name = format!("mise_test_{}", Uuid::new_v4().simple());
    let stmt = format!("CREATE DATABASE {db_name}");
    maint_pool
        .execute(stmt.as_str())
        .await
        .unwrap_or_else(|e| panic!("failed to create temp database {db_name}: {e}"));
    maint_pool.close().await;

    // Connect to the new database and run migrations.
    let temp_url = format!("{base_url}/{db_name}");
    let temp_pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(30))
        .connect(&temp_url)
        .await
        .unwrap_or_else(|e| panic!("failed to connect to temp database {db_name}: {e}"));

    pool::run_migrations(&temp_pool)
        .await
        .expect("migrations should succeed");

    (temp_pool, db_name)
}

/// Drop a temporary database.
///
/// Terminates existing connections and drops the database. Safe to call
/// even if the database was already dropped.
pub async fn drop_test_db(db_name: &str) {
    let base_url = pg_url().await;
    let maint_url = format!("{base_url}/postgres");

    let maint_pool = PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(30))
        .connect(&maint_url)
        .await
        .expect("failed to connect to maintenance database for cleanup");

    // Terminate existing connections first.
    let terminate = format!(
        "SELECT pg_terminate_backend(pid) \
         FROM pg_stat_activity \
         WHERE datname = '{db_name}' AND pid <> pg_backend_pid()"
    );
    let _ = maint_pool.execute(terminate.as_str()).await;

    let stmt = format!("DROP DATABASE IF EXISTS {db_name}");
    let _ = maint_pool.execute(stmt.as_str()).await;
    maint_pool.close().await;
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// Ids of the rows written by [`seed_plan`].
#[derive(Debug, Clone)]
pub struct SeededPlan {
    pub plan_id: Uuid,
    pub household_id: Uuid,
    pub event_id: Uuid,
    pub option_ids: Vec<Uuid>,
    pub meal_id: Uuid,
    pub recipe_id: Uuid,
    pub step_ids: Vec<Uuid>,
}

/// Insert a one-step recipe, a meal bundling it, and an awaiting-votes plan
/// with a single dinner event offering that meal `option_count` times.
pub async fn seed_plan(
    pool: &PgPool,
    voting_deadline: DateTime<Utc>,
    serve_at: DateTime<Utc>,
    option_count: usize,
) -> SeededPlan {
    let now = Utc::now();
    let recipe = Recipe {
        id: Uuid::new_v4(),
        name: "Fixture stew".to_owned(),
        created_at: now,
    };
    recipes::insert_recipe(pool, &recipe).await.expect("insert recipe");
    let step = RecipeStep {
        id: Uuid::new_v4(),
        recipe_id: recipe.id,
        step_index: 0,
        preparation: "simmer".to_owned(),
        notes: String::new(),
        estimated_seconds: Some(1800),
    };
    recipes::insert_step(pool, &step).await.expect("insert step");

    let meal = Meal {
        id: Uuid::new_v4(),
        name: "Fixture dinner".to_owned(),
        created_at: now,
    };
    recipes::insert_meal(pool, &meal).await.expect("insert meal");
    recipes::insert_meal_recipe(pool, meal.id, recipe.id, 0)
        .await
        .expect("link meal recipe");

    let plan = MealPlan {
        id: Uuid::new_v4(),
        household_id: Uuid::new_v4(),
        status: PlanStatus::AwaitingVotes,
        notes: String::new(),
        election_method: ElectionMethod::Schulze,
        voting_deadline,
        tie_recorded: false,
        version: 0,
        created_at: now,
        finalized_at: None,
    };
    plans::insert_plan(pool, &plan).await.expect("insert plan");
    let event = MealPlanEvent {
        id: Uuid::new_v4(),
        plan_id: plan.id,
        meal_name: MealName::Dinner,
        notes: String::new(),
        starts_at: serve_at,
        ends_at: serve_at + chrono::Duration::hours(2),
        created_at: now,
    };
    plans::insert_event(pool, &event).await.expect("insert event");

    let mut option_ids = Vec::with_capacity(option_count);
    for _ in 0..option_count {
        let option = MealPlanOption {
            id: Uuid::new_v4(),
            event_id: event.id,
            meal_id: meal.id,
            notes: String::new(),
            assigned_cook: None,
            chosen: false,
            tiebroken: false,
            tasks_created: false,
            created_at: now,
        };
        plans::insert_option(pool, &option).await.expect("insert option");
        option_ids.push(option.id);
    }

    SeededPlan {
        plan_id: plan.id,
        household_id: plan.household_id,
        event_id: event.id,
        option_ids,
        meal_id: meal.id,
        recipe_id: recipe.id,
        step_ids: vec![step.id],
    }
}
