mod config;
mod plan_cmds;
mod recipe_cmds;
mod task_cmds;
mod worker_cmd;

use std::sync::Arc;

use clap::{Parser, Subcommand};
use sqlx::PgPool;

use mise_core::Engine;
use mise_core::clock::SystemClock;
use mise_core::config::PublisherSink;
use mise_core::publish::{BufferedPublisher, LogPublisher, PgNotifyPublisher, Publisher};
use mise_core::repo::PgRepository;
use mise_db::pool;

use config::MiseConfig;

#[derive(Parser)]
#[command(name = "mise", about = "Household meal-plan voting and prep scheduling")]
struct Cli {
    /// Database URL (overrides MISE_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a mise config file (no database required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = "postgresql://localhost:5432/mise")]
        db_url: String,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Initialize the mise database (requires config file or env vars)
    DbInit,
    /// Run the finalization and materialization sweeps
    Worker {
        /// Run one sweep of each kind and exit
        #[arg(long)]
        once: bool,
    },
    /// Recipe management
    Recipe {
        #[command(subcommand)]
        command: RecipeCommands,
    },
    /// Meal management
    Meal {
        #[command(subcommand)]
        command: MealCommands,
    },
    /// Meal plan management
    Plan {
        #[command(subcommand)]
        command: PlanCommands,
    },
    /// Ballot submission
    Ballot {
        #[command(subcommand)]
        command: BallotCommands,
    },
    /// Prep task management
    Task {
        #[command(subcommand)]
        command: TaskCommands,
    },
}

#[derive(Subcommand)]
pub enum RecipeCommands {
    /// Import a recipe from a TOML file
    Import {
        /// Path to the recipe TOML file
        file: String,
    },
    /// Show a stored recipe's steps in executable order
    Show {
        /// Recipe ID to show
        recipe_id: String,
    },
}

#[derive(Subcommand)]
pub enum MealCommands {
    /// Create a meal from one or more recipes
    Create {
        /// Meal name
        name: String,
        /// Recipe IDs that make up the meal
        #[arg(required = true)]
        recipe_ids: Vec<String>,
    },
}

#[derive(Subcommand)]
pub enum PlanCommands {
    /// Create a meal plan from a TOML file
    Create {
        /// Path to the plan TOML file
        file: String,
    },
    /// Show a meal plan with its events and options
    Show {
        /// Plan ID to show
        plan_id: String,
        /// Include this user's own votes
        #[arg(long)]
        user: Option<String>,
    },
    /// Tally votes and choose a winner per event
    Finalize {
        /// Plan ID to finalize
        plan_id: String,
    },
    /// Create prep tasks for the chosen options
    Materialize {
        /// Plan ID to materialize
        plan_id: String,
    },
    /// Reopen voting on a plan whose finalization failed
    Replay {
        /// Plan ID to replay
        plan_id: String,
        /// New voting deadline (RFC 3339)
        #[arg(long)]
        deadline: String,
    },
    /// List household members who have not voted yet
    MissingVoters {
        /// Plan ID to check
        plan_id: String,
        /// Household member user ID (repeatable)
        #[arg(long = "member", required = true)]
        members: Vec<String>,
    },
}

#[derive(Subcommand)]
pub enum BallotCommands {
    /// Submit a ballot from a TOML file
    Submit {
        /// Plan ID to vote on
        plan_id: String,
        /// Voting user ID
        #[arg(long)]
        user: String,
        /// Voting user's household ID
        #[arg(long)]
        household: String,
        /// Path to the ballot TOML file
        file: String,
    },
}

#[derive(Subcommand)]
pub enum TaskCommands {
    /// List a plan's prep tasks
    List {
        /// Plan ID
        plan_id: String,
        /// Only tasks in this status
        #[arg(long)]
        status: Option<String>,
        /// Hide finished and ignored tasks
        #[arg(long)]
        incomplete: bool,
        /// Page size
        #[arg(long, default_value_t = 100)]
        limit: i64,
        /// Rows to skip
        #[arg(long, default_value_t = 0)]
        offset: i64,
    },
    /// Change a task's status
    Status {
        /// Task ID
        task_id: String,
        /// New status: unfinished, delayed, ignored, finished
        status: String,
        /// Why the status changed
        #[arg(long, default_value = "")]
        explanation: String,
    },
}

/// Execute the `mise init` command: write config file.
fn cmd_init(db_url: &str, force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let cfg = config::ConfigFile {
        database: config::DatabaseSection {
            url: db_url.to_string(),
        },
        engine: Default::default(),
    };
    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  database.url = {db_url}");
    println!(
        "  sweeps every {}s (finalization) / {}s (materialization)",
        cfg.engine.finalization.sweep_interval, cfg.engine.materialization.sweep_interval
    );
    println!();
    println!("Next: run `mise db-init` to create and migrate the database.");

    Ok(())
}

/// Execute the `mise db-init` command: create database and run migrations.
async fn cmd_db_init(cli_db_url: Option<&str>) -> anyhow::Result<()> {
    let resolved = MiseConfig::resolve(cli_db_url)?;

    println!("Initializing mise database...");

    pool::ensure_database_exists(&resolved.db_config).await?;
    let db_pool = pool::create_pool(&resolved.db_config).await?;
    pool::run_migrations(&db_pool).await?;

    let counts = pool::table_counts(&db_pool).await?;
    println!("Database ready. Tables:");
    for (table, count) in &counts {
        println!("  {table}: {count} rows");
    }

    db_pool.close().await;

    println!("mise db-init complete.");
    Ok(())
}

/// Wire the engine to Postgres, the wall clock, and the configured sink.
fn build_engine(resolved: &MiseConfig, db_pool: &PgPool) -> Arc<Engine> {
    let publisher_config = &resolved.engine.publisher;
    let sink: Arc<dyn Publisher> = match publisher_config.sink {
        PublisherSink::Log => Arc::new(LogPublisher),
        PublisherSink::PgNotify => Arc::new(PgNotifyPublisher::new(
            db_pool.clone(),
            publisher_config.channel.clone(),
        )),
    };
    let publisher = Arc::new(BufferedPublisher::spawn(sink, publisher_config.buffer));
    Arc::new(Engine::new(
        Arc::new(PgRepository::new(db_pool.clone())),
        Arc::new(SystemClock),
        publisher,
        resolved.engine.clone(),
    ))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { db_url, force } => cmd_init(&db_url, force),
        Commands::DbInit => cmd_db_init(cli.database_url.as_deref()).await,
        command => {
            let resolved = MiseConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let engine = build_engine(&resolved, &db_pool);

            let result = match command {
                Commands::Worker { once } => worker_cmd::run_worker(engine.clone(), once).await,
                Commands::Recipe { command } => recipe_cmds::run_recipe_command(command, &engine).await,
                Commands::Meal { command } => recipe_cmds::run_meal_command(command, &engine).await,
                Commands::Plan { command } => plan_cmds::run_plan_command(command, &engine).await,
                Commands::Ballot { command } => plan_cmds::run_ballot_command(command, &engine).await,
                Commands::Task { command } => task_cmds::run_task_command(command, &engine).await,
                Commands::Init { .. } | Commands::DbInit => Ok(()),
            };

            if !engine.shutdown().await {
                tracing::warn!(dropped = engine.publisher().dropped(), "data changes left unpublished");
            }
            db_pool.close().await;
            result
        }
    }
}
