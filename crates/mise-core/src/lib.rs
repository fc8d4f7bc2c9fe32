//! Household meal planning: ranked-choice voting over meal options, plan
//! finalization, and prep-task scheduling.

pub mod ballot;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod finalize;
pub mod import;
pub mod materialize;
pub mod model;
pub mod publish;
pub mod recipe;
pub mod repo;
pub mod schedule;
pub mod state;
pub mod tally;
pub mod worker;

pub use engine::Engine;
pub use error::{EngineError, Result};
pub use mise_db::queries::tasks::TaskFilter;
