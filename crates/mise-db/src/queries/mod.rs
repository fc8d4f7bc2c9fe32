pub mod leases;
pub mod plans;
pub mod recipes;
pub mod tasks;
pub mod votes;
