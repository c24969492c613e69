//! Subcommand implementations.

pub mod checkpoint;
pub mod query;
pub mod run;
pub mod status;
