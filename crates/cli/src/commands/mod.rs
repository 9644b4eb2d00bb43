//! Subcommand implementations

pub mod review;
pub mod tickets;
