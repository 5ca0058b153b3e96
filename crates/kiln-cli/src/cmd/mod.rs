//! CLI subcommand implementations.

pub mod install;
