//! CLI module for agentloop - command-line interface and subcommands.
//!
//! Every subcommand maps to one driver operation on one project.

pub mod commands;

pub use commands::Cli;
