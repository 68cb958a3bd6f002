//! CLI command definitions using clap.
//!
//! Defines the main CLI structure and subcommands:
//! - select/tick: choose and run the next step
//! - start/complete/check/reset: execution signals
//! - grade: score the pending reflection
//! - show/projects: inspect stored state

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// agentloop - step orchestration with stall detection and quality-gated reruns
#[derive(Parser, Debug)]
#[command(name = "agentloop")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Optional config file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Store directory (overrides config and the per-workspace default)
    #[arg(long, global = true)]
    pub store_dir: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Check if verbose mode is enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }
}

/// Main subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show which agent would run next
    Select {
        /// Project ID
        project: String,
    },

    /// Record that an agent started
    Start {
        /// Project ID
        project: String,

        /// Agent ID
        agent: String,
    },

    /// Record that an agent finished
    Complete {
        /// Project ID
        project: String,

        /// Agent ID
        agent: String,

        /// Reported status (success, error, blocked)
        #[arg(short, long, default_value = "success")]
        status: String,

        /// JSON file with the full worker result; carries the step through grading
        #[arg(short, long)]
        result: Option<PathBuf>,

        /// JSON file with quality signals used when a result is given
        #[arg(long)]
        signals: Option<PathBuf>,
    },

    /// Report agents running past their timeout
    Check {
        /// Project ID
        project: String,
    },

    /// Move running or frozen runs back to not started
    Reset {
        /// Project ID
        project: String,

        /// Only reset this agent
        #[arg(short, long)]
        agent: Option<String>,
    },

    /// Grade the pending reflection
    Grade {
        /// Project ID
        project: String,
    },

    /// Advance the loop one bounded step
    Tick {
        /// Project ID
        project: String,

        /// JSON file with quality signals
        #[arg(long)]
        signals: Option<PathBuf>,
    },

    /// Print a project's state
    Show {
        /// Project ID
        project: String,

        /// Print the raw JSON record
        #[arg(long)]
        json: bool,
    },

    /// List known projects
    Projects,
}
