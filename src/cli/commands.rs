//! CLI command definitions using clap.
//!
//! Defines the main CLI structure and subcommands:
//! - serve: run the scheduler daemon in the foreground
//! - info: show where a repository sits in the update schedule
//! - enqueue: request an update of a repository
//! - reclone: request a fresh clone of a repository
//! - sync: request a changeset sync
//! - ping / stats: daemon health

use clap::{Parser, Subcommand, ValueEnum};
use repo_updater::domain::{ChangesetId, PriorityClass, RepoId, RepoName, RepoRef};
use std::path::PathBuf;

/// repo-updater - keeps mirrored repositories fresh
#[derive(Parser, Debug)]
#[command(name = "repo-updater")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Optional config file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Daemon socket, overriding the config file
    #[arg(short, long, global = true)]
    pub socket: Option<PathBuf>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Commands>,
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
    /// Run the scheduler daemon
    Serve,

    /// Show scheduling state for a repository
    Info {
        /// Repository ID
        repo_id: u32,
    },

    /// Request an update of a repository
    Enqueue {
        /// Repository ID or name
        repo: String,

        /// Priority class for the request
        #[arg(short, long, value_enum, default_value_t = PriorityArg::Manual)]
        priority: PriorityArg,
    },

    /// Request a fresh clone of a repository
    Reclone {
        /// Repository ID
        repo_id: u32,

        /// Why the clone is being replaced
        #[arg(short, long)]
        reason: Option<String>,
    },

    /// Request a sync of one or more changesets
    Sync {
        /// Changeset IDs
        #[arg(required = true)]
        ids: Vec<i64>,
    },

    /// Check that the daemon is reachable
    Ping,

    /// Show scheduler counters
    Stats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PriorityArg {
    Low,
    Normal,
    Manual,
}

impl From<PriorityArg> for PriorityClass {
    fn from(arg: PriorityArg) -> Self {
        match arg {
            PriorityArg::Low => PriorityClass::Low,
            PriorityArg::Normal => PriorityClass::Normal,
            PriorityArg::Manual => PriorityClass::Manual,
        }
    }
}

/// Numeric arguments address a repository by ID, anything else by name.
pub fn parse_repo_ref(arg: &str) -> RepoRef {
    match arg.parse::<u32>() {
        Ok(id) => RepoRef::Id(RepoId(id)),
        Err(_) => RepoRef::Name(RepoName::new(arg)),
    }
}

pub fn changeset_ids(ids: &[i64]) -> Vec<ChangesetId> {
    ids.iter().copied().map(ChangesetId).collect()
}
