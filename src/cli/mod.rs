//! CLI module for repo-updater - command-line interface and subcommands.
//!
//! `serve` runs the daemon; the remaining subcommands talk to a running
//! daemon over its Unix socket.

pub mod commands;

pub use commands::Cli;
