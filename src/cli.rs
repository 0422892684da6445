// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use quorum_config::PlanningModeSetting;

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one task: coordinate the agents on a query and print the answer.
    ///
    /// Equivalent to passing the query as a bare argument; the subcommand
    /// form composes better in scripts.
    Ask {
        /// The query to coordinate on.
        query: String,
    },

    /// List all registered backend drivers.
    ListBackends {
        /// Emit machine-readable JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Print the merged configuration and exit.
    ShowConfig,
}

#[derive(Parser, Debug)]
#[command(
    name = "quorum",
    about = "Run several LLM agents in parallel on one query and let them vote on the answer",
    version,
    long_about = None,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// The query to coordinate on.  Omit to start an interactive session.
    #[arg(value_name = "QUERY")]
    pub query: Option<String>,

    /// Explicit config file (merged over the standard search paths)
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Override the task deadline, e.g. "30s" or "2m"
    #[arg(long, value_parser = humantime::parse_duration)]
    pub deadline: Option<Duration>,

    /// Override planning mode: auto runs the irreversibility pre-check
    #[arg(long, value_parser = parse_planning)]
    pub planning: Option<PlanningModeSetting>,

    /// Disable planning mode entirely (shorthand for --planning off)
    #[arg(long, conflicts_with = "planning")]
    pub no_planning: bool,

    /// Stay in the interactive follow-up loop after the first query
    #[arg(long, short = 'i')]
    pub interactive: bool,

    /// Increase log verbosity (-v: debug, -vv: trace)
    #[arg(long, short = 'v', action = clap::ArgAction::Count)]
    pub verbose: u8,
}

fn parse_planning(s: &str) -> Result<PlanningModeSetting, String> {
    match s {
        "auto" => Ok(PlanningModeSetting::Auto),
        "on" => Ok(PlanningModeSetting::On),
        "off" => Ok(PlanningModeSetting::Off),
        other => Err(format!("invalid planning mode {other:?} (auto|on|off)")),
    }
}
