//! Command-line interface for parley_bench.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use parley_bench::BuiltinGame;

/// Parley Bench - play dialogue games between language models
#[derive(Parser, Debug)]
#[command(name = "parley_bench")]
#[command(about = "Benchmark harness that plays dialogue games between LLMs", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Subcommand to run
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Play episodes of a game and write their transcripts
    Run {
        /// Game to play
        #[arg(short, long)]
        game: BuiltinGame,

        /// Model name or alias per seat; a single model fills every seat
        #[arg(short, long = "model", required = true)]
        models: Vec<String>,

        /// Backend configuration file
        #[arg(short, long, default_value = "backends.toml")]
        config: PathBuf,

        /// Number of episodes
        #[arg(short, long, default_value = "1")]
        episodes: usize,

        /// Turn limit per episode
        #[arg(long, default_value = "20")]
        max_turns: usize,

        /// Invalid responses tolerated per player
        #[arg(long, default_value = "2")]
        violation_limit: u32,

        /// Attempts per request on transient provider failures
        #[arg(long, default_value = "3")]
        retry_attempts: u32,

        /// Charge clarification re-prompts against the turn limit
        #[arg(long)]
        retries_consume_turns: bool,

        /// Maximum messages kept in each player's context
        #[arg(long)]
        max_context_messages: Option<usize>,

        /// Episodes running at once
        #[arg(long, default_value = "4")]
        concurrency: usize,

        /// Directory transcripts are written to
        #[arg(short, long, default_value = "results")]
        output: PathBuf,

        /// Run id; defaults to a timestamp
        #[arg(long)]
        run_id: Option<String>,

        /// Secret number for the guessing game
        #[arg(long, default_value = "42")]
        secret: u32,
    },

    /// List configured models or built-in games
    List {
        /// What to list
        #[command(subcommand)]
        what: ListTarget,
    },

    /// Score transcripts
    Score {
        /// Transcript files
        #[arg(required = true)]
        transcripts: Vec<PathBuf>,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

/// Things `list` can show
#[derive(Subcommand, Debug)]
pub enum ListTarget {
    /// Models in the backend configuration
    Models {
        /// Backend configuration file
        #[arg(short, long, default_value = "backends.toml")]
        config: PathBuf,
    },

    /// Built-in games
    Games,
}
