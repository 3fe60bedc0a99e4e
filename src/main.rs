//! Parley Bench - command-line runner
//!
//! Plays built-in dialogue games against configured models and scores the
//! resulting transcripts.

#![warn(missing_docs)]

mod cli;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::Parser;
use cli::{Cli, Command, ListTarget};
use parley_bench::{
    BackendsConfig, BuiltinGame, CallbackList, ContextPolicy, EpisodeConfig, EpisodePlan,
    EpisodeScores, Harness, ModelRegistry, NumberGuess, RetryAccounting, RetryPolicy,
    RunReport, ScoreSummary, TicTacToe, Transcript, TranscriptWriter,
};
use strum::IntoEnumIterator;
use tracing::{info, instrument, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Credentials for hosted providers
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            game,
            models,
            config,
            episodes,
            max_turns,
            violation_limit,
            retry_attempts,
            retries_consume_turns,
            max_context_messages,
            concurrency,
            output,
            run_id,
            secret,
        } => {
            let accounting = if retries_consume_turns {
                RetryAccounting::ConsumesTurn
            } else {
                RetryAccounting::Exempt
            };
            let mut policy = ContextPolicy::unbounded();
            if let Some(max) = max_context_messages {
                policy = policy.with_max_messages(max);
            }
            let episode_config = EpisodeConfig::default()
                .with_max_turns(max_turns)
                .with_violation_limit(violation_limit)
                .with_provider_retry(RetryPolicy::default().with_max_attempts(retry_attempts))
                .with_retry_accounting(accounting)
                .with_context_policy(policy);
            let options = RunOptions {
                game,
                models,
                config,
                episodes,
                concurrency,
                output,
                run_id: run_id
                    .unwrap_or_else(|| chrono::Utc::now().format("%Y%m%dT%H%M%S").to_string()),
                secret,
            };
            run(options, episode_config).await
        }
        Command::List { what } => match what {
            ListTarget::Models { config } => list_models(&config),
            ListTarget::Games => {
                for game in BuiltinGame::iter() {
                    println!("{:<10} {} player(s)  {}", game, game.players(), game.description());
                }
                Ok(())
            }
        },
        Command::Score { transcripts, json } => score(&transcripts, json),
    }
}

/// Settings of one `run` invocation besides the episode configuration.
#[derive(Debug)]
struct RunOptions {
    game: BuiltinGame,
    models: Vec<String>,
    config: PathBuf,
    episodes: usize,
    concurrency: usize,
    output: PathBuf,
    run_id: String,
    secret: u32,
}

#[instrument(skip_all, fields(game = %options.game, run = %options.run_id))]
async fn run(options: RunOptions, episode_config: EpisodeConfig) -> Result<()> {
    let backends = BackendsConfig::from_file(&options.config)
        .with_context(|| format!("loading {}", options.config.display()))?;
    let registry = Arc::new(ModelRegistry::from_config(&backends)?);

    let seats = options.game.players();
    let models = match options.models.as_slice() {
        [single] => vec![single.clone(); seats],
        many if many.len() == seats => many.to_vec(),
        many => anyhow::bail!("{} needs {} models, got {}", options.game, seats, many.len()),
    };
    let plans = (0..options.episodes)
        .map(|i| EpisodePlan::new(format!("episode_{i}"), models.clone()))
        .collect();

    let callbacks = CallbackList::new().with(Arc::new(TranscriptWriter::new(&options.output)));
    let harness = Harness::new(Arc::clone(&registry), episode_config, options.run_id.clone())
        .with_max_concurrent(options.concurrency)
        .with_callbacks(callbacks);

    let cancel = harness.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling running episodes");
            cancel.cancel();
        }
    });

    info!(episodes = options.episodes, "Starting run");
    let report = match options.game {
        BuiltinGame::TicTacToe => harness.run_all(TicTacToe, plans).await,
        BuiltinGame::Guess => {
            let game = NumberGuess::new(options.secret, 100, 7);
            harness.run_all(game, plans).await
        }
    };
    print_report(&report, &options.output);

    for (provider, usage) in registry.quotas().report() {
        info!(
            %provider,
            requests = usage.requests,
            failures = usage.failures,
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            "Provider usage"
        );
    }
    Ok(())
}

fn print_report(report: &RunReport, output: &Path) {
    for episode in &report.episodes {
        match episode {
            parley_bench::EpisodeReport::Finished { result, transcript } => {
                let reason = result
                    .aborted_reason
                    .map(|r| format!(" ({r})"))
                    .unwrap_or_default();
                println!(
                    "{:<12} {}{} after {} turns",
                    transcript.episode_id, result.status, reason, result.turn_count
                );
            }
            parley_bench::EpisodeReport::Failed { episode_id, reason } => {
                println!("{:<12} FAILED: {}", episode_id, reason);
            }
        }
    }
    println!(
        "{} completed, {} aborted, {} errored; transcripts in {}",
        report.completed(),
        report.aborted(),
        report.errored(),
        output.join(&report.run_id).display()
    );
}

#[instrument]
fn list_models(config: &Path) -> Result<()> {
    let backends = BackendsConfig::from_file(config)
        .with_context(|| format!("loading {}", config.display()))?;
    for entry in backends.models() {
        let aliases = if entry.aliases().is_empty() {
            String::new()
        } else {
            format!(" (aliases: {})", entry.aliases().join(", "))
        };
        println!(
            "{:<24} {:<18} {} tokens{}",
            entry.name(),
            entry.provider(),
            entry.context_window_tokens(),
            aliases
        );
    }
    Ok(())
}

#[instrument(skip(paths), fields(files = paths.len()))]
fn score(paths: &[PathBuf], json: bool) -> Result<()> {
    let mut all = Vec::with_capacity(paths.len());
    for path in paths {
        let transcript = Transcript::read_from(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let scores = EpisodeScores::from_transcript(&transcript);
        if json {
            println!("{}", serde_json::to_string(&serde_json::json!({
                "episode_id": transcript.episode_id,
                "game": transcript.game,
                "scores": scores,
            }))?);
        } else {
            println!(
                "{:<12} success={} lose={} aborted={} turns={} requests={} parsed={} violated={} tokens={}",
                transcript.episode_id,
                scores.success,
                scores.lose,
                scores.aborted,
                scores.turns,
                scores.request_count,
                scores.parsed_request_count,
                scores.violated_request_count,
                scores.prompt_tokens + scores.completion_tokens
            );
        }
        all.push(scores);
    }

    let summary = ScoreSummary::from_scores(&all);
    if json {
        println!("{}", serde_json::to_string(&summary)?);
    } else {
        let quality = summary
            .quality_score
            .map(|q| format!("{q:.1}"))
            .unwrap_or_else(|| "n/a".to_string());
        println!(
            "{} episodes, {:.1}% played, quality {}, {:.1} turns on average, {} tokens",
            summary.episodes, summary.played_percent, quality, summary.mean_turns, summary.total_tokens
        );
    }
    Ok(())
}
