//! Parley Bench - dialogue-game benchmarking for language models
//!
//! Pits conversational models against each other, or against scripted game
//! logic, in multi-turn games with fixed rules, and records every exchange
//! for scoring.
//!
//! # Architecture
//!
//! - **Backends**: one [`Backend`] contract over OpenAI, OpenAI-compatible
//!   servers, Anthropic, Ollama and in-process stand-ins
//! - **Registry**: resolves model names and aliases to adapters
//! - **Player**: a model plus its private, bounded context
//! - **Game master**: the turn-by-turn state machine driving an episode
//! - **Recorder**: append-only transcript with an exactly-once result
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use parley_bench::{
//!     EpisodeConfig, GameMaster, ModelSpec, NumberGuess, Provider, ResolvedModel,
//!     ScriptedBackend,
//! };
//!
//! # async fn example() -> anyhow::Result<()> {
//! let model = Arc::new(ResolvedModel::new(
//!     ModelSpec::new("stand-in", Provider::Scripted, 4096),
//!     Arc::new(ScriptedBackend::from_texts(["GUESS: 50", "GUESS: 42"])),
//! ));
//! let master = GameMaster::new(NumberGuess::default(), &[model], EpisodeConfig::default())?;
//! let (result, transcript) = master.run().await?;
//! println!("{} after {} turns, {} events", result.status, result.turn_count, transcript.events.len());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![forbid(unsafe_code)]

// Private module declarations
mod backends;
mod callbacks;
mod config;
mod game;
mod games;
mod harness;
mod master;
mod message;
mod player;
mod recorder;
mod registry;
mod replay;
mod scoring;

// Crate-level exports - Backend adapters
pub use backends::{
    AnthropicBackend, Backend, BackendError, BackendErrorKind, FinishReason, GenerationParams,
    GuardedBackend, OllamaBackend, OpenAIBackend, ProgrammaticBackend, Provider, ProviderUsage,
    QuotaRegistry, RateLimiter, RawResponse, ScriptedBackend, ScriptedReply, TokenUsage,
    UsageSnapshot, check_context_window, ensure_alternating_roles, estimate_message_tokens,
    estimate_tokens, estimate_usage,
};

// Crate-level exports - Configuration
pub use config::{
    BackendsConfig, ConfigError, EpisodeConfig, ModelEntry, RetryAccounting, RetryPolicy,
};

// Crate-level exports - Messages and contexts
pub use message::{Context, ContextPolicy, Message, Role, SnapshotMessage};

// Crate-level exports - Model registry
pub use registry::{ModelRegistry, ModelSpec, RegistryError, RegistryErrorKind, ResolvedModel};

// Crate-level exports - Players
pub use player::{Player, PlayerId};

// Crate-level exports - Game contract
pub use game::{
    Broadcast, ContinuationSignal, GameDefinition, GameRole, Transition, Violation, ViolationKind,
};

// Crate-level exports - Game master
pub use master::{
    CancelHandle, EpisodeState, GameMaster, MasterError, MasterErrorKind, Phase, state_delta,
};

// Crate-level exports - Recording
pub use recorder::{
    EndReason, EpisodeRecorder, EpisodeResult, EpisodeStatus, OutcomeFlag, PlayerRecord,
    RecorderError, RecorderErrorKind, Transcript, TranscriptEvent,
};
pub use replay::ReplayScript;

// Crate-level exports - Running and scoring
pub use callbacks::{CallbackList, EpisodeCallback, TranscriptWriter};
pub use harness::{EpisodePlan, EpisodeReport, Harness, RunReport};
pub use scoring::{EpisodeScores, ScoreSummary};

// Crate-level exports - Built-in games
pub use games::BuiltinGame;
pub use games::guess::{Guess, GuessState, Hint, NumberGuess};
pub use games::tictactoe::{Board, Mark, Move, TicTacToe, TicTacToeState};
