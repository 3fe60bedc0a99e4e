//! Episode lifecycle hooks.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{instrument, warn};

use crate::recorder::Transcript;

/// Observer of run and episode boundaries.
///
/// Every method has an empty default so implementors override only what
/// they need.
pub trait EpisodeCallback: Send + Sync + std::fmt::Debug {
    /// Called once before the first episode of a run.
    fn on_run_start(&self, _run_id: &str) {}

    /// Called after players are initialized, before the first turn.
    fn on_episode_start(&self, _transcript: &Transcript) {}

    /// Called when round `round` begins, before its first prompt.
    fn on_round_start(&self, _transcript: &Transcript, _round: usize) {}

    /// Called when every turn of round `round` has been played.
    fn on_round_end(&self, _transcript: &Transcript, _round: usize) {}

    /// Called once the episode result is recorded.
    fn on_episode_end(&self, _transcript: &Transcript) {}

    /// Called after the last episode of a run.
    fn on_run_end(&self, _run_id: &str) {}
}

/// Fans every hook out to a list of callbacks, in insertion order.
#[derive(Debug, Clone, Default)]
pub struct CallbackList {
    callbacks: Vec<Arc<dyn EpisodeCallback>>,
}

impl CallbackList {
    /// Creates an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a callback.
    pub fn push(&mut self, callback: Arc<dyn EpisodeCallback>) {
        self.callbacks.push(callback);
    }

    /// Adds a callback, builder style.
    pub fn with(mut self, callback: Arc<dyn EpisodeCallback>) -> Self {
        self.push(callback);
        self
    }

    /// Returns the number of callbacks.
    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    /// Returns `true` if no callbacks are registered.
    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }
}

impl EpisodeCallback for CallbackList {
    fn on_run_start(&self, run_id: &str) {
        self.callbacks.iter().for_each(|c| c.on_run_start(run_id));
    }

    fn on_episode_start(&self, transcript: &Transcript) {
        self.callbacks
            .iter()
            .for_each(|c| c.on_episode_start(transcript));
    }

    fn on_round_start(&self, transcript: &Transcript, round: usize) {
        self.callbacks
            .iter()
            .for_each(|c| c.on_round_start(transcript, round));
    }

    fn on_round_end(&self, transcript: &Transcript, round: usize) {
        self.callbacks
            .iter()
            .for_each(|c| c.on_round_end(transcript, round));
    }

    fn on_episode_end(&self, transcript: &Transcript) {
        self.callbacks
            .iter()
            .for_each(|c| c.on_episode_end(transcript));
    }

    fn on_run_end(&self, run_id: &str) {
        self.callbacks.iter().for_each(|c| c.on_run_end(run_id));
    }
}

/// Writes every finished transcript to
/// `<root>/<run_id>/<game>/<episode_id>.json`.
#[derive(Debug, Clone)]
pub struct TranscriptWriter {
    root: PathBuf,
}

impl TranscriptWriter {
    /// Creates a writer below `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Path a transcript is written to.
    pub fn path_for(&self, transcript: &Transcript) -> PathBuf {
        self.root
            .join(&transcript.run_id)
            .join(&transcript.game)
            .join(format!("{}.json", transcript.episode_id))
    }
}

impl EpisodeCallback for TranscriptWriter {
    #[instrument(skip(self, transcript), fields(episode = %transcript.episode_id))]
    fn on_episode_end(&self, transcript: &Transcript) {
        // Hooks cannot fail the episode; a lost file is logged instead.
        if let Err(e) = transcript.write_to(self.path_for(transcript)) {
            warn!(error = %e, "Failed to write transcript");
        }
    }
}
