//! Running many episodes concurrently.

use std::sync::Arc;

use derive_new::new;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use crate::callbacks::{CallbackList, EpisodeCallback};
use crate::config::EpisodeConfig;
use crate::game::GameDefinition;
use crate::master::{CancelHandle, GameMaster};
use crate::recorder::{EpisodeResult, EpisodeStatus, Transcript};
use crate::registry::ModelRegistry;

/// One episode to run: its id and the model for each seat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, new)]
pub struct EpisodePlan {
    /// Episode id, unique within the run.
    #[new(into)]
    pub episode_id: String,
    /// Model name or alias per seat, in role order.
    pub models: Vec<String>,
}

/// How one planned episode ended.
#[derive(Debug, Clone, PartialEq)]
pub enum EpisodeReport {
    /// The episode reached a result (of any status).
    Finished {
        /// Recorded result.
        result: EpisodeResult,
        /// Full transcript.
        transcript: Transcript,
    },
    /// The episode could not be set up, or its result could not be recorded.
    Failed {
        /// Planned episode id.
        episode_id: String,
        /// Error message.
        reason: String,
    },
}

impl EpisodeReport {
    /// Returns the result of a finished episode.
    pub fn result(&self) -> Option<&EpisodeResult> {
        match self {
            Self::Finished { result, .. } => Some(result),
            Self::Failed { .. } => None,
        }
    }
}

/// Reports of a whole run, in plan order.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    /// Run id shared by every transcript.
    pub run_id: String,
    /// One report per planned episode.
    pub episodes: Vec<EpisodeReport>,
}

impl RunReport {
    /// Episodes that reached `SUCCESS` or `LOSS`.
    pub fn completed(&self) -> usize {
        self.count(|r| matches!(r.status, EpisodeStatus::Success | EpisodeStatus::Loss))
    }

    /// Episodes the engine aborted.
    pub fn aborted(&self) -> usize {
        self.count(|r| r.status == EpisodeStatus::Aborted)
    }

    /// Episodes ended by provider or engine failures, or that never ran.
    pub fn errored(&self) -> usize {
        let failed = self
            .episodes
            .iter()
            .filter(|e| matches!(e, EpisodeReport::Failed { .. }))
            .count();
        failed + self.count(|r| r.status == EpisodeStatus::Error)
    }

    fn count(&self, pred: impl Fn(&EpisodeResult) -> bool) -> usize {
        self.episodes
            .iter()
            .filter_map(EpisodeReport::result)
            .filter(|r| pred(r))
            .count()
    }
}

/// Runs episodes in parallel against a shared registry.
///
/// Each episode is sequential on its own task; only the registry and the
/// per-provider quotas behind it are shared.
#[derive(Debug, Clone)]
pub struct Harness {
    registry: Arc<ModelRegistry>,
    config: EpisodeConfig,
    run_id: String,
    max_concurrent: usize,
    callbacks: CallbackList,
    cancel: CancelHandle,
}

impl Harness {
    /// Creates a harness running up to four episodes at once.
    pub fn new(registry: Arc<ModelRegistry>, config: EpisodeConfig, run_id: impl Into<String>) -> Self {
        Self {
            registry,
            config,
            run_id: run_id.into(),
            max_concurrent: 4,
            callbacks: CallbackList::new(),
            cancel: CancelHandle::new(),
        }
    }

    /// Sets the concurrency bound.
    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent.max(1);
        self
    }

    /// Notifies `callbacks` of run and episode boundaries.
    pub fn with_callbacks(mut self, callbacks: CallbackList) -> Self {
        self.callbacks = callbacks;
        self
    }

    /// Returns a handle cancelling every episode of the run.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Runs every planned episode of `game` and reports them in plan order.
    #[instrument(skip(self, game, plans), fields(run = %self.run_id, game = %game.name(), episodes = plans.len()))]
    pub async fn run_all<G>(&self, game: G, plans: Vec<EpisodePlan>) -> RunReport
    where
        G: GameDefinition + Clone + 'static,
    {
        self.callbacks.on_run_start(&self.run_id);
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let mut join_set = JoinSet::new();

        for (idx, plan) in plans.iter().cloned().enumerate() {
            let game = game.clone();
            let harness = self.clone();
            let semaphore = Arc::clone(&semaphore);
            join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                (idx, harness.run_one(game, plan).await)
            });
        }

        let mut ordered: Vec<Option<EpisodeReport>> = vec![None; plans.len()];
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((idx, report)) => ordered[idx] = Some(report),
                Err(e) => error!(error = %e, "Episode task panicked"),
            }
        }

        let episodes = plans
            .iter()
            .zip(ordered)
            .map(|(plan, report)| {
                report.unwrap_or_else(|| EpisodeReport::Failed {
                    episode_id: plan.episode_id.clone(),
                    reason: "episode task did not complete".to_string(),
                })
            })
            .collect();
        let report = RunReport {
            run_id: self.run_id.clone(),
            episodes,
        };
        info!(
            completed = report.completed(),
            aborted = report.aborted(),
            errored = report.errored(),
            "Run finished"
        );
        self.callbacks.on_run_end(&self.run_id);
        report
    }

    async fn run_one<G: GameDefinition>(&self, game: G, plan: EpisodePlan) -> EpisodeReport {
        let failed = |reason: String| {
            warn!(episode = %plan.episode_id, %reason, "Episode failed");
            EpisodeReport::Failed {
                episode_id: plan.episode_id.clone(),
                reason,
            }
        };

        let mut models = Vec::with_capacity(plan.models.len());
        for name in &plan.models {
            match self.registry.resolve(name) {
                Ok(model) => models.push(model),
                Err(e) => return failed(e.to_string()),
            }
        }

        let master = match GameMaster::new(game, &models, self.config.clone()) {
            Ok(master) => master
                .with_ids(self.run_id.clone(), plan.episode_id.clone())
                .with_cancel(self.cancel.clone())
                .with_callbacks(self.callbacks.clone()),
            Err(e) => return failed(e.to_string()),
        };
        debug!(episode = %plan.episode_id, "Episode starting");
        match master.run().await {
            Ok((result, transcript)) => EpisodeReport::Finished { result, transcript },
            Err(e) => failed(e.to_string()),
        }
    }
}
