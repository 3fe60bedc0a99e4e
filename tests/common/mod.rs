//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use parley_bench::{
    Backend, Broadcast, ContinuationSignal, EpisodeConfig, GameDefinition, GameRole, ModelSpec,
    Provider, ResolvedModel, RetryPolicy, ScriptedBackend, ScriptedReply, Transition, Violation,
};
use serde::Serialize;

/// Players take turns answering `SAY: <word>`; each word is relayed to the
/// next seat. Signals a win once `win_after` words were said, never if `None`.
#[derive(Debug, Clone)]
pub struct Relay {
    pub seats: usize,
    pub win_after: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RelayState {
    pub words: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Word(pub String);

impl GameDefinition for Relay {
    type State = RelayState;
    type Action = Word;

    fn name(&self) -> &str {
        "relay"
    }

    fn roles(&self) -> Vec<GameRole> {
        (0..self.seats)
            .map(|i| GameRole::new(format!("speaker{i}"), "Answer with 'SAY: <word>'."))
            .collect()
    }

    fn initial_state(&self) -> Self::State {
        RelayState::default()
    }

    fn prompt(&self, state: &Self::State, _player: usize) -> String {
        format!("Word {}?", state.words.len() + 1)
    }

    fn parse(&self, raw: &str, _state: &Self::State, _player: usize) -> Result<Word, Violation> {
        let word = raw
            .strip_prefix("SAY:")
            .ok_or_else(|| Violation::parse("missing SAY:"))?
            .trim();
        if word.is_empty() {
            return Err(Violation::rule("empty word"));
        }
        Ok(Word(word.to_string()))
    }

    fn apply(&self, action: Word, state: &Self::State, player: usize) -> Transition<RelayState> {
        let mut words = state.words.clone();
        words.push(action.0.clone());
        let signal = match self.win_after {
            Some(n) if words.len() >= n => ContinuationSignal::Win,
            _ => ContinuationSignal::Continue,
        };
        let mut transition = Transition::new(RelayState { words }, signal);
        if self.seats > 1 {
            let next = (player + 1) % self.seats;
            transition = transition.with_broadcast(Broadcast::new(
                next,
                format!("Player {} said: {}", player + 1, action.0),
            ));
        }
        transition
    }
}

/// A scripted model plus a handle to inspect what it received.
pub fn scripted(name: &str, replies: Vec<ScriptedReply>) -> (Arc<ResolvedModel>, Arc<ScriptedBackend>) {
    let backend = Arc::new(ScriptedBackend::new(replies));
    let model = ResolvedModel::new(ModelSpec::new(name, Provider::Scripted, 8192), backend.clone());
    (Arc::new(model), backend)
}

/// A model whose backend is `backend`.
pub fn model(name: &str, backend: Arc<dyn Backend>) -> Arc<ResolvedModel> {
    Arc::new(ResolvedModel::new(
        ModelSpec::new(name, Provider::Scripted, 8192),
        backend,
    ))
}

/// Default episode configuration with millisecond backoff.
pub fn fast_config() -> EpisodeConfig {
    EpisodeConfig::default().with_provider_retry(
        RetryPolicy::default()
            .with_base_delay(Duration::from_millis(1))
            .with_max_delay(Duration::from_millis(5)),
    )
}
