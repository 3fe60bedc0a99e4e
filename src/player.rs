//! Players: a model (or stand-in) plus its private conversation context.

use std::sync::Arc;

use tracing::{debug, instrument, warn};

use crate::backends::{Backend, BackendError, GenerationParams, RawResponse};
use crate::message::{Context, ContextPolicy, Message, SnapshotMessage};
use crate::registry::{ModelSpec, ResolvedModel};

/// Identifier of a player within an episode (`"Player 1"`, `"Player 2"`, ...).
pub type PlayerId = String;

/// A participant in an episode.
///
/// The context is owned exclusively by this player; the game master reaches
/// it only through [`Player::respond`] and [`Player::observe`].
#[derive(Debug)]
pub struct Player {
    id: PlayerId,
    game_role: String,
    spec: ModelSpec,
    backend: Arc<dyn Backend>,
    params: GenerationParams,
    context: Context,
    policy: ContextPolicy,
    last_request: Vec<SnapshotMessage>,
}

impl Player {
    /// Creates a player bound to a resolved model.
    #[instrument(skip_all, fields(model = %model.spec().name))]
    pub fn new(
        id: impl Into<PlayerId>,
        game_role: impl Into<String>,
        model: &ResolvedModel,
    ) -> Self {
        let spec = model.spec().clone();
        let mut player = Self {
            id: id.into(),
            game_role: game_role.into(),
            params: spec.generation,
            spec,
            backend: model.backend(),
            context: Context::new(),
            policy: ContextPolicy::default(),
            last_request: Vec::new(),
        };
        player.policy = player.bounded(ContextPolicy::default());
        player
    }

    /// Sets the context policy applied before every request.
    ///
    /// The token bound never exceeds what the model's window leaves after
    /// the completion budget; a policy without a token bound gets exactly
    /// that.
    pub fn with_policy(mut self, policy: ContextPolicy) -> Self {
        self.policy = self.bounded(policy);
        self
    }

    /// Tokens the history may occupy so that the completion still fits the
    /// model's context window.
    pub fn context_budget(&self) -> usize {
        self.spec
            .context_window_tokens
            .saturating_sub(self.params.max_tokens as usize)
    }

    fn bounded(&self, policy: ContextPolicy) -> ContextPolicy {
        let budget = self.context_budget();
        let max_tokens = policy.max_tokens.map_or(budget, |limit| limit.min(budget));
        policy.with_max_tokens(max_tokens)
    }

    /// Returns the policy applied to the context.
    pub fn policy(&self) -> &ContextPolicy {
        &self.policy
    }

    /// Returns the player id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the role this player has in the game.
    pub fn game_role(&self) -> &str {
        &self.game_role
    }

    /// Returns the model spec.
    pub fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    /// Returns the context.
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Returns the history sent with the most recent request.
    pub fn last_request(&self) -> &[SnapshotMessage] {
        &self.last_request
    }

    /// Returns the context without timestamps.
    pub fn snapshot(&self) -> Vec<SnapshotMessage> {
        self.context.snapshot()
    }

    /// Installs the pinned system instructions, replacing the whole context.
    #[instrument(skip(self, instructions), fields(player = %self.id))]
    pub fn initialize(&mut self, instructions: &str) {
        self.context = Context::new();
        if !instructions.is_empty() {
            self.context.push(Message::system(instructions));
        }
        debug!("Player initialized");
    }

    /// Appends a message without requesting a response.
    #[instrument(skip(self, message), fields(player = %self.id, role = %message.role()))]
    pub fn observe(&mut self, message: Message) {
        self.context.push(message);
        self.context.enforce(&self.policy);
    }

    /// Appends `prompt_addition`, asks the backend for a reply over the full
    /// context, appends the reply and returns it.
    ///
    /// When the backend fails the prompt is rolled back, leaving the context
    /// exactly as it was, so that a retry sends the same history.
    ///
    /// # Errors
    ///
    /// Returns the backend's [`BackendError`] unchanged, or a fatal error if
    /// the pinned and recent messages alone exceed the context policy.
    #[instrument(skip(self, prompt_addition), fields(player = %self.id, model = %self.spec.name))]
    pub async fn respond(&mut self, prompt_addition: Message) -> Result<RawResponse, BackendError> {
        let before = self.begin_request(prompt_addition)?;
        let outcome = self.backend.generate(self.context.messages(), &self.params).await;
        self.complete_request(before, outcome)
    }

    /// Asks several players at once, sending one batch per model.
    ///
    /// Players are grouped by model name in order of first appearance and
    /// each group goes to its backend through a single
    /// [`Backend::generate_batch`] call. Results are returned in the order of
    /// `turns`, and every context is updated as by [`Player::respond`].
    #[instrument(skip_all, fields(players = turns.len()))]
    pub async fn batch_respond(
        turns: Vec<(&mut Player, Message)>,
    ) -> Vec<Result<RawResponse, BackendError>> {
        let mut results: Vec<Option<Result<RawResponse, BackendError>>> =
            turns.iter().map(|_| None).collect();
        let mut groups: Vec<(String, Vec<(usize, &mut Player, Context)>)> = Vec::new();

        for (idx, (player, prompt)) in turns.into_iter().enumerate() {
            let before = match player.begin_request(prompt) {
                Ok(before) => before,
                Err(e) => {
                    results[idx] = Some(Err(e));
                    continue;
                }
            };
            let name = player.spec.name.clone();
            match groups.iter_mut().find(|(model, _)| *model == name) {
                Some((_, members)) => members.push((idx, player, before)),
                None => groups.push((name, vec![(idx, player, before)])),
            }
        }

        for (model, members) in groups {
            let Some((_, lead, _)) = members.first() else {
                continue;
            };
            let backend = Arc::clone(&lead.backend);
            let params = lead.params;
            let requests: Vec<Vec<Message>> = members
                .iter()
                .map(|(_, player, _)| player.context.messages().to_vec())
                .collect();
            debug!(%model, size = requests.len(), "Sending batch");

            let mut outcomes = backend.generate_batch(&requests, &params).await.into_iter();
            for (idx, player, before) in members {
                let outcome = outcomes.next().unwrap_or_else(|| {
                    Err(BackendError::malformed(
                        "batch returned fewer responses than requests",
                    ))
                });
                results[idx] = Some(player.complete_request(before, outcome));
            }
        }

        results
            .into_iter()
            .map(|r| r.unwrap_or_else(|| Err(BackendError::fatal("no response for player"))))
            .collect()
    }

    /// Appends the prompt and applies the policy. Returns the context as it
    /// was, for rollback.
    fn begin_request(&mut self, prompt_addition: Message) -> Result<Context, BackendError> {
        let before = self.context.clone();
        self.context.push(prompt_addition);
        self.context.enforce(&self.policy);
        self.last_request = self.context.snapshot();
        if !self.policy.admits(&self.context) {
            warn!("Context cannot be truncated within policy");
            self.context = before;
            return Err(BackendError::fatal(
                "context overflow: pinned and recent messages exceed the context policy",
            ));
        }
        Ok(before)
    }

    fn complete_request(
        &mut self,
        before: Context,
        outcome: Result<RawResponse, BackendError>,
    ) -> Result<RawResponse, BackendError> {
        match outcome {
            Ok(response) => {
                self.context.push(Message::assistant(response.text.clone()));
                self.context.enforce(&self.policy);
                debug!(context_len = self.context.len(), "Player responded");
                Ok(response)
            }
            Err(e) => {
                self.context = before;
                Err(e)
            }
        }
    }

    /// Clears the conversation, keeping pinned system instructions.
    pub fn reset(&mut self) {
        self.context.reset();
    }
}
