//! Episode-level behavior of the game master against scripted players.

mod common;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{Relay, RelayState, Word, fast_config, model, scripted};
use parley_bench::{
    Backend, BackendError, BackendErrorKind, Broadcast, CallbackList, CancelHandle,
    ContextPolicy, ContinuationSignal, EndReason, EpisodeCallback, EpisodeScores, EpisodeStatus,
    FinishReason, GameDefinition, GameMaster, GameRole, GenerationParams, GuardedBackend,
    MasterErrorKind, Message, ModelSpec, NumberGuess, OutcomeFlag, ProgrammaticBackend, Provider,
    RawResponse, ResolvedModel, RetryAccounting, Role, ScriptedBackend, ScriptedReply,
    TokenUsage, Transcript, Transition, Violation, check_context_window, estimate_message_tokens,
};
use serde::Serialize;

/// Records round boundaries and the event count at episode end.
#[derive(Debug, Default)]
struct Log(Mutex<Vec<String>>);

impl EpisodeCallback for Log {
    fn on_round_start(&self, _transcript: &Transcript, round: usize) {
        self.0.lock().unwrap().push(format!("round start {round}"));
    }

    fn on_round_end(&self, _transcript: &Transcript, round: usize) {
        self.0.lock().unwrap().push(format!("round end {round}"));
    }

    fn on_episode_end(&self, transcript: &Transcript) {
        self.0
            .lock()
            .unwrap()
            .push(format!("end {}", transcript.events.len()));
    }
}

#[tokio::test]
async fn two_players_win_on_third_turn() {
    let (first, first_backend) = scripted(
        "alpha",
        vec![ScriptedReply::text("SAY: a"), ScriptedReply::text("SAY: c")],
    );
    let (second, second_backend) = scripted("beta", vec![ScriptedReply::text("SAY: b")]);
    let game = Relay {
        seats: 2,
        win_after: Some(3),
    };

    let master = GameMaster::new(game, &[first, second], fast_config()).unwrap();
    let (result, transcript) = master.run().await.unwrap();

    assert_eq!(result.status, EpisodeStatus::Success);
    assert_eq!(result.turn_count, 3);
    assert_eq!(result.signal, Some(ContinuationSignal::Win));
    let speakers: Vec<_> = transcript.events.iter().map(|e| e.player_id.as_str()).collect();
    assert_eq!(speakers, ["Player 1", "Player 2", "Player 1"]);
    assert!(transcript.events.iter().all(|e| e.outcome_flag == OutcomeFlag::Valid));
    assert_eq!(transcript.result, Some(result));

    // The second player heard about the first word before its own prompt.
    let heard = &second_backend.requests().await[0];
    assert!(heard.iter().any(|m| m.content == "Player 1 said: a"));
    // The first player's second request carries its whole history.
    let second_request = &first_backend.requests().await[1];
    assert_eq!(second_request[0].role, Role::System);
    assert!(second_request.iter().any(|m| m.content == "SAY: a"));
    assert!(second_request.iter().any(|m| m.content == "Player 2 said: b"));
}

#[tokio::test]
async fn repeated_parse_failures_abort_after_limit() {
    let (model, backend) = scripted(
        "rambler",
        vec![
            ScriptedReply::text("hmm"),
            ScriptedReply::text("let me think"),
            ScriptedReply::text("forty-two?"),
            ScriptedReply::text("GUESS: 42"),
        ],
    );
    let config = fast_config().with_violation_limit(2);

    let master = GameMaster::new(NumberGuess::default(), &[model], config).unwrap();
    let (result, transcript) = master.run().await.unwrap();

    assert_eq!(result.status, EpisodeStatus::Aborted);
    assert_eq!(result.aborted_reason, Some(EndReason::RetryLimitExceeded));
    assert_eq!(result.turn_count, 1);
    assert_eq!(transcript.events.len(), 3);
    let attempts: Vec<_> = transcript.events.iter().map(|e| e.attempt).collect();
    assert_eq!(attempts, [1, 2, 3]);
    assert!(
        transcript
            .events
            .iter()
            .all(|e| e.outcome_flag == OutcomeFlag::ParseFailure && e.turn_index == 0)
    );
    assert_eq!(backend.remaining().await, 1);

    // Retries carry a clarification instead of the original prompt.
    let requests = backend.requests().await;
    let last = requests[1].last().unwrap();
    assert_eq!(last.role, Role::User);
    assert!(last.content.contains("rejected"));
}

#[tokio::test]
async fn timeouts_are_retried_within_budget() {
    let scripted_backend = Arc::new(ScriptedBackend::new(vec![
        ScriptedReply::delayed(Duration::from_secs(10), "GUESS: 1"),
        ScriptedReply::delayed(Duration::from_secs(10), "GUESS: 1"),
        ScriptedReply::text("GUESS: 42"),
    ]));
    let guarded = GuardedBackend::new(scripted_backend, Duration::from_millis(50));
    let model = model("slow", Arc::new(guarded));

    let master = GameMaster::new(NumberGuess::default(), &[model], fast_config()).unwrap();
    let (result, transcript) = master.run().await.unwrap();

    assert_eq!(result.status, EpisodeStatus::Success);
    assert_eq!(result.turn_count, 1);
    let flags: Vec<_> = transcript.events.iter().map(|e| e.outcome_flag).collect();
    assert_eq!(
        flags,
        [
            OutcomeFlag::TransientError,
            OutcomeFlag::TransientError,
            OutcomeFlag::Valid
        ]
    );
    assert!(transcript.events.iter().all(|e| e.turn_index == 0));
    assert_eq!(
        transcript.events[0].error,
        Some(BackendErrorKind::Transient("timed out after 50 ms".to_string()))
    );
    // A failed call leaves no trace in the context, so every attempt sends
    // the same history.
    assert_eq!(
        transcript.events[0].request_context_snapshot,
        transcript.events[2].request_context_snapshot
    );
}

#[tokio::test]
async fn turn_limit_ends_as_exhausted_loss() {
    let replies = (0..6).map(|i| ScriptedReply::text(format!("SAY: w{i}"))).collect();
    let (model, backend) = scripted("chatty", replies);
    let game = Relay {
        seats: 1,
        win_after: None,
    };

    let master = GameMaster::new(game, &[model], fast_config().with_max_turns(5)).unwrap();
    let (result, transcript) = master.run().await.unwrap();

    assert_eq!(result.status, EpisodeStatus::Loss);
    assert_eq!(result.turn_count, 5);
    assert_eq!(result.aborted_reason, Some(EndReason::Exhausted));
    assert_eq!(transcript.events.len(), 5);
    let turns: Vec<_> = transcript.events.iter().map(|e| e.turn_index).collect();
    assert_eq!(turns, [0, 1, 2, 3, 4]);
    assert_eq!(backend.remaining().await, 1);
}

#[tokio::test]
async fn transient_failures_beyond_budget_end_in_error() {
    let (model, _) = scripted(
        "flaky",
        vec![
            ScriptedReply::transient("HTTP 503"),
            ScriptedReply::transient("HTTP 503"),
            ScriptedReply::transient("HTTP 503"),
            ScriptedReply::text("GUESS: 42"),
        ],
    );

    let master = GameMaster::new(NumberGuess::default(), &[model], fast_config()).unwrap();
    let (result, transcript) = master.run().await.unwrap();

    assert_eq!(result.status, EpisodeStatus::Error);
    assert_eq!(result.aborted_reason, Some(EndReason::ProviderRetryExhausted));
    assert_eq!(transcript.events.len(), 3);
}

#[tokio::test]
async fn fatal_and_malformed_responses_are_not_retried() {
    for (reply, reason) in [
        (ScriptedReply::fatal("HTTP 401: bad key"), EndReason::FatalError),
        (
            ScriptedReply::Error(BackendErrorKind::MalformedResponse("no content".to_string())),
            EndReason::MalformedResponse,
        ),
    ] {
        let (model, backend) = scripted("broken", vec![reply, ScriptedReply::text("GUESS: 42")]);

        let master = GameMaster::new(NumberGuess::default(), &[model], fast_config()).unwrap();
        let (result, transcript) = master.run().await.unwrap();

        assert_eq!(result.status, EpisodeStatus::Error);
        assert_eq!(result.aborted_reason, Some(reason));
        assert_eq!(transcript.events.len(), 1);
        assert_eq!(backend.remaining().await, 1);
    }
}

#[tokio::test]
async fn retry_accounting_decides_whether_retries_use_turns() {
    let replies = || {
        vec![
            ScriptedReply::text("no idea"),
            ScriptedReply::text("GUESS: 10"),
            ScriptedReply::text("GUESS: 42"),
        ]
    };

    let (model, _) = scripted("guesser", replies());
    let exempt = fast_config().with_max_turns(2);
    let (result, _) = GameMaster::new(NumberGuess::default(), &[model], exempt)
        .unwrap()
        .run()
        .await
        .unwrap();
    assert_eq!(result.status, EpisodeStatus::Success);
    assert_eq!(result.turn_count, 2);

    let (model, _) = scripted("guesser", replies());
    let charged = fast_config()
        .with_max_turns(2)
        .with_retry_accounting(RetryAccounting::ConsumesTurn);
    let (result, transcript) = GameMaster::new(NumberGuess::default(), &[model], charged)
        .unwrap()
        .run()
        .await
        .unwrap();
    assert_eq!(result.status, EpisodeStatus::Loss);
    assert_eq!(result.aborted_reason, Some(EndReason::Exhausted));
    assert_eq!(result.turn_count, 2);
    assert_eq!(transcript.events.len(), 2);
}

#[tokio::test]
async fn cancellation_takes_effect_at_next_transition() {
    let cancel = CancelHandle::new();
    let trigger = cancel.clone();
    let backend = ProgrammaticBackend::new("canceller", move |_| {
        trigger.cancel();
        "SAY: stop".to_string()
    });
    let game = Relay {
        seats: 1,
        win_after: Some(1),
    };

    let master = GameMaster::new(game, &[model("canceller", Arc::new(backend))], fast_config())
        .unwrap()
        .with_cancel(cancel);
    let (result, transcript) = master.run().await.unwrap();

    assert_eq!(result.status, EpisodeStatus::Aborted);
    assert_eq!(result.aborted_reason, Some(EndReason::Cancelled));
    assert_eq!(result.turn_count, 1);
    assert!(transcript.result.is_some());

    // The reply that arrived is kept, but never validated or applied.
    assert_eq!(transcript.events.len(), 1);
    let event = &transcript.events[0];
    assert_eq!(event.outcome_flag, OutcomeFlag::Cancelled);
    assert_eq!(event.raw_response.as_deref(), Some("SAY: stop"));
    assert_eq!(event.parsed_action, None);
    assert!(event.token_usage.is_some());
}

#[tokio::test]
async fn cancelled_before_start_plays_nothing() {
    let (model, backend) = scripted("idle", vec![ScriptedReply::text("GUESS: 42")]);
    let master = GameMaster::new(NumberGuess::default(), &[model], fast_config()).unwrap();
    master.cancel_handle().cancel();

    let (result, _) = master.run().await.unwrap();

    assert_eq!(result.aborted_reason, Some(EndReason::Cancelled));
    assert_eq!(result.turn_count, 0);
    assert!(backend.requests().await.is_empty());
}

#[tokio::test]
async fn requests_respect_context_policy() {
    let replies = (0..10).map(|i| ScriptedReply::text(format!("SAY: w{i}"))).collect();
    let (model, _) = scripted("long", replies);
    let game = Relay {
        seats: 1,
        win_after: Some(10),
    };
    let config = fast_config()
        .with_context_policy(ContextPolicy::unbounded().with_max_messages(4).with_keep_recent(2));

    let master = GameMaster::new(game, &[model], config).unwrap();
    let (result, transcript) = master.run().await.unwrap();

    assert_eq!(result.status, EpisodeStatus::Success);
    for event in &transcript.events {
        let sent = &event.request_context_snapshot;
        assert!(sent.len() <= 4);
        assert_eq!(sent[0].role, Role::System);
        assert_eq!(sent.last().map(|m| m.role), Some(Role::User));
    }
}

#[tokio::test]
async fn valid_events_carry_action_and_state_delta() {
    let (model, _) = scripted("guesser", vec![ScriptedReply::text("GUESS: 42")]);

    let master = GameMaster::new(NumberGuess::default(), &[model], fast_config()).unwrap();
    let (_, transcript) = master.run().await.unwrap();

    let event = &transcript.events[0];
    assert_eq!(event.parsed_action, Some(serde_json::json!({"value": 42})));
    assert_eq!(
        event.resulting_state_delta,
        Some(serde_json::json!({"guesses": [42]}))
    );
    assert!(event.token_usage.is_some_and(|u| u.estimated));
}

#[test]
fn seat_count_must_match_roles() {
    let (model, _) = scripted("solo", Vec::new());
    let game = Relay {
        seats: 2,
        win_after: None,
    };
    assert!(GameMaster::new(game, &[model], fast_config()).is_err());
}

#[test]
fn game_without_roles_is_rejected() {
    let game = Relay {
        seats: 0,
        win_after: None,
    };
    let kind = GameMaster::new(game, &[], fast_config()).err().map(|e| e.kind);
    assert!(matches!(kind, Some(MasterErrorKind::Setup(_))));
}

/// Refuses requests that do not fit a 300-token window, like a real adapter.
#[derive(Debug)]
struct SmallWindow;

#[async_trait::async_trait]
impl Backend for SmallWindow {
    fn provider(&self) -> Provider {
        Provider::Scripted
    }

    async fn generate(
        &self,
        messages: &[Message],
        params: &GenerationParams,
    ) -> Result<RawResponse, BackendError> {
        check_context_window(messages, params.max_tokens, 300)?;
        Ok(RawResponse {
            text: "SAY: w".to_string(),
            token_usage: TokenUsage::default(),
            finish_reason: FinishReason::Stop,
        })
    }
}

#[tokio::test]
async fn long_episodes_truncate_to_the_model_window() {
    let small = Arc::new(ResolvedModel::new(
        ModelSpec::new("small", Provider::Scripted, 300),
        Arc::new(SmallWindow),
    ));
    let game = Relay {
        seats: 1,
        win_after: None,
    };

    let master = GameMaster::new(game, &[small], fast_config().with_max_turns(40)).unwrap();
    let (result, transcript) = master.run().await.unwrap();

    assert_eq!(result.status, EpisodeStatus::Loss);
    assert_eq!(result.aborted_reason, Some(EndReason::Exhausted));
    assert_eq!(transcript.events.len(), 40);
    assert!(transcript.events.iter().all(|e| e.outcome_flag == OutcomeFlag::Valid));
    for event in &transcript.events {
        let sent = &event.request_context_snapshot;
        let tokens: usize = sent.iter().map(|m| estimate_message_tokens(&m.content)).sum();
        assert!(tokens + 100 <= 300);
        assert_eq!(sent[0].role, Role::System);
    }
    let last = &transcript.events[39].request_context_snapshot;
    assert_eq!(last.last().map(|m| m.content.as_str()), Some("Word 40?"));
}

/// Single-seat game whose `MARK` action holds a map that JSON cannot encode.
#[derive(Debug, Clone)]
struct Marks;

#[derive(Debug, Clone, Serialize)]
struct Marked {
    cells: HashMap<(u8, u8), u8>,
}

impl GameDefinition for Marks {
    type State = usize;
    type Action = Marked;

    fn name(&self) -> &str {
        "marks"
    }

    fn roles(&self) -> Vec<GameRole> {
        vec![GameRole::new("marker", "Answer SAY or MARK.")]
    }

    fn initial_state(&self) -> usize {
        0
    }

    fn prompt(&self, state: &usize, _player: usize) -> String {
        format!("Move {}?", state + 1)
    }

    fn parse(&self, raw: &str, _state: &usize, _player: usize) -> Result<Marked, Violation> {
        let mut cells = HashMap::new();
        match raw {
            "SAY" => {}
            "MARK" => {
                cells.insert((0, 0), 1);
            }
            _ => return Err(Violation::parse("expected SAY or MARK")),
        }
        Ok(Marked { cells })
    }

    fn apply(&self, _action: Marked, state: &usize, _player: usize) -> Transition<usize> {
        Transition::proceed(state + 1)
    }
}

#[tokio::test]
async fn engine_failure_keeps_partial_transcript() {
    let (model, _) = scripted(
        "marker",
        vec![
            ScriptedReply::text("SAY"),
            ScriptedReply::text("SAY"),
            ScriptedReply::text("MARK"),
        ],
    );
    let log = Arc::new(Log::default());

    let master = GameMaster::new(Marks, &[model], fast_config())
        .unwrap()
        .with_callbacks(CallbackList::new().with(log.clone()));
    let (result, transcript) = master.run().await.unwrap();

    assert_eq!(result.status, EpisodeStatus::Error);
    assert_eq!(result.aborted_reason, Some(EndReason::EngineFailure));
    assert_eq!(result.turn_count, 3);
    assert!(result.detail.as_deref().is_some_and(|d| d.contains("key must be a string")));
    assert_eq!(transcript.result, Some(result));
    assert_eq!(transcript.events.len(), 2);
    assert!(transcript.events.iter().all(|e| e.outcome_flag == OutcomeFlag::Valid));
    assert_eq!(log.0.lock().unwrap().last().map(String::as_str), Some("end 2"));
}

/// Relay that opens every round with an announcement and rewards each word.
#[derive(Debug, Clone)]
struct Announced(Relay);

impl GameDefinition for Announced {
    type State = RelayState;
    type Action = Word;

    fn name(&self) -> &str {
        self.0.name()
    }

    fn roles(&self) -> Vec<GameRole> {
        self.0.roles()
    }

    fn initial_state(&self) -> RelayState {
        self.0.initial_state()
    }

    fn prompt(&self, state: &RelayState, player: usize) -> String {
        self.0.prompt(state, player)
    }

    fn parse(&self, raw: &str, state: &RelayState, player: usize) -> Result<Word, Violation> {
        self.0.parse(raw, state, player)
    }

    fn apply(&self, action: Word, state: &RelayState, player: usize) -> Transition<RelayState> {
        self.0.apply(action, state, player).with_reward(0.5)
    }

    fn on_round_start(&self, _state: &RelayState, round: usize) -> Vec<Broadcast> {
        (0..self.0.seats)
            .map(|to| Broadcast::new(to, format!("Round {} begins.", round + 1)))
            .collect()
    }
}

#[tokio::test]
async fn rounds_advance_when_play_returns_to_first_seat() {
    let (first, first_backend) = scripted(
        "alpha",
        vec![
            ScriptedReply::text("SAY: a"),
            ScriptedReply::text("SAY: c"),
            ScriptedReply::text("SAY: e"),
        ],
    );
    let (second, second_backend) = scripted(
        "beta",
        vec![ScriptedReply::text("SAY: b"), ScriptedReply::text("SAY: d")],
    );
    let game = Announced(Relay {
        seats: 2,
        win_after: Some(5),
    });
    let log = Arc::new(Log::default());

    let master = GameMaster::new(game, &[first, second], fast_config())
        .unwrap()
        .with_callbacks(CallbackList::new().with(log.clone()));
    let (result, transcript) = master.run().await.unwrap();

    assert_eq!(result.status, EpisodeStatus::Success);
    let rounds: Vec<_> = transcript.events.iter().map(|e| e.round).collect();
    assert_eq!(rounds, [0, 0, 1, 1, 2]);
    assert_eq!(
        *log.0.lock().unwrap(),
        [
            "round start 0",
            "round end 0",
            "round start 1",
            "round end 1",
            "round start 2",
            "end 5",
        ]
    );

    let heard = &second_backend.requests().await[0];
    assert!(heard.iter().any(|m| m.content == "Round 1 begins."));
    let third_turn = &first_backend.requests().await[2];
    assert!(third_turn.iter().any(|m| m.content == "Round 3 begins."));

    assert!(transcript.events.iter().all(|e| e.reward == Some(0.5)));
    assert_eq!(EpisodeScores::from_transcript(&transcript).total_reward, 2.5);
}
