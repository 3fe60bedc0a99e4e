//! Rebuilding scripted players from a recorded transcript.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, instrument};

use crate::backends::{ScriptedBackend, ScriptedReply};
use crate::recorder::Transcript;
use crate::registry::{ModelSpec, ResolvedModel};

/// Per-seat replies recovered from a transcript.
///
/// Every recorded response and every recorded provider failure is queued for
/// the player that received it, in transcript order. Running the same game
/// with the same configuration against [`ReplayScript::models`] reproduces
/// the recorded events and result.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayScript {
    seats: Vec<(ModelSpec, Vec<ScriptedReply>)>,
}

impl ReplayScript {
    /// Extracts the replies of every player in `transcript`.
    #[instrument(skip(transcript), fields(episode = %transcript.episode_id, events = transcript.events.len()))]
    pub fn from_transcript(transcript: &Transcript) -> Self {
        let index: HashMap<&str, usize> = transcript
            .players
            .iter()
            .enumerate()
            .map(|(seat, p)| (p.id.as_str(), seat))
            .collect();
        let mut seats: Vec<(ModelSpec, Vec<ScriptedReply>)> = transcript
            .players
            .iter()
            .map(|p| {
                let window = p.context_window_tokens.unwrap_or(usize::MAX);
                let mut spec = ModelSpec::new(p.model.clone(), p.provider, window);
                if let Some(generation) = p.generation {
                    spec.generation = generation;
                }
                (spec, Vec::new())
            })
            .collect();

        for event in &transcript.events {
            let Some(&seat) = index.get(event.player_id.as_str()) else {
                continue;
            };
            let reply = match (&event.raw_response, &event.error) {
                (Some(text), _) => ScriptedReply::text(text.clone()),
                (None, Some(kind)) => ScriptedReply::Error(kind.clone()),
                (None, None) => continue,
            };
            seats[seat].1.push(reply);
        }
        debug!(seats = seats.len(), "Replay script built");
        Self { seats }
    }

    /// Returns the queued replies of `seat`.
    pub fn replies(&self, seat: usize) -> &[ScriptedReply] {
        self.seats.get(seat).map(|(_, r)| r.as_slice()).unwrap_or_default()
    }

    /// Builds one scripted model per seat, named after the recorded model.
    pub fn models(&self) -> Vec<Arc<ResolvedModel>> {
        self.seats
            .iter()
            .map(|(spec, replies)| {
                Arc::new(ResolvedModel::new(
                    spec.clone(),
                    Arc::new(ScriptedBackend::new(replies.clone())),
                ))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{BackendErrorKind, Provider};
    use crate::recorder::{OutcomeFlag, PlayerRecord, TranscriptEvent};

    #[test]
    fn replies_follow_recorded_order_per_player() {
        let players = ["Player 1", "Player 2"]
            .iter()
            .map(|id| PlayerRecord::new(*id, "r", "m", Provider::OpenAI))
            .collect();
        let events = vec![
            TranscriptEvent::new(0, 1, "Player 1", Vec::new(), OutcomeFlag::TransientError)
                .with_error(BackendErrorKind::Transient("timed out".to_string())),
            TranscriptEvent::new(0, 2, "Player 1", Vec::new(), OutcomeFlag::Valid)
                .with_raw_response("a".to_string()),
            TranscriptEvent::new(1, 1, "Player 2", Vec::new(), OutcomeFlag::ParseFailure)
                .with_raw_response("b".to_string()),
        ];
        let transcript = Transcript {
            run_id: "r".to_string(),
            episode_id: "e".to_string(),
            game: "g".to_string(),
            players,
            events,
            result: None,
        };

        let script = ReplayScript::from_transcript(&transcript);

        assert_eq!(
            script.replies(0),
            [ScriptedReply::transient("timed out"), ScriptedReply::text("a")]
        );
        assert_eq!(script.replies(1), [ScriptedReply::text("b")]);
        assert!(script.replies(2).is_empty());
        assert_eq!(script.models()[0].spec().provider, Provider::OpenAI);
    }
}
