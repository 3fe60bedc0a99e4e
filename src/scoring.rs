//! Episode metrics derived from transcripts.

use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::recorder::{EpisodeStatus, OutcomeFlag, Transcript};

/// Metrics of one episode.
///
/// The three outcome flags are mutually exclusive 0/1 values; an episode
/// that ended on a provider error counts as aborted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EpisodeScores {
    /// 1 if the episode was aborted or errored.
    pub aborted: u8,
    /// 1 if the episode was won.
    pub success: u8,
    /// 1 if the episode was lost, drawn or exhausted.
    pub lose: u8,
    /// Turns started.
    pub turns: usize,
    /// Requests that reached the game's parser.
    pub request_count: usize,
    /// Requests parsed and applied.
    pub parsed_request_count: usize,
    /// Requests rejected by the game.
    pub violated_request_count: usize,
    /// Provider calls that failed.
    pub provider_error_count: usize,
    /// Prompt tokens over all calls.
    pub prompt_tokens: u64,
    /// Completion tokens over all calls.
    pub completion_tokens: u64,
    /// Sum of the rewards the game assigned to applied actions.
    pub total_reward: f64,
}

impl EpisodeScores {
    /// Reduces a transcript. Unfinished transcripts score as aborted.
    #[instrument(skip(transcript), fields(episode = %transcript.episode_id))]
    pub fn from_transcript(transcript: &Transcript) -> Self {
        let mut scores = Self::default();
        for event in &transcript.events {
            match event.outcome_flag {
                OutcomeFlag::Valid => {
                    scores.request_count += 1;
                    scores.parsed_request_count += 1;
                }
                flag if flag.is_violation() => {
                    scores.request_count += 1;
                    scores.violated_request_count += 1;
                }
                OutcomeFlag::Cancelled => {}
                _ => scores.provider_error_count += 1,
            }
            if let Some(reward) = event.reward {
                scores.total_reward += reward;
            }
            if let Some(usage) = event.token_usage {
                scores.prompt_tokens += u64::from(usage.prompt_tokens);
                scores.completion_tokens += u64::from(usage.completion_tokens);
            }
        }

        match &transcript.result {
            Some(result) => {
                scores.turns = result.turn_count;
                match result.status {
                    EpisodeStatus::Success => scores.success = 1,
                    EpisodeStatus::Loss => scores.lose = 1,
                    EpisodeStatus::Aborted | EpisodeStatus::Error => scores.aborted = 1,
                }
            }
            None => scores.aborted = 1,
        }
        scores
    }

    /// Fraction of requests the game accepted, if any were made.
    pub fn request_success_ratio(&self) -> Option<f64> {
        (self.request_count > 0)
            .then(|| self.parsed_request_count as f64 / self.request_count as f64)
    }
}

/// Aggregate over many episodes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreSummary {
    /// Episodes scored.
    pub episodes: usize,
    /// Percentage of episodes played to a game decision.
    pub played_percent: f64,
    /// Percentage of played episodes that were won.
    pub quality_score: Option<f64>,
    /// Mean turns per episode.
    pub mean_turns: f64,
    /// Tokens over all episodes.
    pub total_tokens: u64,
    /// Mean reward per episode.
    pub mean_reward: f64,
}

impl ScoreSummary {
    /// Aggregates episode scores.
    pub fn from_scores(scores: &[EpisodeScores]) -> Self {
        if scores.is_empty() {
            return Self::default();
        }
        let episodes = scores.len();
        let played = scores.iter().filter(|s| s.aborted == 0).count();
        let won = scores.iter().filter(|s| s.success == 1).count();
        let turns: usize = scores.iter().map(|s| s.turns).sum();
        Self {
            episodes,
            played_percent: 100.0 * played as f64 / episodes as f64,
            quality_score: (played > 0).then(|| 100.0 * won as f64 / played as f64),
            mean_turns: turns as f64 / episodes as f64,
            total_tokens: scores
                .iter()
                .map(|s| s.prompt_tokens + s.completion_tokens)
                .sum(),
            mean_reward: scores.iter().map(|s| s.total_reward).sum::<f64>() / episodes as f64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{BackendErrorKind, TokenUsage};
    use crate::game::ContinuationSignal;
    use crate::recorder::{EndReason, EpisodeResult, TranscriptEvent};

    fn transcript(result: Option<EpisodeResult>) -> Transcript {
        let usage = TokenUsage {
            prompt_tokens: 10,
            completion_tokens: 2,
            estimated: true,
        };
        Transcript {
            run_id: "r".to_string(),
            episode_id: "e".to_string(),
            game: "guess".to_string(),
            players: Vec::new(),
            events: vec![
                TranscriptEvent::new(0, 1, "Player 1", Vec::new(), OutcomeFlag::TransientError)
                    .with_error(BackendErrorKind::Transient("timeout".to_string())),
                TranscriptEvent::new(0, 2, "Player 1", Vec::new(), OutcomeFlag::ParseFailure)
                    .with_token_usage(usage),
                TranscriptEvent::new(0, 3, "Player 1", Vec::new(), OutcomeFlag::Valid)
                    .with_token_usage(usage),
            ],
            result,
        }
    }

    #[test]
    fn counts_requests_and_tokens() {
        let scores = EpisodeScores::from_transcript(&transcript(Some(
            EpisodeResult::from_signal(ContinuationSignal::Win, 1),
        )));
        assert_eq!(scores.success, 1);
        assert_eq!(scores.request_count, 2);
        assert_eq!(scores.parsed_request_count, 1);
        assert_eq!(scores.violated_request_count, 1);
        assert_eq!(scores.provider_error_count, 1);
        assert_eq!(scores.prompt_tokens, 20);
        assert_eq!(scores.request_success_ratio(), Some(0.5));
    }

    #[test]
    fn unfinished_episode_scores_as_aborted() {
        let scores = EpisodeScores::from_transcript(&transcript(None));
        assert_eq!((scores.aborted, scores.success, scores.lose), (1, 0, 0));
    }

    #[test]
    fn summary_quality_ignores_aborted() {
        let won = EpisodeScores::from_transcript(&transcript(Some(EpisodeResult::from_signal(
            ContinuationSignal::Win,
            1,
        ))));
        let lost = EpisodeScores::from_transcript(&transcript(Some(EpisodeResult::ended(
            EpisodeStatus::Loss,
            5,
            EndReason::Exhausted,
        ))));
        let aborted = EpisodeScores::from_transcript(&transcript(None));

        let summary = ScoreSummary::from_scores(&[won, lost, aborted]);

        assert_eq!(summary.episodes, 3);
        assert!((summary.played_percent - 200.0 / 3.0).abs() < 1e-9);
        assert_eq!(summary.quality_score, Some(50.0));
        assert_eq!(summary.mean_turns, 2.0);
    }

    #[test]
    fn rewards_are_summed_and_cancelled_replies_are_not_requests() {
        let mut t = transcript(Some(EpisodeResult::ended(
            EpisodeStatus::Aborted,
            2,
            EndReason::Cancelled,
        )));
        t.events[2].reward = Some(0.5);
        t.events.push(
            TranscriptEvent::new(1, 1, "Player 1", Vec::new(), OutcomeFlag::Valid)
                .with_reward(1.0),
        );
        t.events.push(TranscriptEvent::new(
            2,
            1,
            "Player 1",
            Vec::new(),
            OutcomeFlag::Cancelled,
        ));

        let scores = EpisodeScores::from_transcript(&t);

        assert_eq!(scores.total_reward, 1.5);
        assert_eq!(scores.request_count, 3);
        assert_eq!(scores.provider_error_count, 1);
        assert_eq!(ScoreSummary::from_scores(&[scores]).mean_reward, 1.5);
    }
}
