//! Running many episodes through the harness.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use parley_bench::{
    CallbackList, EpisodeCallback, EpisodeConfig, EpisodePlan, EpisodeReport, EpisodeStatus,
    Harness, ModelRegistry, ModelSpec, NumberGuess, ProgrammaticBackend, Provider, ResolvedModel,
    Transcript, TranscriptWriter,
};

fn registry(calls: Arc<AtomicUsize>) -> ModelRegistry {
    let oracle = ProgrammaticBackend::new("oracle", move |_| {
        calls.fetch_add(1, Ordering::SeqCst);
        "GUESS: 42".to_string()
    });
    let mut registry = ModelRegistry::new();
    registry
        .register(
            ResolvedModel::new(
                ModelSpec::new("oracle", Provider::Programmatic, 4096),
                Arc::new(oracle),
            )
            .with_alias("o"),
        )
        .unwrap();
    registry
}

#[derive(Debug, Default)]
struct Boundaries(Mutex<Vec<String>>);

impl EpisodeCallback for Boundaries {
    fn on_run_start(&self, run_id: &str) {
        self.0.lock().unwrap().push(format!("start {run_id}"));
    }

    fn on_episode_end(&self, transcript: &Transcript) {
        self.0.lock().unwrap().push(transcript.episode_id.clone());
    }

    fn on_run_end(&self, run_id: &str) {
        self.0.lock().unwrap().push(format!("end {run_id}"));
    }
}

#[tokio::test]
async fn runs_plans_concurrently_in_plan_order() {
    let calls = Arc::new(AtomicUsize::new(0));
    let dir = tempfile::tempdir().unwrap();
    let boundaries = Arc::new(Boundaries::default());
    let callbacks = CallbackList::new()
        .with(Arc::new(TranscriptWriter::new(dir.path())))
        .with(boundaries.clone());

    let harness = Harness::new(
        Arc::new(registry(Arc::clone(&calls))),
        EpisodeConfig::default(),
        "run-7",
    )
    .with_max_concurrent(2)
    .with_callbacks(callbacks);

    let mut plans: Vec<_> = (0..5)
        .map(|i| EpisodePlan::new(format!("episode_{i}"), vec!["o".to_string()]))
        .collect();
    plans.insert(2, EpisodePlan::new("missing", vec!["nobody".to_string()]));

    let report = harness.run_all(NumberGuess::default(), plans).await;

    assert_eq!(report.run_id, "run-7");
    assert_eq!(report.episodes.len(), 6);
    assert_eq!(report.completed(), 5);
    assert_eq!(report.errored(), 1);
    assert_eq!(report.aborted(), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 5);

    let ids: Vec<_> = report
        .episodes
        .iter()
        .map(|e| match e {
            EpisodeReport::Finished { transcript, .. } => transcript.episode_id.clone(),
            EpisodeReport::Failed { episode_id, .. } => episode_id.clone(),
        })
        .collect();
    assert_eq!(
        ids,
        ["episode_0", "episode_1", "missing", "episode_2", "episode_3", "episode_4"]
    );
    assert!(matches!(
        &report.episodes[2],
        EpisodeReport::Failed { reason, .. } if reason.contains("nobody")
    ));

    for i in 0..5 {
        let path = dir
            .path()
            .join("run-7")
            .join("guess")
            .join(format!("episode_{i}.json"));
        let transcript = Transcript::read_from(&path).unwrap();
        let result = transcript.result.unwrap();
        assert_eq!(result.status, EpisodeStatus::Success);
        assert_eq!(result.turn_count, 1);
        assert_eq!(transcript.players[0].model, "oracle");
        assert_eq!(transcript.run_id, "run-7");
    }
    assert!(!dir.path().join("run-7").join("guess").join("missing.json").exists());

    let log = boundaries.0.lock().unwrap();
    assert_eq!(log.first().map(String::as_str), Some("start run-7"));
    assert_eq!(log.last().map(String::as_str), Some("end run-7"));
    assert_eq!(log.len(), 7);
}

#[tokio::test]
async fn cancelled_run_aborts_every_episode() {
    let calls = Arc::new(AtomicUsize::new(0));
    let harness = Harness::new(
        Arc::new(registry(Arc::clone(&calls))),
        EpisodeConfig::default(),
        "cancelled",
    );
    harness.cancel_handle().cancel();

    let plans = (0..3)
        .map(|i| EpisodePlan::new(format!("episode_{i}"), vec!["oracle".to_string()]))
        .collect();
    let report = harness.run_all(NumberGuess::default(), plans).await;

    assert_eq!(report.aborted(), 3);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn wrong_seat_count_fails_the_episode_only() {
    let calls = Arc::new(AtomicUsize::new(0));
    let harness = Harness::new(
        Arc::new(registry(Arc::clone(&calls))),
        EpisodeConfig::default(),
        "seats",
    );
    let plans = vec![
        EpisodePlan::new("two", vec!["oracle".to_string(), "oracle".to_string()]),
        EpisodePlan::new("one", vec!["oracle".to_string()]),
    ];

    let report = harness.run_all(NumberGuess::default(), plans).await;

    assert!(matches!(report.episodes[0], EpisodeReport::Failed { .. }));
    assert_eq!(
        report.episodes[1].result().map(|r| r.status),
        Some(EpisodeStatus::Success)
    );
}
