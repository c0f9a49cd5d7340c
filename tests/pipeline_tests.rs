use async_trait::async_trait;
use audiobook_pipeline::config::PipelineConfig;
use audiobook_pipeline::error::{AssemblyError, GenerationError, PipelineError, SynthesisError};
use audiobook_pipeline::models::{ChunkKey, ChunkStatus};
use audiobook_pipeline::services::assembler::assemble_chapter;
use audiobook_pipeline::services::audio::AudioBuffer;
use audiobook_pipeline::services::checkpoint::CheckpointStore;
use audiobook_pipeline::services::synthesis::{SynthesisService, VoiceSettings};
use audiobook_pipeline::{AudiobookPipeline, RunOutcome, StopHandle};
use std::collections::{HashMap, VecDeque};
use std::f32::consts::PI;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

const RATE: u32 = 8_000;
const CHAPTERS: usize = 2;
const PARAGRAPHS: usize = 5;

#[derive(Debug, Clone)]
enum Scripted {
    Transient,
    RateLimited,
    Invalid,
    Silent,
    Hang,
}

/// Speech stand-in: a tone whose length follows the word count at 150 wpm.
#[derive(Default)]
struct FakeSynth {
    delay: Duration,
    script: Mutex<HashMap<String, VecDeque<Scripted>>>,
    calls: Mutex<HashMap<String, usize>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeSynth {
    fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    fn script(&self, marker: &str, steps: Vec<Scripted>) {
        self.script.lock().unwrap().insert(marker.to_string(), steps.into());
    }

    fn calls(&self, marker: &str) -> usize {
        self.calls.lock().unwrap().get(marker).copied().unwrap_or(0)
    }

    fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }
}

fn marker_of(text: &str) -> String {
    text.split_whitespace()
        .find(|w| w.starts_with("zeta"))
        .unwrap_or_default()
        .to_string()
}

fn tone(text: &str) -> AudioBuffer {
    let secs = text.split_whitespace().count() as f64 / 150.0 * 60.0;
    let frames = (secs * RATE as f64) as usize;
    let samples = (0..frames)
        .map(|i| 0.5 * (2.0 * PI * 220.0 * i as f32 / RATE as f32).sin())
        .collect();
    AudioBuffer::new(RATE, 1, samples)
}

#[async_trait]
impl SynthesisService for FakeSynth {
    async fn synthesize(&self, text: &str, _voice: &VoiceSettings) -> Result<AudioBuffer, SynthesisError> {
        let marker = marker_of(text);
        *self.calls.lock().unwrap().entry(marker.clone()).or_default() += 1;
        let step = self
            .script
            .lock()
            .unwrap()
            .get_mut(&marker)
            .and_then(|steps| steps.pop_front());

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if matches!(step, Some(Scripted::Hang)) {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match step {
            None | Some(Scripted::Hang) => Ok(tone(text)),
            Some(Scripted::Transient) => Err(SynthesisError::Transient("503 from upstream".into())),
            Some(Scripted::RateLimited) => Err(SynthesisError::RateLimited {
                retry_after: Some(Duration::from_millis(5)),
            }),
            Some(Scripted::Invalid) => Err(SynthesisError::Invalid("bad api key".into())),
            Some(Scripted::Silent) => {
                let audio = tone(text);
                Ok(AudioBuffer::new(RATE, 1, vec![0.0; audio.samples.len()]))
            }
        }
    }
}

/// Two chapters of five one-chunk paragraphs, marked zeta00..zeta09.
fn fixture() -> (TempDir, PipelineConfig) {
    let dir = tempfile::tempdir().unwrap();
    let chapters = dir.path().join("chapters");
    std::fs::create_dir_all(&chapters).unwrap();
    for c in 0..CHAPTERS {
        let body: Vec<String> = (0..PARAGRAPHS)
            .map(|p| format!("zeta{:02} {}", c * PARAGRAPHS + p, vec!["narration"; 10].join(" ")))
            .collect();
        std::fs::write(chapters.join(format!("chapter_{:03}.txt", c + 1)), body.join("\n\n")).unwrap();
    }

    let mut config = PipelineConfig::default();
    config.paths.chapters_dir = chapters;
    config.paths.output_dir = dir.path().join("out");
    config.planner.token_budget = 30;
    config.generation.concurrency = 2;
    config.generation.initial_delay_ms = 1;
    config.generation.max_delay_ms = 5;
    config.generation.request_timeout_secs = 1;
    config.assembly.purge_chunks = false;
    config.assembly.chunk_pause_ms = 100;
    config.assembly.chapter_pause_ms = 300;
    (dir, config)
}

fn pipeline(config: &PipelineConfig, synth: &Arc<FakeSynth>) -> AudiobookPipeline {
    AudiobookPipeline::with_services(config.clone(), synth.clone(), None)
}

fn book_bytes(config: &PipelineConfig) -> Vec<u8> {
    std::fs::read(config.paths.output_dir.join("complete_audiobook.wav")).unwrap()
}

fn key(marker: usize) -> ChunkKey {
    ChunkKey::new(marker / PARAGRAPHS, marker % PARAGRAPHS)
}

async fn clean_book() -> Vec<u8> {
    let (_dir, config) = fixture();
    let synth = Arc::new(FakeSynth::default());
    pipeline(&config, &synth).generate(&StopHandle::new()).await.unwrap();
    book_bytes(&config)
}

#[tokio::test]
async fn uninterrupted_run_assembles_everything() {
    let (_dir, config) = fixture();
    let synth = Arc::new(FakeSynth::default());
    let report = pipeline(&config, &synth).generate(&StopHandle::new()).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.synthesized, CHAPTERS * PARAGRAPHS);
    assert_eq!(report.chapters.len(), CHAPTERS);
    assert!(report.incomplete.is_empty());
    let book = report.book.expect("book artifact");
    // Ten 4.4 s chunks, eight chunk pauses and one chapter pause.
    assert!((book.duration_secs - (44.0 + 0.8 + 0.3)).abs() < 0.01);
    assert_eq!(synth.total_calls(), CHAPTERS * PARAGRAPHS);

    let state = CheckpointStore::new(config.paths.checkpoint_path()).load().await.unwrap().unwrap();
    assert_eq!(state.count(ChunkStatus::Succeeded), CHAPTERS * PARAGRAPHS);
}

#[tokio::test]
async fn in_flight_calls_never_exceed_the_limit() {
    let (_dir, mut config) = fixture();
    config.generation.concurrency = 3;
    let synth = Arc::new(FakeSynth::with_delay(Duration::from_millis(20)));

    let pipe = pipeline(&config, &synth);
    let mut events = pipe.subscribe();
    let report = pipe.generate(&StopHandle::new()).await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Completed);

    let mut in_flight = 0i64;
    let mut peak = 0i64;
    while let Ok(event) = events.try_recv() {
        match event.status {
            ChunkStatus::InFlight => in_flight += 1,
            _ => in_flight -= 1,
        }
        peak = peak.max(in_flight);
    }
    assert!(peak <= 3, "status stream showed {} chunks in flight", peak);
    let max = synth.max_in_flight.load(Ordering::SeqCst);
    assert!(max <= 3, "service saw {} concurrent calls", max);
    assert!(max >= 2, "expected overlapping calls, saw {}", max);
}

#[tokio::test]
async fn transient_failures_do_not_change_the_book() {
    let expected = clean_book().await;

    let (_dir, config) = fixture();
    let synth = Arc::new(FakeSynth::default());
    synth.script("zeta05", vec![Scripted::Transient, Scripted::RateLimited]);
    let report = pipeline(&config, &synth).generate(&StopHandle::new()).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(synth.calls("zeta05"), 3);
    assert_eq!(book_bytes(&config), expected);
}

#[tokio::test]
async fn timed_out_call_is_retried() {
    let (_dir, config) = fixture();
    let synth = Arc::new(FakeSynth::default());
    synth.script("zeta02", vec![Scripted::Hang]);
    let report = pipeline(&config, &synth).generate(&StopHandle::new()).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(synth.calls("zeta02"), 2);
}

#[tokio::test]
async fn repeated_quality_rejection_fails_the_chunk() {
    let (_dir, mut config) = fixture();
    config.generation.max_attempts = 3;
    let synth = Arc::new(FakeSynth::default());
    synth.script("zeta03", vec![Scripted::Silent; 10]);
    let pipe = pipeline(&config, &synth);
    let report = pipe.generate(&StopHandle::new()).await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(synth.calls("zeta03"), 3);
    assert_eq!(report.incomplete, vec![0]);
    assert_eq!(report.summaries[0].failed_chunks, vec![3]);
    assert_eq!(report.chapters.len(), 1);
    assert!(report.book.is_none());

    let state = CheckpointStore::new(config.paths.checkpoint_path()).load().await.unwrap().unwrap();
    let record = state.get(key(3)).unwrap();
    assert_eq!(record.status, ChunkStatus::Failed);
    assert!(record.last_error.as_deref().unwrap_or_default().contains("quality"));

    let mut chapters = pipe.plan().unwrap();
    state.apply_to(&mut chapters);
    let err = assemble_chapter(&chapters[0], &config.paths.output_dir, &config.assembly).unwrap_err();
    assert!(matches!(err, AssemblyError::IncompleteChapter { chapter: 0, ref missing } if missing == &vec![3]));

    let status = pipe.status().await.unwrap();
    assert_eq!(status.summaries[0].failed, 1);
}

#[tokio::test]
async fn one_rejection_then_success_is_requeued_not_failed() {
    let (_dir, config) = fixture();
    let synth = Arc::new(FakeSynth::default());
    synth.script("zeta07", vec![Scripted::Silent]);
    let report = pipeline(&config, &synth).generate(&StopHandle::new()).await.unwrap();

    assert_eq!(synth.calls("zeta07"), 2);
    assert!(report.incomplete.is_empty());
    assert!(report.book.is_some());
}

#[tokio::test]
async fn fatal_error_aborts_but_keeps_progress() {
    let (_dir, mut config) = fixture();
    config.generation.concurrency = 1;
    let synth = Arc::new(FakeSynth::default());
    synth.script("zeta03", vec![Scripted::Invalid]);

    let err = pipeline(&config, &synth).generate(&StopHandle::new()).await.unwrap_err();
    match err {
        PipelineError::Generation(GenerationError::Fatal { chunk, .. }) => assert_eq!(chunk, key(3)),
        other => panic!("expected a fatal generation error, got {:?}", other),
    }
    assert_eq!(synth.calls("zeta04"), 0);

    let state = CheckpointStore::new(config.paths.checkpoint_path()).load().await.unwrap().unwrap();
    assert_eq!(state.count(ChunkStatus::Succeeded), 3);
    assert_eq!(state.count(ChunkStatus::InFlight), 0);

    let report = pipeline(&config, &synth).generate(&StopHandle::new()).await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.synthesized, CHAPTERS * PARAGRAPHS - 3);
    assert_eq!(synth.calls("zeta00"), 1);
    assert_eq!(synth.calls("zeta03"), 2);
}

#[tokio::test]
async fn stopped_run_resumes_to_the_same_book() {
    let expected = clean_book().await;

    let (_dir, mut config) = fixture();
    config.generation.concurrency = 1;
    let synth = Arc::new(FakeSynth::with_delay(Duration::from_millis(10)));

    let first = pipeline(&config, &synth);
    let stop = StopHandle::new();
    let mut events = first.subscribe();
    let trigger = stop.clone();
    tokio::spawn(async move {
        let mut done = 0;
        while let Ok(event) = events.recv().await {
            if event.status == ChunkStatus::Succeeded {
                done += 1;
                if done == 3 {
                    trigger.stop();
                }
            }
        }
    });

    let paused = first.generate(&stop).await.unwrap();
    assert_eq!(paused.outcome, RunOutcome::Paused);
    assert!(paused.book.is_none());
    let finished_before = paused.synthesized;
    assert!((3..CHAPTERS * PARAGRAPHS).contains(&finished_before));

    let resumed = pipeline(&config, &synth).generate(&StopHandle::new()).await.unwrap();
    assert_eq!(resumed.outcome, RunOutcome::Completed);
    assert_eq!(finished_before + resumed.synthesized, CHAPTERS * PARAGRAPHS);
    for marker in 0..CHAPTERS * PARAGRAPHS {
        assert_eq!(synth.calls(&format!("zeta{:02}", marker)), 1, "chunk zeta{:02}", marker);
    }
    assert_eq!(book_bytes(&config), expected);
}

#[tokio::test]
async fn stale_audio_is_synthesized_again() {
    let (_dir, config) = fixture();
    let synth = Arc::new(FakeSynth::default());
    let stop = StopHandle::new();
    stop.stop();
    let report = pipeline(&config, &synth).generate(&stop).await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Paused);
    assert_eq!(synth.total_calls(), 0);

    pipeline(&config, &synth).generate(&StopHandle::new()).await.unwrap();
    let state = CheckpointStore::new(config.paths.checkpoint_path()).load().await.unwrap().unwrap();
    let first_chunk = state.get(key(0)).unwrap().audio_path.clone().unwrap();
    let first_chapter = state.chapters[&0].path.clone();
    std::fs::remove_file(&first_chunk).unwrap();
    std::fs::remove_file(&first_chapter).unwrap();

    let report = pipeline(&config, &synth).generate(&StopHandle::new()).await.unwrap();
    assert_eq!(synth.calls("zeta00"), 2);
    assert_eq!(synth.calls("zeta01"), 1);
    assert_eq!(synth.calls("zeta05"), 1);
    assert!(Path::new(&first_chunk).exists());
    assert!(first_chapter.exists());
    assert!(report.book.is_some());
}

#[tokio::test]
async fn missing_chunk_file_is_covered_by_its_assembled_chapter() {
    let (_dir, config) = fixture();
    let synth = Arc::new(FakeSynth::default());
    pipeline(&config, &synth).generate(&StopHandle::new()).await.unwrap();

    let state = CheckpointStore::new(config.paths.checkpoint_path()).load().await.unwrap().unwrap();
    std::fs::remove_file(state.get(key(0)).unwrap().audio_path.clone().unwrap()).unwrap();

    let report = pipeline(&config, &synth).generate(&StopHandle::new()).await.unwrap();
    assert_eq!(report.synthesized, 0);
    assert_eq!(synth.calls("zeta00"), 1);
    assert!(report.book.is_some());
}

#[tokio::test]
async fn purged_chapters_are_not_synthesized_again() {
    let expected = clean_book().await;

    let (_dir, mut config) = fixture();
    config.assembly.purge_chunks = true;
    config.generation.max_attempts = 1;
    let synth = Arc::new(FakeSynth::default());
    synth.script("zeta07", vec![Scripted::Silent]);

    let first = pipeline(&config, &synth).generate(&StopHandle::new()).await.unwrap();
    assert_eq!(first.incomplete, vec![1]);
    assert_eq!(first.chapters.len(), 1);
    assert!(first.book.is_none());
    let chunk_dir = config.paths.chunk_dir();
    assert!(!chunk_dir.join("chapter_000").join("chunk_0000.wav").exists());
    assert!(chunk_dir.join("chapter_001").join("chunk_0000.wav").exists());

    let second = pipeline(&config, &synth).generate(&StopHandle::new()).await.unwrap();
    assert_eq!(second.synthesized, 1);
    assert!(second.incomplete.is_empty());
    assert_eq!(synth.calls("zeta00"), 1);
    assert_eq!(synth.calls("zeta04"), 1);
    assert_eq!(synth.calls("zeta07"), 2);
    assert_eq!(book_bytes(&config), expected);
    assert!(!chunk_dir.join("chapter_001").join("chunk_0002.wav").exists());

    let third = pipeline(&config, &synth).generate(&StopHandle::new()).await.unwrap();
    assert_eq!(third.synthesized, 0);
    assert_eq!(synth.total_calls(), CHAPTERS * PARAGRAPHS + 1);
    assert_eq!(book_bytes(&config), expected);
}
