//! Drives synthesis of every planned chunk.
//!
//! A single control loop owns all chunk state and the checkpoint. Workers only
//! perform the network call, the quality inspection and the audio write, then
//! hand an outcome back through a `JoinSet`. The loop never waits on one
//! particular chunk: it reacts to whichever of (worker finished, retry delay
//! elapsed, stop requested) happens first.

use crate::config::GenerationConfig;
use crate::error::{AudioError, GenerationError, SynthesisError};
use crate::models::{Chapter, ChapterArtifact, ChapterSummary, ChunkKey, ChunkStatus, ProgressEvent};
use crate::services::audio::{write_wav, AudioBuffer};
use crate::services::checkpoint::{CheckpointStore, GenerationState};
use crate::services::quality::{QualityAnalyzer, QualityReport};
use crate::services::synthesis::{SynthesisService, VoiceSettings};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

const PROGRESS_CAPACITY: usize = 1024;

/// Shared stop signal. Stopping halts dispatch; in-flight calls drain.
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for StopHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl StopHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    /// Stopped on request with work left; resumable from the checkpoint.
    Paused,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub state: GenerationState,
    pub summaries: Vec<ChapterSummary>,
    /// Chunks synthesized during this run (resumed successes excluded).
    pub synthesized: usize,
}

enum Attempt {
    Stored(PathBuf),
    Rejected(QualityReport),
    Failed(SynthesisError),
    StoreFailed(AudioError),
}

pub struct Orchestrator {
    synthesizer: Arc<dyn SynthesisService>,
    analyzer: QualityAnalyzer,
    voice: VoiceSettings,
    generation: GenerationConfig,
    chunk_dir: PathBuf,
    store: CheckpointStore,
    progress: broadcast::Sender<ProgressEvent>,
}

impl Orchestrator {
    pub fn new(
        synthesizer: Arc<dyn SynthesisService>,
        analyzer: QualityAnalyzer,
        voice: VoiceSettings,
        generation: GenerationConfig,
        chunk_dir: PathBuf,
        store: CheckpointStore,
    ) -> Self {
        let (progress, _) = broadcast::channel(PROGRESS_CAPACITY);
        Self {
            synthesizer,
            analyzer,
            voice,
            generation,
            chunk_dir,
            store,
            progress,
        }
    }

    /// Progress stream of `(chunk, status, attempts)` transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.progress.subscribe()
    }

    /// Load the checkpoint (if any) into freshly planned chapters without
    /// running anything.
    pub async fn restore(&self, chapters: &mut [Chapter]) -> Result<Option<GenerationState>, GenerationError> {
        let state = self.store.load().await?;
        if let Some(state) = &state {
            state.apply_to(chapters);
        }
        Ok(state)
    }

    /// Persist that `chapter` was assembled into `artifact`. Its chunk files
    /// may be purged once this returns.
    pub async fn record_assembly(
        &self,
        state: &mut GenerationState,
        chapter: &Chapter,
        artifact: &ChapterArtifact,
    ) -> Result<(), GenerationError> {
        state.record_chapter(chapter, artifact);
        self.store.save(state).await?;
        Ok(())
    }

    pub async fn reset(&self) -> Result<bool, GenerationError> {
        Ok(self.store.reset().await?)
    }

    /// Synthesize every chunk of `chapters` that is not already done.
    pub async fn run(&self, chapters: &mut [Chapter], stop: &StopHandle) -> Result<RunReport, GenerationError> {
        let mut state = match self.store.load().await? {
            Some(previous) => {
                let stats = previous.apply_to(chapters);
                info!(
                    run_id = %previous.run_id,
                    reused = stats.reused,
                    requeued = stats.requeued,
                    stale = stats.stale,
                    "Resuming from checkpoint"
                );
                previous
            }
            None => GenerationState::new(),
        };

        let mut positions = HashMap::new();
        let mut pending = VecDeque::new();
        for (ci, chapter) in chapters.iter_mut().enumerate() {
            for (ki, chunk) in chapter.chunks.iter_mut().enumerate() {
                positions.insert(chunk.key(), (ci, ki));
                if !chunk.is_done() {
                    if chunk.status == ChunkStatus::Failed {
                        chunk.attempts = 0;
                    }
                    chunk.status = ChunkStatus::Pending;
                    chunk.audio_path = None;
                    pending.push_back(chunk.key());
                }
            }
        }
        state.sync_plan(chapters);
        self.store.save(&state).await?;

        let concurrency = self.generation.concurrency.max(1);
        info!(pending = pending.len(), concurrency, "Starting generation");

        let mut stop_rx = stop.subscribe();
        let mut stop_closed = false;
        let mut workers: JoinSet<(ChunkKey, Attempt)> = JoinSet::new();
        let mut delayed: Vec<(Instant, ChunkKey)> = Vec::new();
        let mut synthesized = 0;

        loop {
            let stopped = *stop_rx.borrow();

            let now = Instant::now();
            delayed.retain(|(due, key)| {
                if *due <= now {
                    pending.push_back(*key);
                    false
                } else {
                    true
                }
            });

            while !stopped && workers.len() < concurrency {
                let Some(key) = pending.pop_front() else {
                    break;
                };
                let Some(&(ci, ki)) = positions.get(&key) else {
                    continue;
                };
                let chunk = &mut chapters[ci].chunks[ki];
                chunk.status = ChunkStatus::InFlight;
                chunk.attempts += 1;
                state.record(chunk, None);
                self.store.save(&state).await?;
                self.emit(chunk.key(), chunk.status, chunk.attempts);
                debug!(chunk = %key, attempt = chunk.attempts, "Dispatching chunk");

                workers.spawn(attempt(
                    self.synthesizer.clone(),
                    self.analyzer.clone(),
                    self.voice.clone(),
                    self.generation.request_timeout(),
                    key,
                    chunk.text.clone(),
                    chunk_path(&self.chunk_dir, key),
                ));
            }

            if workers.is_empty() && (stopped || (pending.is_empty() && delayed.is_empty())) {
                break;
            }

            let next_retry = delayed.iter().map(|(due, _)| *due).min();
            tokio::select! {
                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    let (key, outcome) = match joined {
                        Ok(done) => done,
                        Err(e) => {
                            let err = GenerationError::Worker(e.to_string());
                            return Err(self.abort(&mut workers, chapters, &mut state, err).await);
                        }
                    };
                    let Some(&(ci, ki)) = positions.get(&key) else {
                        continue;
                    };
                    match outcome {
                        Attempt::Stored(path) => {
                            let chunk = &mut chapters[ci].chunks[ki];
                            chunk.status = ChunkStatus::Succeeded;
                            chunk.audio_path = Some(path);
                            synthesized += 1;
                            info!(chunk = %key, attempts = chunk.attempts, "Chunk succeeded");
                            state.record(chunk, None);
                            self.store.save(&state).await?;
                            self.emit(key, chunk.status, chunk.attempts);
                        }
                        Attempt::Rejected(report) => {
                            let chunk = &mut chapters[ci].chunks[ki];
                            let reason = format!("quality rejected: {}", report.describe());
                            warn!(chunk = %key, attempt = chunk.attempts, %reason, "Quality gate rejected chunk");
                            self.emit(key, ChunkStatus::QualityRejected, chunk.attempts);
                            if chunk.attempts >= self.generation.max_attempts {
                                chunk.status = ChunkStatus::Failed;
                                error!(chunk = %key, attempts = chunk.attempts, "Chunk exhausted its retry budget");
                            } else {
                                chunk.status = ChunkStatus::Pending;
                                pending.push_back(key);
                            }
                            state.record(chunk, Some(reason));
                            self.store.save(&state).await?;
                            self.emit(key, chunk.status, chunk.attempts);
                        }
                        Attempt::Failed(err) if !err.is_transient() => {
                            let chunk = &mut chapters[ci].chunks[ki];
                            chunk.status = ChunkStatus::Failed;
                            error!(chunk = %key, error = %err, "Fatal synthesis error, aborting run");
                            state.record(chunk, Some(err.to_string()));
                            self.emit(key, chunk.status, chunk.attempts);
                            let fatal = GenerationError::Fatal { chunk: key, source: err };
                            return Err(self.abort(&mut workers, chapters, &mut state, fatal).await);
                        }
                        Attempt::Failed(err) => {
                            let chunk = &mut chapters[ci].chunks[ki];
                            if chunk.attempts >= self.generation.max_attempts {
                                chunk.status = ChunkStatus::Failed;
                                error!(chunk = %key, attempts = chunk.attempts, error = %err, "Chunk exhausted its retry budget");
                            } else {
                                let delay = match &err {
                                    SynthesisError::RateLimited { retry_after: Some(after) } => *after,
                                    _ => self.generation.backoff(chunk.attempts),
                                };
                                warn!(chunk = %key, attempt = chunk.attempts, error = %err, ?delay, "Transient failure, retrying");
                                chunk.status = ChunkStatus::Pending;
                                delayed.push((Instant::now() + delay, key));
                            }
                            state.record(chunk, Some(err.to_string()));
                            self.store.save(&state).await?;
                            self.emit(key, chunk.status, chunk.attempts);
                        }
                        Attempt::StoreFailed(source) => {
                            let chunk = &mut chapters[ci].chunks[ki];
                            chunk.status = ChunkStatus::Pending;
                            let err = GenerationError::Artifact { chunk: key, source };
                            return Err(self.abort(&mut workers, chapters, &mut state, err).await);
                        }
                    }
                }
                _ = tokio::time::sleep_until(next_retry.unwrap_or_else(Instant::now)), if next_retry.is_some() => {}
                changed = stop_rx.changed(), if !stopped && !stop_closed => {
                    if changed.is_err() {
                        stop_closed = true;
                    } else {
                        info!(in_flight = workers.len(), "Stop requested, draining in-flight chunks");
                    }
                }
            }
        }

        let unfinished = chapters
            .iter()
            .flat_map(|c| c.chunks.iter())
            .any(|c| c.status == ChunkStatus::Pending);
        let outcome = if unfinished {
            RunOutcome::Paused
        } else {
            RunOutcome::Completed
        };
        state.sync_plan(chapters);
        self.store.save(&state).await?;
        info!(?outcome, synthesized, "Generation finished");

        Ok(RunReport {
            outcome,
            state,
            summaries: chapters.iter().map(Chapter::summary).collect(),
            synthesized,
        })
    }

    /// Cancel outstanding workers and leave a resumable checkpoint behind.
    async fn abort(
        &self,
        workers: &mut JoinSet<(ChunkKey, Attempt)>,
        chapters: &mut [Chapter],
        state: &mut GenerationState,
        err: GenerationError,
    ) -> GenerationError {
        workers.shutdown().await;
        for chunk in chapters.iter_mut().flat_map(|c| c.chunks.iter_mut()) {
            if chunk.status == ChunkStatus::InFlight {
                chunk.status = ChunkStatus::Pending;
                chunk.audio_path = None;
                self.emit(chunk.key(), chunk.status, chunk.attempts);
            }
        }
        state.sync_plan(chapters);
        match self.store.save(state).await {
            Ok(()) => err,
            Err(save_err) => {
                error!(error = %err, "Checkpoint could not be saved while aborting");
                GenerationError::Checkpoint(save_err)
            }
        }
    }

    fn emit(&self, chunk: ChunkKey, status: ChunkStatus, attempts: u32) {
        // No subscribers is fine.
        let _ = self.progress.send(ProgressEvent {
            chunk,
            status,
            attempts,
        });
    }
}

pub fn chunk_path(chunk_dir: &Path, key: ChunkKey) -> PathBuf {
    chunk_dir
        .join(format!("chapter_{:03}", key.chapter))
        .join(format!("chunk_{:04}.wav", key.index))
}

async fn attempt(
    synthesizer: Arc<dyn SynthesisService>,
    analyzer: QualityAnalyzer,
    voice: VoiceSettings,
    timeout: Duration,
    key: ChunkKey,
    text: String,
    path: PathBuf,
) -> (ChunkKey, Attempt) {
    let audio = match tokio::time::timeout(timeout, synthesizer.synthesize(&text, &voice)).await {
        Ok(Ok(audio)) => audio,
        Ok(Err(e)) => return (key, Attempt::Failed(e)),
        Err(_) => return (key, Attempt::Failed(SynthesisError::Timeout(timeout))),
    };

    let report = analyzer.inspect(&audio, &text);
    if !report.passed {
        return (key, Attempt::Rejected(report));
    }

    (key, store(path, audio).await)
}

async fn store(path: PathBuf, audio: AudioBuffer) -> Attempt {
    let written = tokio::task::spawn_blocking(move || write_wav(&path, &audio).map(|()| path)).await;
    match written {
        Ok(Ok(path)) => Attempt::Stored(path),
        Ok(Err(e)) => Attempt::StoreFailed(e),
        Err(e) => Attempt::StoreFailed(AudioError::Io(std::io::Error::other(e.to_string()))),
    }
}
