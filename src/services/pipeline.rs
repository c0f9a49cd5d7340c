use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::models::{Artifact, Chapter, ChapterArtifact, ChapterId, ChapterSummary, ProgressEvent};
use crate::services::assembler::{assemble_book, assemble_chapter, purge_chunk_files, BOOK_FILE_NAME};
use crate::services::chapterizer::load_chapters;
use crate::services::checkpoint::CheckpointStore;
use crate::services::music::{HttpMusicClient, MusicService};
use crate::services::orchestrator::{Orchestrator, RunOutcome, StopHandle};
use crate::services::planner::ChunkPlanner;
use crate::services::quality::QualityAnalyzer;
use crate::services::synthesis::{HttpSynthesisClient, SynthesisService, VoiceSettings};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct GenerationReport {
    pub run_id: Uuid,
    pub outcome: RunOutcome,
    pub synthesized: usize,
    pub summaries: Vec<ChapterSummary>,
    pub chapters: Vec<ChapterArtifact>,
    /// Chapters left unassembled because some chunks failed.
    pub incomplete: Vec<ChapterId>,
    pub book: Option<Artifact>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub run_id: Option<Uuid>,
    pub summaries: Vec<ChapterSummary>,
}

/// Loader, planner, orchestrator and assembler wired from one configuration.
pub struct AudiobookPipeline {
    config: PipelineConfig,
    planner: ChunkPlanner,
    orchestrator: Orchestrator,
    music: Option<Arc<dyn MusicService>>,
}

impl AudiobookPipeline {
    pub fn from_config(config: PipelineConfig) -> Self {
        let synthesizer: Arc<dyn SynthesisService> = Arc::new(HttpSynthesisClient::new(&config.synthesis));
        let music: Arc<dyn MusicService> = Arc::new(HttpMusicClient::new(&config.assembly.music, &config.synthesis));
        Self::with_services(config, synthesizer, Some(music))
    }

    pub fn with_services(
        config: PipelineConfig,
        synthesizer: Arc<dyn SynthesisService>,
        music: Option<Arc<dyn MusicService>>,
    ) -> Self {
        let orchestrator = Orchestrator::new(
            synthesizer,
            QualityAnalyzer::new(config.quality.clone()),
            VoiceSettings::from_config(&config.synthesis),
            config.generation.clone(),
            config.paths.chunk_dir(),
            CheckpointStore::new(config.paths.checkpoint_path()),
        );
        Self {
            planner: ChunkPlanner::from_config(&config.planner),
            config,
            orchestrator,
            music,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.orchestrator.subscribe()
    }

    /// Load the chapter directory and plan every chapter.
    pub fn plan(&self) -> Result<Vec<Chapter>, PipelineError> {
        let mut chapters = load_chapters(&self.config.paths.chapters_dir)?;
        for chapter in chapters.iter_mut() {
            self.planner.plan_chapter(chapter);
        }
        Ok(chapters)
    }

    pub async fn generate(&self, stop: &StopHandle) -> Result<GenerationReport, PipelineError> {
        let mut chapters = self.plan()?;
        let mut run = self.orchestrator.run(&mut chapters, stop).await?;

        let mut report = GenerationReport {
            run_id: run.state.run_id,
            outcome: run.outcome,
            synthesized: run.synthesized,
            summaries: run.summaries,
            chapters: Vec::new(),
            incomplete: Vec::new(),
            book: None,
        };
        if run.outcome == RunOutcome::Paused {
            info!("Run paused; progress saved to {}", self.config.paths.checkpoint_path().display());
            return Ok(report);
        }

        for chapter in chapters {
            if !chapter.is_complete() {
                warn!(chapter = chapter.id, "Chapter has failed chunks, not assembling");
                report.incomplete.push(chapter.id);
                continue;
            }
            if let Some(artifact) = run.state.assembled(&chapter) {
                info!(chapter = chapter.id, "Chapter already assembled at {}", artifact.artifact.path.display());
                if self.config.assembly.purge_chunks {
                    purge_chunk_files(&chapter);
                }
                report.chapters.push(artifact);
                continue;
            }

            let output_dir = self.config.paths.output_dir.clone();
            let assembly = self.config.assembly.clone();
            let (chapter, assembled) = tokio::task::spawn_blocking(move || {
                let assembled = assemble_chapter(&chapter, &output_dir, &assembly);
                (chapter, assembled)
            })
            .await
            .map_err(|e| PipelineError::Task(e.to_string()))?;
            let artifact = assembled?;

            self.orchestrator
                .record_assembly(&mut run.state, &chapter, &artifact)
                .await?;
            if self.config.assembly.purge_chunks {
                purge_chunk_files(&chapter);
            }
            report.chapters.push(artifact);
        }

        if self.config.assembly.combine_book && report.incomplete.is_empty() && !report.chapters.is_empty() {
            let path = self.config.paths.output_dir.join(BOOK_FILE_NAME);
            let book = assemble_book(&report.chapters, &path, &self.config.assembly, self.music.as_deref()).await?;
            report.book = Some(book);
        }

        Ok(report)
    }

    /// Per-chapter progress as recorded in the checkpoint.
    pub async fn status(&self) -> Result<StatusReport, PipelineError> {
        let mut chapters = self.plan()?;
        let state = self.orchestrator.restore(&mut chapters).await?;
        Ok(StatusReport {
            run_id: state.map(|s| s.run_id),
            summaries: chapters.iter().map(Chapter::summary).collect(),
        })
    }

    pub async fn reset(&self) -> Result<bool, PipelineError> {
        Ok(self.orchestrator.reset().await?)
    }
}
