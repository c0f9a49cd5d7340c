use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Index of a chapter in load order.
pub type ChapterId = usize;

/// Canonical identity of a chunk: its chapter and its planned sequence index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkKey {
    pub chapter: ChapterId,
    pub index: usize,
}

impl ChunkKey {
    pub fn new(chapter: ChapterId, index: usize) -> Self {
        Self { chapter, index }
    }
}

impl fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.chapter, self.index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    Pending,
    InFlight,
    Succeeded,
    Failed,
    QualityRejected,
}

impl fmt::Display for ChunkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChunkStatus::Pending => "pending",
            ChunkStatus::InFlight => "in_flight",
            ChunkStatus::Succeeded => "succeeded",
            ChunkStatus::Failed => "failed",
            ChunkStatus::QualityRejected => "quality_rejected",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub chapter: ChapterId,
    pub index: usize,
    pub text: String,
    pub tokens: usize,
    pub status: ChunkStatus,
    pub attempts: u32,
    pub audio_path: Option<PathBuf>,
}

impl Chunk {
    pub fn new(chapter: ChapterId, index: usize, text: String) -> Self {
        let tokens = crate::utils::count_tokens(&text);
        Self {
            chapter,
            index,
            text,
            tokens,
            status: ChunkStatus::Pending,
            attempts: 0,
            audio_path: None,
        }
    }

    pub fn key(&self) -> ChunkKey {
        ChunkKey::new(self.chapter, self.index)
    }

    pub fn is_done(&self) -> bool {
        self.status == ChunkStatus::Succeeded && self.audio_path.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chapter {
    pub id: ChapterId,
    pub name: String,
    pub source: Option<PathBuf>,
    pub text: String,
    pub chunks: Vec<Chunk>,
}

impl Chapter {
    pub fn new(id: ChapterId, name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            source: None,
            text: text.into(),
            chunks: Vec::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        !self.chunks.is_empty() && self.chunks.iter().all(Chunk::is_done)
    }

    pub fn summary(&self) -> ChapterSummary {
        let count = |status| self.chunks.iter().filter(|c| c.status == status).count();
        ChapterSummary {
            chapter: self.id,
            name: self.name.clone(),
            total: self.chunks.len(),
            succeeded: count(ChunkStatus::Succeeded),
            failed: count(ChunkStatus::Failed),
            failed_chunks: self
                .chunks
                .iter()
                .filter(|c| c.status == ChunkStatus::Failed)
                .map(|c| c.index)
                .collect(),
        }
    }
}

/// One entry of the progress stream consumed by the CLI and HTTP surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub chunk: ChunkKey,
    pub status: ChunkStatus,
    pub attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChapterSummary {
    pub chapter: ChapterId,
    pub name: String,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub failed_chunks: Vec<usize>,
}

/// Output audio produced by the assembler.
#[derive(Debug, Clone, Serialize)]
pub struct Artifact {
    pub path: PathBuf,
    pub duration_secs: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChapterArtifact {
    pub chapter: ChapterId,
    pub name: String,
    pub artifact: Artifact,
}
