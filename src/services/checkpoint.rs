//! Durable per-chunk generation state.
//!
//! The orchestrator is the only writer. Every write goes to a temporary
//! sibling first and is renamed into place, so readers only ever see a
//! complete document.

use crate::error::CheckpointError;
use crate::models::{Artifact, Chapter, ChapterArtifact, ChapterId, Chunk, ChunkKey, ChunkStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

pub fn fingerprint(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub status: ChunkStatus,
    pub attempts: u32,
    pub fingerprint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Fingerprint of a chapter's planned chunk texts, in order.
pub fn chapter_fingerprint(chapter: &Chapter) -> String {
    let parts: Vec<String> = chapter.chunks.iter().map(|c| fingerprint(&c.text)).collect();
    fingerprint(&parts.join(":"))
}

/// A chapter file written by the assembler from the chunks fingerprinted here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterRecord {
    pub fingerprint: String,
    pub path: PathBuf,
    pub duration_secs: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationState {
    pub run_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Keyed by `"<chapter>:<index>"`.
    pub chunks: BTreeMap<String, ChunkRecord>,
    /// Assembled chapters. Their chunk files may already be purged.
    #[serde(default)]
    pub chapters: BTreeMap<ChapterId, ChapterRecord>,
}

/// What a resumed run picked up from an earlier checkpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResumeStats {
    pub reused: usize,
    pub requeued: usize,
    pub stale: usize,
}

impl Default for GenerationState {
    fn default() -> Self {
        Self::new()
    }
}

impl GenerationState {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            created_at: now,
            updated_at: now,
            chunks: BTreeMap::new(),
            chapters: BTreeMap::new(),
        }
    }

    pub fn get(&self, key: ChunkKey) -> Option<&ChunkRecord> {
        self.chunks.get(&key.to_string())
    }

    /// Upsert the record for `chunk`. A success clears any earlier error.
    pub fn record(&mut self, chunk: &Chunk, last_error: Option<String>) {
        let key = chunk.key().to_string();
        let last_error = match chunk.status {
            ChunkStatus::Succeeded => None,
            _ => last_error.or_else(|| self.chunks.get(&key).and_then(|r| r.last_error.clone())),
        };
        self.chunks.insert(
            key,
            ChunkRecord {
                status: chunk.status,
                attempts: chunk.attempts,
                fingerprint: fingerprint(&chunk.text),
                audio_path: chunk.audio_path.clone(),
                last_error,
            },
        );
        self.updated_at = Utc::now();
    }

    /// Remember that `artifact` was assembled from the current chunks of
    /// `chapter`.
    pub fn record_chapter(&mut self, chapter: &Chapter, artifact: &ChapterArtifact) {
        self.chapters.insert(
            chapter.id,
            ChapterRecord {
                fingerprint: chapter_fingerprint(chapter),
                path: artifact.artifact.path.clone(),
                duration_secs: artifact.artifact.duration_secs,
            },
        );
        self.updated_at = Utc::now();
    }

    /// The recorded artifact of `chapter`, if it was assembled from the same
    /// chunk texts and the file is still on disk.
    pub fn assembled(&self, chapter: &Chapter) -> Option<ChapterArtifact> {
        let record = self.chapters.get(&chapter.id)?;
        if record.fingerprint != chapter_fingerprint(chapter) || !record.path.exists() {
            return None;
        }
        Some(ChapterArtifact {
            chapter: chapter.id,
            name: chapter.name.clone(),
            artifact: Artifact {
                path: record.path.clone(),
                duration_secs: record.duration_secs,
            },
        })
    }

    /// Restore chunk progress into freshly planned chapters.
    ///
    /// A success is trusted only when the chunk text is unchanged and its
    /// audio is still on disk, or when its chapter was already assembled
    /// from the same chunks and that file is intact. Interrupted and rejected work goes back to
    /// `Pending` with its attempt count. Terminal failures are restored as
    /// they are; granting a fresh budget is up to the next run.
    pub fn apply_to(&self, chapters: &mut [Chapter]) -> ResumeStats {
        let mut stats = ResumeStats::default();
        for chapter in chapters.iter_mut() {
            let assembled = self.assembled(chapter).is_some();
            for chunk in chapter.chunks.iter_mut() {
                let Some(record) = self.get(chunk.key()) else {
                    continue;
                };
                if record.fingerprint != fingerprint(&chunk.text) {
                    stats.stale += 1;
                    continue;
                }
                match record.status {
                    ChunkStatus::Succeeded => match &record.audio_path {
                        Some(path) if assembled || path.exists() => {
                            chunk.status = ChunkStatus::Succeeded;
                            chunk.attempts = record.attempts;
                            chunk.audio_path = Some(path.clone());
                            stats.reused += 1;
                        }
                        _ => stats.stale += 1,
                    },
                    ChunkStatus::Failed => {
                        chunk.status = ChunkStatus::Failed;
                        chunk.attempts = record.attempts;
                        stats.requeued += 1;
                    }
                    ChunkStatus::Pending | ChunkStatus::InFlight | ChunkStatus::QualityRejected => {
                        chunk.status = ChunkStatus::Pending;
                        chunk.attempts = record.attempts;
                        stats.requeued += 1;
                    }
                }
            }
        }
        stats
    }

    /// Replace all records with the current state of `chapters`, dropping
    /// records of chunks that no longer exist in the plan and of chapters
    /// whose chunks changed.
    pub fn sync_plan(&mut self, chapters: &[Chapter]) {
        self.chapters.retain(|id, record| {
            chapters
                .iter()
                .any(|c| c.id == *id && chapter_fingerprint(c) == record.fingerprint)
        });
        let previous = std::mem::take(&mut self.chunks);
        for chunk in chapters.iter().flat_map(|c| c.chunks.iter()) {
            let carried = previous
                .get(&chunk.key().to_string())
                .and_then(|r| r.last_error.clone());
            self.record(chunk, carried);
        }
        self.updated_at = Utc::now();
    }

    pub fn count(&self, status: ChunkStatus) -> usize {
        self.chunks.values().filter(|r| r.status == status).count()
    }
}

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> Result<Option<GenerationState>, CheckpointError> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(self.io_error(source)),
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|source| CheckpointError::Corrupt {
                path: self.path.clone(),
                source,
            })
    }

    pub async fn save(&self, state: &GenerationState) -> Result<(), CheckpointError> {
        let body = serde_json::to_vec_pretty(state)?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.io_error(e))?;
        }

        let mut name = self.path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(".tmp");
        let tmp = self.path.with_file_name(name);

        let mut file = tokio::fs::File::create(&tmp).await.map_err(|e| self.io_error(e))?;
        file.write_all(&body).await.map_err(|e| self.io_error(e))?;
        file.sync_all().await.map_err(|e| self.io_error(e))?;
        drop(file);
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| self.io_error(e))?;
        Ok(())
    }

    /// Remove the checkpoint. Missing files are not an error.
    pub async fn reset(&self) -> Result<bool, CheckpointError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(self.io_error(source)),
        }
    }

    fn io_error(&self, source: std::io::Error) -> CheckpointError {
        CheckpointError::Io {
            path: self.path.clone(),
            source,
        }
    }
}
