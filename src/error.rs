use crate::models::{ChapterId, ChunkKey};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Rejected manual merge/split. The plan is left untouched.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum PlanningError {
    #[error("chunk {index} not found in chapter {chapter}")]
    ChunkNotFound { chapter: ChapterId, index: usize },
    #[error("chunks {first} and {second} are not adjacent in the same chapter")]
    NotAdjacent { first: ChunkKey, second: ChunkKey },
    #[error("result would hold {tokens} tokens, budget is {budget}")]
    ExceedsBudget { tokens: usize, budget: usize },
    #[error("offset {offset} is not a word boundary inside the chunk")]
    InvalidOffset { offset: usize },
    #[error("split would produce an empty chunk")]
    EmptySegment,
    #[error("chapter {0} already has synthesis progress; re-plan it first")]
    ChapterInProgress(ChapterId),
    #[error("chunks of chapter {0} no longer reproduce the chapter text")]
    ContiguityBroken(ChapterId),
}

#[derive(Error, Debug, Clone)]
pub enum SynthesisError {
    #[error("transient synthesis failure: {0}")]
    Transient(String),
    #[error("rate limited by synthesis service")]
    RateLimited { retry_after: Option<Duration> },
    #[error("synthesis call timed out after {0:?}")]
    Timeout(Duration),
    #[error("invalid synthesis request: {0}")]
    Invalid(String),
}

impl SynthesisError {
    pub fn is_transient(&self) -> bool {
        !matches!(self, SynthesisError::Invalid(_))
    }
}

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("checkpoint io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("checkpoint at {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("checkpoint serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum AudioError {
    #[error("wav error: {0}")]
    Wav(#[from] hound::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sample rate mismatch: expected {expected} Hz, got {found} Hz")]
    SampleRateMismatch { expected: u32, found: u32 },
    #[error("unsupported channel layout: {0} channels")]
    UnsupportedChannels(u16),
    #[error("no audio to process")]
    Empty,
}

#[derive(Error, Debug)]
pub enum AssemblyError {
    #[error("chapter {chapter} is incomplete: chunks {missing:?} have not succeeded")]
    IncompleteChapter { chapter: ChapterId, missing: Vec<usize> },
    #[error("no chapter artifacts to assemble")]
    NoChapters,
    #[error("audio error: {0}")]
    Audio(#[from] AudioError),
}

#[derive(Error, Debug)]
pub enum GenerationError {
    #[error("fatal synthesis error on chunk {chunk}: {source}")]
    Fatal {
        chunk: ChunkKey,
        #[source]
        source: SynthesisError,
    },
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error("could not store audio for chunk {chunk}: {source}")]
    Artifact {
        chunk: ChunkKey,
        #[source]
        source: AudioError,
    },
    #[error("worker task failed: {0}")]
    Worker(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

#[derive(Error, Debug)]
pub enum ChapterError {
    #[error("could not read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{0} is not valid UTF-8")]
    Encoding(PathBuf),
    #[error("no chapter files (*.txt, *.md) found in {0}")]
    NoChapters(PathBuf),
}

/// Anything that stops `generate`, `status` or `reset` from finishing.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Chapters(#[from] ChapterError),
    #[error(transparent)]
    Generation(#[from] GenerationError),
    #[error(transparent)]
    Assembly(#[from] AssemblyError),
    #[error("chapter assembly task failed: {0}")]
    Task(String),
}
