//! Long-form text to narrated audio: chunk planning, resumable synthesis with
//! a statistical quality gate, and chapter/book assembly.

pub mod config;
pub mod error;
pub mod models;
pub mod services;
pub mod utils;

pub use config::PipelineConfig;
pub use services::orchestrator::{RunOutcome, StopHandle};
pub use services::pipeline::{AudiobookPipeline, GenerationReport};
