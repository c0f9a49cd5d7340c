pub mod assembler;
pub mod audio;
pub mod chapterizer;
pub mod checkpoint;
pub mod music;
pub mod orchestrator;
pub mod pipeline;
pub mod planner;
pub mod quality;
pub mod synthesis;
