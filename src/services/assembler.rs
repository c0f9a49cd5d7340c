use crate::config::AssemblyConfig;
use crate::error::{AssemblyError, AudioError};
use crate::models::{Artifact, Chapter, ChapterArtifact};
use crate::services::audio::{concatenate, mix_down, read_wav, write_wav};
use crate::services::music::MusicService;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

pub const BOOK_FILE_NAME: &str = "complete_audiobook.wav";

/// Join the chunks of one chapter, in index order, into `<output_dir>/NNN_name.wav`.
///
/// Every chunk must have succeeded; otherwise nothing is written.
pub fn assemble_chapter(
    chapter: &Chapter,
    output_dir: &Path,
    config: &AssemblyConfig,
) -> Result<ChapterArtifact, AssemblyError> {
    let missing: Vec<usize> = chapter
        .chunks
        .iter()
        .filter(|c| !c.is_done())
        .map(|c| c.index)
        .collect();
    if !missing.is_empty() || chapter.chunks.is_empty() {
        return Err(AssemblyError::IncompleteChapter {
            chapter: chapter.id,
            missing,
        });
    }

    let mut ordered: Vec<_> = chapter.chunks.iter().collect();
    ordered.sort_by_key(|c| c.index);

    let mut buffers = Vec::with_capacity(ordered.len());
    for path in ordered.iter().filter_map(|c| c.audio_path.as_ref()) {
        buffers.push(read_wav(path)?);
    }

    let audio = concatenate(&buffers, Duration::from_millis(config.chunk_pause_ms))?;
    let path = output_dir.join(chapter_file_name(chapter));
    write_wav(&path, &audio)?;
    info!(
        chapter = chapter.id,
        chunks = buffers.len(),
        duration_secs = audio.duration_secs(),
        "Assembled chapter {}",
        path.display()
    );

    Ok(ChapterArtifact {
        chapter: chapter.id,
        name: chapter.name.clone(),
        artifact: Artifact {
            path,
            duration_secs: audio.duration_secs(),
        },
    })
}

/// Delete the chunk files of an assembled chapter. Failures are logged, not
/// returned.
pub fn purge_chunk_files(chapter: &Chapter) {
    for path in chapter.chunks.iter().filter_map(|c| c.audio_path.as_ref()) {
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Could not remove chunk file {}: {}", path.display(), e),
        }
    }
}

/// Join chapter artifacts in chapter order and optionally lay background
/// music underneath.
pub async fn assemble_book(
    chapters: &[ChapterArtifact],
    output_path: &Path,
    config: &AssemblyConfig,
    music: Option<&dyn MusicService>,
) -> Result<Artifact, AssemblyError> {
    if chapters.is_empty() {
        return Err(AssemblyError::NoChapters);
    }

    let mut ordered = chapters.to_vec();
    ordered.sort_by_key(|c| c.chapter);
    let paths: Vec<PathBuf> = ordered.iter().map(|c| c.artifact.path.clone()).collect();
    let pause = Duration::from_millis(config.chapter_pause_ms);

    let narration = blocking(move || {
        let buffers = paths.iter().map(|p| read_wav(p)).collect::<Result<Vec<_>, _>>()?;
        concatenate(&buffers, pause)
    })
    .await?;

    let audio = match music {
        Some(service) if config.music.enabled => {
            let length = Duration::from_secs_f64(narration.duration_secs());
            let fade = Duration::from_secs_f32(config.music.fade_secs.max(0.0));
            match service.generate_ambient(length, &config.music.mood).await {
                Ok(bed) => match mix_down(&narration, &bed, config.music.volume, fade) {
                    Ok(mixed) => mixed,
                    Err(e) => {
                        warn!("Background music could not be mixed, writing narration only: {}", e);
                        narration
                    }
                },
                Err(e) => {
                    warn!("Background music unavailable, writing narration only: {}", e);
                    narration
                }
            }
        }
        _ => narration,
    };

    let duration_secs = audio.duration_secs();
    let path = output_path.to_path_buf();
    let written = path.clone();
    blocking(move || write_wav(&written, &audio)).await?;
    info!(chapters = ordered.len(), duration_secs, "Assembled book {}", path.display());

    Ok(Artifact { path, duration_secs })
}

pub fn chapter_file_name(chapter: &Chapter) -> String {
    let slug: String = chapter
        .name
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    let slug = slug.trim_matches('_');
    if slug.is_empty() {
        format!("{:03}.wav", chapter.id + 1)
    } else {
        format!("{:03}_{}.wav", chapter.id + 1, slug)
    }
}

async fn blocking<T, F>(f: F) -> Result<T, AudioError>
where
    F: FnOnce() -> Result<T, AudioError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| AudioError::Io(std::io::Error::other(e.to_string())))?
}
