//! Chapter input: loading the chapter directory and splitting a single
//! manuscript into chapter files.

use crate::error::ChapterError;
use crate::models::Chapter;
use crate::utils::strip_bom;
use anyhow::{Context, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Load every `*.txt` / `*.md` file of `dir` as a chapter, ordered by file name.
pub fn load_chapters(dir: &Path) -> Result<Vec<Chapter>, ChapterError> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .map_err(io(dir))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file() && is_chapter_file(path))
        .collect();
    files.sort();

    let mut chapters = Vec::new();
    for path in files {
        let raw = std::fs::read(&path).map_err(io(&path))?;
        let text = String::from_utf8(strip_bom(&raw).to_vec())
            .map_err(|_| ChapterError::Encoding(path.clone()))?;
        if text.trim().is_empty() {
            tracing::warn!("Skipping empty chapter file {}", path.display());
            continue;
        }
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut chapter = Chapter::new(chapters.len(), name, text);
        chapter.source = Some(path);
        chapters.push(chapter);
    }

    if chapters.is_empty() {
        return Err(ChapterError::NoChapters(dir.to_path_buf()));
    }
    tracing::info!("Loaded {} chapters from {}", chapters.len(), dir.display());
    Ok(chapters)
}

fn io(path: &Path) -> impl FnOnce(std::io::Error) -> ChapterError {
    let path = path.to_path_buf();
    move |source| ChapterError::Io { path, source }
}

fn is_chapter_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase).as_deref(),
        Some("txt") | Some("md")
    )
}

/// A titled piece of a manuscript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub title: String,
    pub content: String,
}

fn heading_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"(?i)^chapter\s+(\d+|[a-z]+)\s*$",
            r"(?i)^chapter\s+(\d+|[a-z]+)\s*[-:.]\s*(.+)$",
            r"(?i)^chap\.?\s*(\d+)\s*$",
            r"(?i)^part\s+(\d+|[a-z]+)\s*$",
            r"^#{1,2}\s+([^#].*)$",
            r"^(第\s*\d+\s*[章节回话])\s*(.*)$",
            r"^(第\s*[一二三四五六七八九十百千万零]+\s*[章节回话])\s*(.*)$",
        ]
        .iter()
        .filter_map(|pattern| Regex::new(pattern).ok())
        .collect()
    })
}

/// Title of the heading on `line`, if it is one.
fn heading_title(line: &str) -> Option<String> {
    let line = line.trim();
    if line.is_empty() || line.chars().count() > 80 {
        return None;
    }
    heading_patterns().iter().find_map(|regex| {
        let captures = regex.captures(line)?;
        match captures.get(2).map(|m| m.as_str().trim()) {
            Some(title) if !title.is_empty() => Some(format!("{} - {}", numbered(&captures), title)),
            _ if captures.len() > 2 => Some(numbered(&captures)),
            _ => Some(line.trim_start_matches('#').trim().to_string()),
        }
    })
}

fn numbered(captures: &regex::Captures<'_>) -> String {
    let marker = captures.get(1).map(|m| m.as_str()).unwrap_or_default();
    if marker.starts_with('第') {
        marker.split_whitespace().collect()
    } else {
        format!("Chapter {}", marker)
    }
}

/// Split a manuscript at chapter headings. Text before the first heading
/// becomes a "Prologue"; text without any heading is a single section.
pub fn split_manuscript(text: &str) -> Vec<Section> {
    let mut sections = Vec::new();
    let mut title = None::<String>;
    let mut body: Vec<&str> = Vec::new();

    for line in text.lines() {
        match heading_title(line) {
            Some(next) => {
                flush(title.take(), &mut body, &mut sections);
                title = Some(next);
            }
            None => body.push(line),
        }
    }
    flush(title, &mut body, &mut sections);

    if sections.len() == 1 && sections[0].title == "Prologue" {
        sections[0].title = "Complete Text".to_string();
    }
    sections
}

fn flush(title: Option<String>, body: &mut Vec<&str>, sections: &mut Vec<Section>) {
    let content = body.join("\n").trim().to_string();
    body.clear();
    if content.is_empty() {
        return;
    }
    let title = title.unwrap_or_else(|| {
        if sections.is_empty() { "Prologue" } else { "Untitled" }.to_string()
    });
    sections.push(Section { title, content });
}

/// Write sections as `chapter_NNN.txt` files loadable by [`load_chapters`].
pub fn write_chapter_files(dir: &Path, sections: &[Section]) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dir).with_context(|| format!("could not create {}", dir.display()))?;
    sections
        .iter()
        .enumerate()
        .map(|(i, section)| {
            let path = dir.join(format!("chapter_{:03}.txt", i + 1));
            std::fs::write(&path, format!("{}\n\n{}\n", section.title, section.content))
                .with_context(|| format!("could not write {}", path.display()))?;
            Ok(path)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn english_headings_split_chapters() {
        let text = "Foreword text.\n\nChapter 1\nIt begins.\n\nChapter 2: The Storm\nRain fell.";
        let sections = split_manuscript(text);
        let titles: Vec<_> = sections.iter().map(|s| s.title.as_str()).collect();
        assert_eq!(titles, vec!["Prologue", "Chapter 1", "Chapter 2 - The Storm"]);
        assert_eq!(sections[2].content, "Rain fell.");
    }

    #[test]
    fn chinese_headings_split_chapters() {
        let text = "第一章 开始\n很久以前。\n第2回\n后来。";
        let sections = split_manuscript(text);
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].title, "第一章 - 开始");
        assert_eq!(sections[0].content, "很久以前。");
        assert_eq!(sections[1].title, "第2回");
    }

    #[test]
    fn markdown_headings_keep_their_text() {
        let sections = split_manuscript("# The Beginning\nBody.\n## Next\nMore.");
        assert_eq!(sections[0].title, "The Beginning");
        assert_eq!(sections[1].title, "Next");
    }

    #[test]
    fn text_without_headings_is_one_section() {
        let sections = split_manuscript("Just a story.\n\nWith two paragraphs.");
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].title, "Complete Text");
    }

    #[test]
    fn written_files_load_back_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let sections = split_manuscript("Chapter 1\nOne.\nChapter 2\nTwo.\nChapter 3\nThree.");
        write_chapter_files(dir.path(), &sections).unwrap();
        std::fs::write(dir.path().join("notes.json"), "{}").unwrap();
        std::fs::write(dir.path().join("chapter_004.txt"), "\u{feff}  \n").unwrap();

        let chapters = load_chapters(dir.path()).unwrap();
        assert_eq!(chapters.len(), 3);
        assert_eq!(chapters[0].name, "chapter_001");
        assert_eq!(chapters[2].id, 2);
        assert!(chapters[1].text.contains("Two."));
    }

    #[test]
    fn bom_is_removed_on_load() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "\u{feff}Hello there.").unwrap();
        let chapters = load_chapters(dir.path()).unwrap();
        assert_eq!(chapters[0].text, "Hello there.");
    }

    #[test]
    fn empty_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(load_chapters(dir.path()), Err(ChapterError::NoChapters(_))));
    }
}
