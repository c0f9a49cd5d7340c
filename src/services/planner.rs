//! Chunk planning.
//!
//! Splits a chapter into ordered, size-bounded chunks. Paragraphs (blank-line
//! separated blocks) are the preferred boundary; a paragraph that alone
//! exceeds the budget is broken at sentence boundaries, then at word
//! boundaries. Words are never split; in CJK text every character counts as
//! a word.

use crate::config::{DEFAULT_SAFE_LIMIT, PlannerConfig};
use crate::error::PlanningError;
use crate::models::{Chapter, ChapterId, Chunk, ChunkKey, ChunkStatus};
use crate::utils::{
    count_tokens, is_break_between, is_word_boundary, normalize_whitespace, sentence_spans,
    tokens_for_chars, word_spans,
};

const PARAGRAPH_BREAK: &str = "\n\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanMode {
    /// Greedy paragraph packing up to the budget.
    Standard,
    /// Conservative ceiling with boundaries re-balanced so chunks come out
    /// roughly the same size.
    Safe { limit: usize },
}

impl PlanMode {
    pub fn safe() -> Self {
        PlanMode::Safe {
            limit: DEFAULT_SAFE_LIMIT,
        }
    }

    pub fn effective_budget(&self, token_budget: usize) -> usize {
        match *self {
            PlanMode::Standard => token_budget,
            PlanMode::Safe { limit } => token_budget.min(limit),
        }
        .max(1)
    }
}

/// Piece of text that is never broken further during packing.
#[derive(Debug, Clone)]
struct Unit {
    text: String,
    /// Joins this unit to the one before it: a blank line between
    /// paragraphs, a space or nothing inside one.
    separator: &'static str,
}

/// Plan one chapter's text into chunks.
pub fn plan(chapter: ChapterId, text: &str, token_budget: usize, mode: PlanMode) -> Vec<Chunk> {
    let budget = mode.effective_budget(token_budget);
    let paragraphs = paragraphs(text);

    let groups = match mode {
        PlanMode::Standard => pack_paragraphs(&paragraphs, budget),
        PlanMode::Safe { .. } => pack_balanced(&paragraphs, budget),
    };

    groups
        .into_iter()
        .enumerate()
        .map(|(index, text)| Chunk::new(chapter, index, text))
        .collect()
}

/// Blank-line separated blocks with internal whitespace collapsed.
fn paragraphs(text: &str) -> Vec<String> {
    let mut paragraphs = Vec::new();
    let mut current: Vec<&str> = Vec::new();

    for line in text.lines() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                paragraphs.push(normalize_whitespace(&current.join(" ")));
                current.clear();
            }
        } else {
            current.push(line);
        }
    }
    if !current.is_empty() {
        paragraphs.push(normalize_whitespace(&current.join(" ")));
    }

    paragraphs.retain(|p| !p.is_empty());
    paragraphs
}

fn pack_paragraphs(paragraphs: &[String], budget: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();

    for paragraph in paragraphs {
        if count_tokens(paragraph) > budget {
            // Overflow: close what we have, then emit the pieces on their own.
            if !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
            }
            chunks.extend(force_split(paragraph, budget));
            continue;
        }

        if current.is_empty() {
            current = paragraph.clone();
            continue;
        }

        let candidate = format!("{}{}{}", current, PARAGRAPH_BREAK, paragraph);
        if count_tokens(&candidate) <= budget {
            current = candidate;
        } else {
            chunks.push(std::mem::replace(&mut current, paragraph.clone()));
        }
    }

    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Break an oversized paragraph into pieces that each fit the budget,
/// packing whole sentences where possible.
fn force_split(paragraph: &str, budget: usize) -> Vec<String> {
    let units = paragraph_units(paragraph, budget, "");
    let lengths: Vec<usize> = units.iter().map(|u| u.text.chars().count()).collect();
    group_units(&units, &lengths, budget)
        .into_iter()
        .map(|(start, end)| join_units(&units[start..end]))
        .collect()
}

/// Sentences of an oversized paragraph, with sentences that still exceed
/// the budget broken into words. A single word larger than the budget stays
/// whole.
fn paragraph_units(paragraph: &str, budget: usize, opening: &'static str) -> Vec<Unit> {
    let mut spans = Vec::new();
    for sentence in sentence_spans(paragraph) {
        if count_tokens(&paragraph[sentence.clone()]) > budget {
            let offset = sentence.start;
            spans.extend(
                word_spans(&paragraph[sentence])
                    .into_iter()
                    .map(|word| word.start + offset..word.end + offset),
            );
        } else {
            spans.push(sentence);
        }
    }

    let mut units = Vec::with_capacity(spans.len());
    let mut previous_end = None;
    for span in spans {
        let separator = match previous_end {
            None => opening,
            Some(end) if paragraph[end..span.start].chars().any(char::is_whitespace) => " ",
            Some(_) => "",
        };
        previous_end = Some(span.end);
        units.push(Unit {
            text: paragraph[span].to_string(),
            separator,
        });
    }
    units
}

fn units(paragraphs: &[String], budget: usize) -> Vec<Unit> {
    let mut units = Vec::new();
    for paragraph in paragraphs {
        if count_tokens(paragraph) <= budget {
            units.push(Unit {
                text: paragraph.clone(),
                separator: PARAGRAPH_BREAK,
            });
        } else {
            units.extend(paragraph_units(paragraph, budget, PARAGRAPH_BREAK));
        }
    }
    units
}

fn join_units(units: &[Unit]) -> String {
    let mut text = String::new();
    for (i, unit) in units.iter().enumerate() {
        if i > 0 {
            text.push_str(unit.separator);
        }
        text.push_str(&unit.text);
    }
    text
}

/// Greedy contiguous grouping under `cap`, returned as `[start, end)` ranges.
fn group_units(units: &[Unit], lengths: &[usize], cap: usize) -> Vec<(usize, usize)> {
    let mut groups = Vec::new();
    let mut start = 0;

    while start < units.len() {
        let mut chars = lengths[start];
        let mut end = start + 1;
        while end < units.len() {
            let next = chars + units[end].separator.chars().count() + lengths[end];
            if tokens_for_chars(next) > cap {
                break;
            }
            chars = next;
            end += 1;
        }
        groups.push((start, end));
        start = end;
    }
    groups
}

/// Safe-mode packing: find the chunk count greedy packing needs at the full
/// budget, then the smallest cap that still fits the text in that many
/// chunks. Trailing overflow is spread across all chunks instead of landing
/// in the last one.
fn pack_balanced(paragraphs: &[String], budget: usize) -> Vec<String> {
    let units = units(paragraphs, budget);
    if units.is_empty() {
        return Vec::new();
    }

    let lengths: Vec<usize> = units.iter().map(|u| u.text.chars().count()).collect();
    let target = group_units(&units, &lengths, budget).len();
    let mut low = lengths
        .iter()
        .map(|&chars| tokens_for_chars(chars))
        .max()
        .unwrap_or(1)
        .clamp(1, budget);
    let mut high = budget;

    while low < high {
        let mid = low + (high - low) / 2;
        if group_units(&units, &lengths, mid).len() <= target {
            high = mid;
        } else {
            low = mid + 1;
        }
    }

    group_units(&units, &lengths, high)
        .into_iter()
        .map(|(start, end)| join_units(&units[start..end]))
        .collect()
}

/// Planner bound to one configuration.
#[derive(Debug, Clone, Copy)]
pub struct ChunkPlanner {
    token_budget: usize,
    mode: PlanMode,
}

impl ChunkPlanner {
    pub fn new(token_budget: usize, mode: PlanMode) -> Self {
        Self { token_budget, mode }
    }

    pub fn from_config(config: &PlannerConfig) -> Self {
        let mode = if config.safe_mode {
            PlanMode::Safe {
                limit: config.safe_limit,
            }
        } else {
            PlanMode::Standard
        };
        Self::new(config.token_budget, mode)
    }

    pub fn budget(&self) -> usize {
        self.mode.effective_budget(self.token_budget)
    }

    pub fn mode(&self) -> PlanMode {
        self.mode
    }

    /// (Re-)plan a chapter, replacing its chunks.
    pub fn plan_chapter(&self, chapter: &mut Chapter) {
        chapter.chunks = plan(chapter.id, &chapter.text, self.token_budget, self.mode);
        tracing::debug!(
            chapter = chapter.id,
            chunks = chapter.chunks.len(),
            budget = self.budget(),
            "planned chapter"
        );
    }

    /// Merge chunk `first` with the chunk right after it.
    pub fn merge(&self, chapter: &mut Chapter, first: usize, second: usize) -> Result<(), PlanningError> {
        ensure_untouched(chapter)?;
        let key = |index| ChunkKey::new(chapter.id, index);
        if second != first + 1 {
            return Err(PlanningError::NotAdjacent {
                first: key(first),
                second: key(second),
            });
        }
        if second >= chapter.chunks.len() {
            return Err(PlanningError::ChunkNotFound {
                chapter: chapter.id,
                index: second,
            });
        }

        let merged = format!(
            "{}{}{}",
            chapter.chunks[first].text,
            gap_after(chapter, first),
            chapter.chunks[second].text
        );
        let tokens = count_tokens(&merged);
        if tokens > self.budget() {
            return Err(PlanningError::ExceedsBudget {
                tokens,
                budget: self.budget(),
            });
        }

        let mut chunks = chapter.chunks.clone();
        chunks[first] = Chunk::new(chapter.id, first, merged);
        chunks.remove(second);
        self.commit(chapter, chunks)
    }

    /// Split chunk `index` at byte offset `at_offset` of its text.
    pub fn split(&self, chapter: &mut Chapter, index: usize, at_offset: usize) -> Result<(), PlanningError> {
        ensure_untouched(chapter)?;
        let chunk = chapter.chunks.get(index).ok_or(PlanningError::ChunkNotFound {
            chapter: chapter.id,
            index,
        })?;
        if !is_word_boundary(&chunk.text, at_offset) {
            return Err(PlanningError::InvalidOffset { offset: at_offset });
        }

        let left = chunk.text[..at_offset].trim_end().to_string();
        let right = chunk.text[at_offset..].trim_start().to_string();
        if left.is_empty() || right.is_empty() {
            return Err(PlanningError::EmptySegment);
        }

        let mut chunks = chapter.chunks.clone();
        chunks[index] = Chunk::new(chapter.id, index, left);
        chunks.insert(index + 1, Chunk::new(chapter.id, index + 1, right));
        self.commit(chapter, chunks)
    }

    /// Re-index, re-validate and only then replace the chapter's chunks.
    fn commit(&self, chapter: &mut Chapter, mut chunks: Vec<Chunk>) -> Result<(), PlanningError> {
        for (index, chunk) in chunks.iter_mut().enumerate() {
            chunk.index = index;
        }
        validate_chunks(chapter.id, &chapter.text, &chunks, self.budget())?;
        chapter.chunks = chunks;
        Ok(())
    }
}

/// Separator to put back between chunk `first` and its successor: nothing
/// when the source runs them together, as CJK text does.
fn gap_after(chapter: &Chapter, first: usize) -> &'static str {
    let source = normalize_whitespace(&chapter.text);
    let mut rest = source.as_str();
    for chunk in &chapter.chunks[..=first] {
        match rest.trim_start().strip_prefix(normalize_whitespace(&chunk.text).as_str()) {
            Some(after) => rest = after,
            None => return PARAGRAPH_BREAK,
        }
    }
    if rest.is_empty() || rest.starts_with(char::is_whitespace) {
        PARAGRAPH_BREAK
    } else {
        ""
    }
}

fn ensure_untouched(chapter: &Chapter) -> Result<(), PlanningError> {
    if chapter.chunks.iter().any(|c| c.status != ChunkStatus::Pending || c.attempts > 0) {
        return Err(PlanningError::ChapterInProgress(chapter.id));
    }
    Ok(())
}

/// Check the budget and contiguity invariants of a chunk list.
///
/// Chunks must cover the source in order, ignoring whitespace differences,
/// and each cut between chunks must fall on a word boundary.
pub fn validate_chunks(
    chapter: ChapterId,
    source: &str,
    chunks: &[Chunk],
    budget: usize,
) -> Result<(), PlanningError> {
    for chunk in chunks {
        let single_word = word_spans(&chunk.text).len() <= 1;
        if chunk.tokens > budget && !single_word {
            return Err(PlanningError::ExceedsBudget {
                tokens: chunk.tokens,
                budget,
            });
        }
    }

    let source = normalize_whitespace(source);
    let mut rest = source.as_str();
    for chunk in chunks {
        let text = normalize_whitespace(&chunk.text);
        let after = rest
            .trim_start()
            .strip_prefix(text.as_str())
            .filter(|_| !text.is_empty())
            .ok_or(PlanningError::ContiguityBroken(chapter))?;
        if let (Some(before), Some(next)) = (text.chars().next_back(), after.chars().next()) {
            if !is_break_between(before, next) {
                return Err(PlanningError::ContiguityBroken(chapter));
            }
        }
        rest = after;
    }
    if !rest.trim().is_empty() {
        return Err(PlanningError::ContiguityBroken(chapter));
    }
    Ok(())
}
