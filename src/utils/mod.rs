//! Text helpers shared by the planner, the quality gate and chapter loading.

use std::ops::Range;

/// Rough token estimate used for chunk budgeting (about four characters per token).
pub fn count_tokens(text: &str) -> usize {
    tokens_for_chars(text.chars().count())
}

pub fn tokens_for_chars(chars: usize) -> usize {
    if chars == 0 { 0 } else { (chars / 4).max(1) }
}

/// Collapse every run of whitespace into a single space and trim the ends.
pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Drop a leading UTF-8 byte order mark, if present.
pub fn strip_bom(bytes: &[u8]) -> &[u8] {
    bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(bytes)
}

/// Ideographs, kana and full-width punctuation: scripts written without
/// spaces between words.
pub fn is_cjk(c: char) -> bool {
    matches!(
        c as u32,
        0x3000..=0x303F | 0x3040..=0x30FF | 0x3400..=0x4DBF | 0x4E00..=0x9FFF | 0xF900..=0xFAFF | 0xFF00..=0xFFEF
    )
}

fn is_closing(c: char) -> bool {
    matches!(
        c,
        '"' | '\'' | ')' | ']' | '”' | '’' | '」' | '』' | '）' | '》' | '〉' | '】' | '。' | '，' | '、' | '！' | '？' | '：' | '；' | '…'
    )
}

fn is_opening(c: char) -> bool {
    matches!(c, '“' | '‘' | '「' | '『' | '（' | '《' | '〈' | '【')
}

/// True when text may be cut between `before` and `after`: at whitespace, or
/// next to a CJK character unless that would strand punctuation.
pub fn is_break_between(before: char, after: char) -> bool {
    if before.is_whitespace() || after.is_whitespace() {
        return true;
    }
    (is_cjk(before) || is_cjk(after)) && !is_closing(after) && !is_opening(before)
}

/// Byte ranges of the words of `text`. Each CJK character is a word of its
/// own, with adjacent punctuation attached.
pub fn word_spans(text: &str) -> Vec<Range<usize>> {
    let mut spans = Vec::new();
    let mut start = None;
    let mut prev: Option<char> = None;

    for (i, c) in text.char_indices() {
        if c.is_whitespace() {
            if let Some(begin) = start.take() {
                spans.push(begin..i);
            }
        } else {
            match (start, prev) {
                (Some(begin), Some(p)) if is_break_between(p, c) => {
                    spans.push(begin..i);
                    start = Some(i);
                }
                (None, _) => start = Some(i),
                _ => {}
            }
        }
        prev = Some(c);
    }
    if let Some(begin) = start {
        spans.push(begin..text.len());
    }
    spans
}

/// Expected narration length in seconds: spaced words at `words_per_minute`,
/// CJK characters at `cjk_chars_per_minute`.
pub fn estimate_speech_secs(text: &str, words_per_minute: f64, cjk_chars_per_minute: f64) -> f64 {
    let mut words = 0usize;
    let mut cjk_chars = 0usize;
    for span in word_spans(text) {
        let spoken = text[span].chars().filter(|&c| is_cjk(c) && c.is_alphabetic()).count();
        if spoken > 0 {
            cjk_chars += spoken;
        } else {
            words += 1;
        }
    }

    let rate = |count: usize, per_minute: f64| {
        if count == 0 || per_minute <= 0.0 {
            0.0
        } else {
            count as f64 / per_minute * 60.0
        }
    };
    rate(words, words_per_minute) + rate(cjk_chars, cjk_chars_per_minute)
}

const TERMINATORS: [char; 6] = ['.', '!', '?', '。', '！', '？'];
const SENTENCE_CLOSERS: [char; 10] = ['"', '\'', ')', ']', '”', '’', '」', '』', '）', '》'];

/// Byte ranges of the sentences of a whitespace-normalized paragraph.
///
/// A sentence ends after `.`, `!` or `?` (plus any closing quotes or
/// brackets) when whitespace, a CJK character or the end of the text
/// follows. Full-width `。！？` end a sentence unconditionally, so text
/// without spaces still splits.
pub fn sentence_spans(paragraph: &str) -> Vec<Range<usize>> {
    let chars: Vec<(usize, char)> = paragraph.char_indices().collect();
    let mut spans = Vec::new();
    let mut start = None;
    let mut i = 0;

    while i < chars.len() {
        let (at, c) = chars[i];
        i += 1;
        if c.is_whitespace() {
            continue;
        }
        let begin = *start.get_or_insert(at);
        if !TERMINATORS.contains(&c) {
            continue;
        }

        let mut end = i;
        while end < chars.len() && SENTENCE_CLOSERS.contains(&chars[end].1) {
            end += 1;
        }
        let next = chars.get(end).map(|&(_, n)| n);
        let full_width = matches!(c, '。' | '！' | '？');
        if full_width || next.is_none_or(|n| n.is_whitespace() || is_cjk(n)) {
            let stop = chars.get(end).map_or(paragraph.len(), |&(b, _)| b);
            spans.push(begin..stop);
            start = None;
            i = end;
        }
    }
    if let Some(begin) = start {
        spans.push(begin..paragraph.trim_end().len());
    }
    spans
}

/// True when `offset` is a char boundary strictly inside `text` where a cut
/// does not break a word.
pub fn is_word_boundary(text: &str, offset: usize) -> bool {
    if offset == 0 || offset >= text.len() || !text.is_char_boundary(offset) {
        return false;
    }
    match (text[..offset].chars().next_back(), text[offset..].chars().next()) {
        (Some(before), Some(after)) => is_break_between(before, after),
        _ => false,
    }
}
