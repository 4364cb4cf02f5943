//! Resumable streaming chunker.
//!
//! Groups newline-delimited paragraphs into [`StreamChunk`]s of at least
//! `threshold` characters while tracking an exact character cursor into the
//! sanitized text stream produced by [`UnicodeReader`].
//!
//! # Cursor rules
//!
//! - Each raw line advances the cursor by its length in chars plus one for
//!   its newline, whether or not it is emitted.
//! - Blank and whitespace-only lines advance the cursor but are never
//!   accumulated.
//! - A paragraph whose end (the position after its newline) is at or before
//!   the resume position is skipped. The first paragraph emitted is the one
//!   containing or following the resume position.
//! - A chunk's `end_position` is the resume point for everything after it:
//!   re-chunking from a chunk's `end_position` yields exactly the chunks that
//!   followed it in an uninterrupted run.
//! - The one exception to paragraph alignment: when the resume position falls
//!   strictly inside the unterminated final paragraph and that paragraph is
//!   longer than the threshold, the text before the resume position is
//!   dropped so hard-cut pieces are not emitted twice.
//!
//! Chunks are emitted as soon as their joined length reaches the threshold.
//! At end of stream the remainder is split at paragraph boundaries so no
//! trailing chunk exceeds the threshold; an oversized single paragraph is
//! hard-cut, preferring whitespace near the cut point.

use std::collections::VecDeque;
use std::io;
use std::path::Path;

use crate::config::ReaderConfig;
use crate::unicode::UnicodeReader;

/// How far back from a hard-cut point to look for whitespace.
const HARD_CUT_LOOKBACK: usize = 200;

/// One emitted span of document text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamChunk {
    pub content: String,
    /// Char offset of the first emitted character.
    pub start_position: u64,
    /// Char offset just past the chunk's last paragraph (including its newline).
    pub end_position: u64,
}

impl StreamChunk {
    pub fn char_len(&self) -> usize {
        self.content.chars().count()
    }
}

#[derive(Debug, Clone)]
struct Paragraph {
    start: u64,
    end: u64,
    text: String,
    chars: usize,
}

/// Iterator of [`StreamChunk`]s over a source of text batches.
pub struct Chunker<I> {
    source: I,
    threshold: usize,
    resume_from: u64,
    carry: String,
    position: u64,
    pending: Vec<Paragraph>,
    pending_chars: usize,
    ready: VecDeque<StreamChunk>,
    finished: bool,
}

/// Open `path` and chunk it from `resume_from`.
pub fn chunks(
    path: &Path,
    threshold: usize,
    resume_from: u64,
    reader: &ReaderConfig,
) -> io::Result<Chunker<UnicodeReader<std::fs::File>>> {
    let source = UnicodeReader::open(path, reader)?;
    Ok(Chunker::new(source, threshold, resume_from))
}

impl<I> Chunker<I>
where
    I: Iterator<Item = io::Result<String>>,
{
    pub fn new(source: I, threshold: usize, resume_from: u64) -> Self {
        Self {
            source,
            threshold: threshold.max(1),
            resume_from,
            carry: String::new(),
            position: 0,
            pending: Vec::new(),
            pending_chars: 0,
            ready: VecDeque::new(),
            finished: false,
        }
    }

    /// Cursor position consumed so far.
    pub fn position(&self) -> u64 {
        self.position
    }

    fn absorb(&mut self, batch: &str) {
        self.carry.push_str(batch);
        let mut consumed = 0;
        while let Some(idx) = self.carry[consumed..].find('\n') {
            let line_end = consumed + idx;
            let line = self.carry[consumed..line_end].to_string();
            self.take_line(&line, true);
            consumed = line_end + 1;
        }
        self.carry.replace_range(..consumed, "");
    }

    fn take_line(&mut self, line: &str, terminated: bool) {
        let line_start = self.position;
        let line_chars = line.chars().count() as u64;
        self.position += line_chars + u64::from(terminated);

        let trimmed = line.trim();
        if trimmed.is_empty() || self.position <= self.resume_from {
            return;
        }

        let leading = line.len() - line.trim_start().len();
        let start = line_start + line[..leading].chars().count() as u64;
        let chars = trimmed.chars().count();
        self.push_paragraph(Paragraph {
            start,
            end: self.position,
            text: trimmed.to_string(),
            chars,
        });

        if terminated && self.pending_chars >= self.threshold {
            let paragraphs = std::mem::take(&mut self.pending);
            self.pending_chars = 0;
            self.ready.push_back(join(&paragraphs));
        }
    }

    fn push_paragraph(&mut self, para: Paragraph) {
        if !self.pending.is_empty() {
            self.pending_chars += 1;
        }
        self.pending_chars += para.chars;
        self.pending.push(para);
    }

    fn finish(&mut self) {
        self.finished = true;
        if !self.carry.is_empty() {
            let line = std::mem::take(&mut self.carry);
            self.take_line(&line, false);
            self.drop_tail_before_resume();
        }
        let tail = std::mem::take(&mut self.pending);
        self.pending_chars = 0;
        for chunk in split_tail(tail, self.threshold) {
            self.ready.push_back(chunk);
        }
    }

    /// Trim an oversized unterminated paragraph that straddles the resume
    /// position down to the text at or after it.
    fn drop_tail_before_resume(&mut self) {
        let (resume, threshold) = (self.resume_from, self.threshold);
        let Some(last) = self.pending.last_mut() else {
            return;
        };
        if last.chars <= threshold || !(last.start < resume && resume < last.end) {
            return;
        }

        let skip = (resume - last.start) as usize;
        let rest: String = last.text.chars().skip(skip).collect();
        let kept = rest.trim_start();
        let lead = rest.chars().count() - kept.chars().count();
        if kept.is_empty() {
            self.pending.pop();
            return;
        }
        last.start = resume + lead as u64;
        last.text = kept.to_string();
        last.chars = last.text.chars().count();
    }
}

impl<I> Iterator for Chunker<I>
where
    I: Iterator<Item = io::Result<String>>,
{
    type Item = io::Result<StreamChunk>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(chunk) = self.ready.pop_front() {
                return Some(Ok(chunk));
            }
            if self.finished {
                return None;
            }
            match self.source.next() {
                Some(Ok(batch)) => self.absorb(&batch),
                Some(Err(e)) => {
                    self.finished = true;
                    return Some(Err(e));
                }
                None => self.finish(),
            }
        }
    }
}

fn join(paragraphs: &[Paragraph]) -> StreamChunk {
    let content = paragraphs
        .iter()
        .map(|p| p.text.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    StreamChunk {
        content,
        start_position: paragraphs.first().map(|p| p.start).unwrap_or(0),
        end_position: paragraphs.last().map(|p| p.end).unwrap_or(0),
    }
}

/// Split the end-of-stream remainder into chunks no larger than `threshold`,
/// breaking at paragraph boundaries and hard-cutting oversized paragraphs.
fn split_tail(paragraphs: Vec<Paragraph>, threshold: usize) -> Vec<StreamChunk> {
    let mut out = Vec::new();
    let mut group: Vec<Paragraph> = Vec::new();
    let mut group_chars = 0;

    for para in paragraphs {
        let would_be = if group.is_empty() {
            para.chars
        } else {
            group_chars + 1 + para.chars
        };
        if would_be <= threshold {
            group_chars = would_be;
            group.push(para);
            continue;
        }

        if !group.is_empty() {
            out.push(join(&group));
            group.clear();
            group_chars = 0;
        }
        if para.chars <= threshold {
            group_chars = para.chars;
            group.push(para);
        } else {
            out.extend(hard_split(&para, threshold));
        }
    }
    if !group.is_empty() {
        out.push(join(&group));
    }
    out
}

/// Cut one paragraph into pieces of at most `threshold` chars. A cut prefers
/// the last whitespace within [`HARD_CUT_LOOKBACK`] chars of the limit.
fn hard_split(para: &Paragraph, threshold: usize) -> Vec<StreamChunk> {
    let chars: Vec<char> = para.text.chars().collect();
    let mut pieces = Vec::new();
    let mut offset = 0;

    while offset < chars.len() {
        let remaining = chars.len() - offset;
        let mut cut = if remaining <= threshold {
            chars.len()
        } else {
            let limit = offset + threshold;
            let floor = limit.saturating_sub(HARD_CUT_LOOKBACK).max(offset + 1);
            (floor..limit)
                .rev()
                .find(|&i| chars[i].is_whitespace())
                .unwrap_or(limit)
        };
        if cut <= offset {
            cut = (offset + threshold).min(chars.len());
        }

        let content: String = chars[offset..cut].iter().collect::<String>().trim_end().to_string();
        let start_position = para.start + offset as u64;
        let end_position = if cut == chars.len() {
            para.end
        } else {
            para.start + cut as u64
        };
        if !content.is_empty() {
            pieces.push(StreamChunk {
                content,
                start_position,
                end_position,
            });
        }

        offset = cut;
        while offset < chars.len() && chars[offset].is_whitespace() {
            offset += 1;
        }
    }
    pieces
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batches(text: &str, size: usize) -> Vec<io::Result<String>> {
        let chars: Vec<char> = text.chars().collect();
        chars
            .chunks(size)
            .map(|c| Ok(c.iter().collect::<String>()))
            .collect()
    }

    fn run(text: &str, threshold: usize, resume: u64) -> Vec<StreamChunk> {
        Chunker::new(batches(text, 37).into_iter(), threshold, resume)
            .map(|c| c.unwrap())
            .collect()
    }

    /// 100 lines of 99 chars each, 10,000 chars in total.
    fn ten_thousand() -> String {
        (0..100)
            .map(|i| format!("{:0>99}\n", i))
            .collect::<String>()
    }

    #[test]
    fn test_ten_thousand_chars_five_chunks() {
        let chunks = run(&ten_thousand(), 2000, 0);
        let starts: Vec<u64> = chunks.iter().map(|c| c.start_position).collect();
        assert_eq!(starts, vec![0, 2100, 4200, 6300, 8400]);
        assert_eq!(chunks.last().unwrap().end_position, 10_000);
    }

    #[test]
    fn test_resume_skips_earlier_chunks() {
        let chunks = run(&ten_thousand(), 2000, 4500);
        assert_eq!(chunks[0].start_position, 4500);
        assert!(chunks[0].content.starts_with(&format!("{:0>99}", 45)));
        assert!(chunks.iter().all(|c| c.start_position >= 4500));
    }

    #[test]
    fn test_resume_mid_paragraph_starts_at_containing_paragraph() {
        let chunks = run(&ten_thousand(), 2000, 4550);
        assert_eq!(chunks[0].start_position, 4500);
    }

    #[test]
    fn test_resume_from_chunk_end_matches_uninterrupted_run() {
        let words = format!("intro\n{}", vec!["word"; 60].join(" "));
        let cases = [
            (ten_thousand(), 1500),
            ("x".repeat(250), 100),
            (words, 50),
        ];
        for (text, threshold) in &cases {
            let full = run(text, *threshold, 0);
            assert!(full.len() > 2);
            for (k, chunk) in full.iter().enumerate() {
                let resumed = run(text, *threshold, chunk.end_position);
                assert_eq!(resumed, full[k + 1..].to_vec(), "resume from {}", chunk.end_position);
            }
        }
    }

    #[test]
    fn test_resume_inside_hard_cut_tail_skips_emitted_pieces() {
        let chunks = run(&"x".repeat(250), 100, 100);
        let spans: Vec<(u64, u64)> = chunks.iter().map(|c| (c.start_position, c.end_position)).collect();
        assert_eq!(spans, vec![(100, 200), (200, 250)]);
    }

    #[test]
    fn test_resume_inside_short_tail_keeps_whole_paragraph() {
        let chunks = run("alpha\nbeta gamma", 100, 9);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].content, "beta gamma");
        assert_eq!(chunks[0].start_position, 6);
    }

    #[test]
    fn test_positions_non_decreasing() {
        let chunks = run(&ten_thousand(), 700, 0);
        for pair in chunks.windows(2) {
            assert!(pair[0].end_position <= pair[1].start_position);
            assert!(pair[0].start_position < pair[1].start_position);
        }
    }

    #[test]
    fn test_blank_lines_advance_cursor_only() {
        let chunks = run("alpha\n\n   \nbeta\n", 100, 0);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].content, "alpha\nbeta");
        assert_eq!(chunks[0].start_position, 0);
        assert_eq!(chunks[0].end_position, 16);
    }

    #[test]
    fn test_leading_whitespace_trimmed_with_exact_start() {
        let chunks = run("\n  indented text\n", 100, 0);
        assert_eq!(chunks[0].content, "indented text");
        assert_eq!(chunks[0].start_position, 3);
    }

    #[test]
    fn test_final_line_without_newline() {
        let chunks = run("one\ntwo", 100, 0);
        assert_eq!(chunks[0].content, "one\ntwo");
        assert_eq!(chunks[0].end_position, 7);
    }

    #[test]
    fn test_tail_split_at_paragraph_boundary() {
        // No newline at the end, so the last paragraph joins the tail that
        // is split at end of stream.
        let text = format!("{}\n{}\n{}", "a".repeat(40), "b".repeat(40), "c".repeat(40));
        let chunks = run(&text, 90, 0);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].content, format!("{}\n{}", "a".repeat(40), "b".repeat(40)));
        assert_eq!(chunks[1].content, "c".repeat(40));
        assert_eq!(chunks[1].start_position, 82);
        assert!(chunks.iter().all(|c| c.char_len() <= 90));
    }

    #[test]
    fn test_tail_hard_cut_prefers_whitespace() {
        let words = vec!["word"; 60].join(" ");
        let chunks = run(&words, 50, 0);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.char_len() <= 50);
            assert!(!chunk.content.starts_with(' '));
            assert!(chunk.content.ends_with("word"));
        }
        let rebuilt: Vec<&str> = chunks.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(rebuilt.join(" "), words);
        assert_eq!(chunks.last().unwrap().end_position, words.chars().count() as u64);
    }

    #[test]
    fn test_tail_hard_cut_without_whitespace() {
        let chunks = run(&"x".repeat(250), 100, 0);
        let lens: Vec<usize> = chunks.iter().map(|c| c.char_len()).collect();
        assert_eq!(lens, vec![100, 100, 50]);
        assert_eq!(chunks[1].start_position, 100);
    }

    #[test]
    fn test_multibyte_positions_count_chars() {
        let chunks = run("ééé\nüü\n", 3, 0);
        assert_eq!(chunks[0].content, "ééé");
        assert_eq!(chunks[0].end_position, 4);
        assert_eq!(chunks[1].start_position, 4);
    }

    #[test]
    fn test_resume_past_end_yields_nothing() {
        assert!(run(&ten_thousand(), 2000, 20_000).is_empty());
    }

    #[test]
    fn test_empty_input() {
        assert!(run("", 10, 0).is_empty());
    }

    #[test]
    fn test_source_error_propagates() {
        let source = vec![Ok("a\n".to_string()), Err(io::Error::other("boom"))];
        let mut chunker = Chunker::new(source.into_iter(), 100, 0);
        assert!(chunker.next().unwrap().is_err());
        assert!(chunker.next().is_none());
    }
}
