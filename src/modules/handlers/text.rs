//! Plain text handler using paragraph and indentation heuristics.

use std::path::Path;

use serde_json::Value;

use super::{
    load_utf8, split_chunk, HandlerResult, LineIndex, ParseContext, ParserHandler, SpanChunk,
};

pub struct TextHandler;

const NAME: &str = "text";
const VERSION: &str = "1.0.0";

impl ParserHandler for TextHandler {
    fn name(&self) -> &str {
        NAME
    }

    fn version(&self) -> &str {
        VERSION
    }

    fn parse(&self, path: &Path, context: &ParseContext) -> HandlerResult {
        let (text, file) = match load_utf8(path, NAME) {
            Ok(loaded) => loaded,
            Err(failed) => return failed,
        };
        let mut result = HandlerResult::new(file);
        if text.is_empty() {
            return result;
        }

        let (mut spans, mut strategy) = compute_spans(&text);
        if spans.is_empty() {
            spans = vec![(0, text.len())];
            strategy = "fallback";
        }

        let index = LineIndex::new(&text);
        let cap = context.max_tokens(NAME);
        for (start, end) in spans {
            let segment = &text[start..end];
            if segment.trim().is_empty() {
                continue;
            }
            let mut metadata = super::span_metadata(&text, start, end, &index);
            metadata.insert(
                "strategy".to_string(),
                Value::String(strategy.to_string()),
            );
            let span = SpanChunk {
                chunk_id: format!("{NAME}:{start}:{end}"),
                text: segment.to_string(),
                start_offset: start,
                end_offset: end,
                parent_symbol_id: None,
                delegate: None,
                metadata,
            };
            result.chunks.extend(split_chunk(span, cap, context.encoder));
        }

        // Whitespace-only files still persist one chunk so nothing is lost.
        if result.chunks.is_empty() {
            let mut metadata = super::span_metadata(&text, 0, text.len(), &index);
            metadata.insert(
                "strategy".to_string(),
                Value::String("fallback".to_string()),
            );
            let span = SpanChunk {
                chunk_id: format!("{NAME}:0:{}", text.len()),
                text: text.clone(),
                start_offset: 0,
                end_offset: text.len(),
                parent_symbol_id: None,
                delegate: None,
                metadata,
            };
            result.chunks.extend(split_chunk(span, cap, context.encoder));
        }

        result
    }
}

/// Chunk spans plus the heuristic that produced them. Paragraph breaks win
/// when they split the document; indentation blocks are the fallback.
fn compute_spans(text: &str) -> (Vec<(usize, usize)>, &'static str) {
    let paragraphs = paragraph_spans(text);
    if paragraphs.len() > 1 {
        return (paragraphs, "paragraph");
    }

    let indented = indentation_spans(text);
    if indented.len() > 1 {
        return (indented, "indentation");
    }

    if let Some(only) = paragraphs.first() {
        if *only != (0, text.len()) {
            return (paragraphs, "paragraph");
        }
    }
    if let Some(only) = indented.first() {
        if *only != (0, text.len()) {
            return (indented, "indentation");
        }
    }
    (Vec::new(), "fallback")
}

fn paragraph_spans(text: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut last = 0usize;
    let bytes = text.as_bytes();
    let mut cursor = 0usize;

    while cursor < bytes.len() {
        if bytes[cursor] == b'\n' {
            // Look for a blank-line run: `\n` followed by whitespace-only
            // content up to another `\n`.
            let mut probe = cursor + 1;
            while probe < bytes.len() && (bytes[probe] == b' ' || bytes[probe] == b'\t' || bytes[probe] == b'\r') {
                probe += 1;
            }
            if probe < bytes.len() && bytes[probe] == b'\n' {
                let end = probe + 1;
                if text[last..cursor].trim().is_empty() {
                    last = end;
                } else {
                    spans.push((last, end));
                    last = end;
                }
                cursor = end;
                continue;
            }
        }
        cursor += 1;
    }

    if last < text.len() && !text[last..].trim().is_empty() {
        spans.push((last, text.len()));
    }
    spans
}

fn indentation_spans(text: &str) -> Vec<(usize, usize)> {
    let lines = super::split_lines_keepends(text);
    if lines.is_empty() {
        return Vec::new();
    }
    let non_blank: Vec<&&str> = lines.iter().filter(|line| !line.trim().is_empty()).collect();
    if non_blank.is_empty() {
        return Vec::new();
    }
    let base_indent = non_blank.iter().map(|line| indent_width(line)).min().unwrap_or(0);
    if base_indent != 0 {
        return Vec::new();
    }

    let mut spans = Vec::new();
    let mut offset = 0usize;
    let mut current_start = 0usize;
    let mut have_block = false;
    let mut previous_end = 0usize;

    for line in &lines {
        let line_start = offset;
        let line_end = offset + line.len();
        offset = line_end;
        if line.trim().is_empty() {
            previous_end = line_end;
            continue;
        }
        let indent = indent_width(line);
        if !have_block {
            current_start = 0;
            have_block = true;
        } else if indent == base_indent && line_start != current_start {
            spans.push((current_start, previous_end));
            current_start = line_start;
        }
        previous_end = line_end;
    }
    if have_block {
        spans.push((current_start, text.len()));
    }

    spans
        .into_iter()
        .filter(|(start, end)| !text[*start..*end].trim().is_empty())
        .collect()
}

fn indent_width(line: &str) -> usize {
    line.len() - line.trim_start_matches([' ', '\t']).len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paragraph_spans_split_on_blank_lines() {
        let text = "first paragraph\n\nsecond paragraph\n";
        let spans = paragraph_spans(text);
        assert_eq!(spans.len(), 2);
        assert!(text[spans[0].0..spans[0].1].contains("first"));
        assert!(text[spans[1].0..spans[1].1].contains("second"));
    }

    #[test]
    fn test_indentation_spans_group_blocks() {
        let text = "block one\n  detail\nblock two\n  detail\n";
        let spans = indentation_spans(text);
        assert_eq!(spans.len(), 2);
    }

    #[test]
    fn test_single_paragraph_falls_through() {
        let (spans, strategy) = compute_spans("just one line");
        assert!(spans.is_empty() || strategy != "fallback");
    }
}
